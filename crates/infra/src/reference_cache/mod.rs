//! Read-only access to cached reference allow-lists.
//!
//! The cache is populated and expired by the reference-data service; the
//! pipeline only reads it. Keys are `{user_id}_{list1}_{list2}...` with the
//! list names in configured order.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::BTreeSet;

use serde_json::Value as JsonValue;
use thiserror::Error;

use claimflow_core::RequestingUser;

pub use in_memory::InMemoryReferenceCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisReferenceCache;

/// Set of valid codes for one cache key.
pub type CodeSet = BTreeSet<String>;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("reference cache unavailable: {0}")]
    Unavailable(String),

    #[error("cached allow-list for '{key}' could not be decoded: {reason}")]
    Decode { key: String, reason: String },
}

#[async_trait::async_trait]
pub trait ReferenceCache: Send + Sync {
    /// Allow-list stored under `key`, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<CodeSet>, CacheError>;
}

#[async_trait::async_trait]
impl<C> ReferenceCache for std::sync::Arc<C>
where
    C: ReferenceCache + ?Sized,
{
    async fn get(&self, key: &str) -> Result<Option<CodeSet>, CacheError> {
        (**self).get(key).await
    }
}

/// Cache key for a user and a set of reference-list names.
pub fn cache_key<S: AsRef<str>>(list_names: &[S], user: &RequestingUser) -> String {
    let mut key = user.id.clone();
    for name in list_names {
        key.push('_');
        key.push_str(name.as_ref());
    }
    key
}

/// Decode a cached allow-list value.
///
/// Accepts a plain array of codes, or the reference service response shape
/// `{"resultSet": [{"data": [{"code": ...}, ...]}, ...]}`.
pub fn decode_allow_list(key: &str, value: &JsonValue) -> Result<CodeSet, CacheError> {
    let decode_err = |reason: &str| CacheError::Decode {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if let Some(codes) = value.as_array() {
        return codes
            .iter()
            .map(|c| {
                c.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| decode_err("array entries must be strings"))
            })
            .collect();
    }

    let result_set = value
        .get("resultSet")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| decode_err("expected an array or an object with resultSet"))?;

    let mut codes = CodeSet::new();
    for list in result_set {
        let Some(data) = list.get("data").and_then(JsonValue::as_array) else {
            continue;
        };
        codes.extend(
            data.iter()
                .filter_map(|item| item.get("code").and_then(JsonValue::as_str))
                .map(str::to_string),
        );
    }
    Ok(codes)
}
