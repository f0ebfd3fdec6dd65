//! Redis-backed reference cache (`GET` + JSON decode).

use std::sync::Arc;

use tracing::instrument;

use super::{CacheError, CodeSet, ReferenceCache, decode_allow_list};

#[derive(Debug, Clone)]
pub struct RedisReferenceCache {
    client: Arc<redis::Client>,
}

impl RedisReferenceCache {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }
}

#[async_trait::async_trait]
impl ReferenceCache for RedisReferenceCache {
    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> Result<Option<CodeSet>, CacheError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(format!("GET failed: {e}")))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| CacheError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        decode_allow_list(key, &value).map(Some)
    }
}
