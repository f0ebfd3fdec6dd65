use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use super::{CacheError, CodeSet, ReferenceCache};

#[derive(Debug, Clone)]
struct Cached {
    codes: CodeSet,
    expires_at: Option<Instant>,
}

/// In-memory reference cache for tests/dev.
///
/// Expiry follows the tokio clock, so paused-time tests can age entries out.
#[derive(Debug, Default)]
pub struct InMemoryReferenceCache {
    entries: RwLock<HashMap<String, Cached>>,
    fail_reads: AtomicBool,
}

impl InMemoryReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<I, S>(&self, key: impl Into<String>, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store(key.into(), codes.into_iter().map(Into::into).collect(), None);
    }

    pub fn insert_with_ttl<I, S>(&self, key: impl Into<String>, codes: I, ttl: Duration)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expires_at = Instant::now() + ttl;
        self.store(
            key.into(),
            codes.into_iter().map(Into::into).collect(),
            Some(expires_at),
        );
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn store(&self, key: String, codes: CodeSet, expires_at: Option<Instant>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, Cached { codes, expires_at });
        }
    }
}

#[async_trait::async_trait]
impl ReferenceCache for InMemoryReferenceCache {
    async fn get(&self, key: &str) -> Result<Option<CodeSet>, CacheError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("injected read failure".to_string()));
        }

        let entries = self
            .entries
            .read()
            .map_err(|_| CacheError::Unavailable("lock poisoned".to_string()))?;

        Ok(entries
            .get(key)
            .filter(|c| c.expires_at.is_none_or(|at| Instant::now() < at))
            .map(|c| c.codes.clone()))
    }
}
