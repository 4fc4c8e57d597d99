//! In-memory result cache keyed by source and parameter fingerprint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::data_source::SearchParams;
use crate::{CanonicalGrantRecord, SourceId, UtcDateTime};

/// Cache identity: the source plus a hash of the normalized request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub source: SourceId,
    pub param_hash: String,
}

impl CacheKey {
    pub fn new(source: SourceId, params: &SearchParams) -> Self {
        Self {
            source,
            param_hash: params.fingerprint(),
        }
    }
}

/// Shared record list as stored in the cache.
pub type CachedRecords = Arc<Vec<CanonicalGrantRecord>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    records: CachedRecords,
    expires_at: UtcDateTime,
}

/// Thread-safe result cache. Entries expire strictly at `stored_at + ttl`.
#[derive(Debug, Clone)]
pub struct CacheStore {
    inner: Arc<tokio::sync::RwLock<HashMap<CacheKey, CacheEntry>>>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Returns the cached records if present and not expired.
    pub async fn get(&self, key: &CacheKey) -> Option<CachedRecords> {
        let now = self.clock.now();
        let store = self.inner.read().await;
        store
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| Arc::clone(&entry.records))
    }

    /// Stores records for `ttl`. A zero TTL stores nothing.
    pub async fn put(&self, key: CacheKey, records: CachedRecords, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let expires_at = self.clock.now().saturating_add(ttl);
        let mut store = self.inner.write().await;
        store.insert(
            key,
            CacheEntry {
                records,
                expires_at,
            },
        );
    }

    /// Drops every entry, or only those for `source`. Returns the number removed.
    pub async fn flush(&self, source: Option<&SourceId>) -> usize {
        let mut store = self.inner.write().await;
        let before = store.len();
        match source {
            Some(source) => store.retain(|key, _| &key.source != source),
            None => store.clear(),
        }
        before - store.len()
    }

    /// Removes expired entries. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut store = self.inner.write().await;
        let before = store.len();
        store.retain(|_, entry| now < entry.expires_at);
        before - store.len()
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
