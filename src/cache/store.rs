//! Fast store backing the cache-aside layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::cache::key::CacheKey;
use crate::error::CacheError;

/// Keyed store with per-entry expiry.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Live value for `key`, if any.
    async fn get(&self, key: &CacheKey) -> Result<Option<serde_json::Value>, CacheError>;

    /// Write `value`; `ttl = None` never expires.
    async fn set(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    /// Remove `key`. Returns whether a live entry existed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> usize;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: serde_json::Value,
    written_at: DateTime<Utc>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Process-local fast store. Shared by all tenants; isolation comes from
/// tenant-prefixed keys.
#[derive(Default)]
pub struct InMemoryFastStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl InMemoryFastStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// When the live entry for `key` was written.
    pub async fn written_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().await;
        entries
            .get(key.as_str())
            .filter(|e| !e.is_expired(Instant::now()))
            .map(|e| e.written_at)
    }
}

#[async_trait]
impl FastStore for InMemoryFastStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<serde_json::Value>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key.as_str())
            .filter(|e| !e.is_expired(Instant::now()))
            .map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let entry = StoredEntry {
            value,
            written_at: Utc::now(),
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.entries
            .write()
            .await
            .insert(key.as_str().to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let removed = self.entries.write().await.remove(key.as_str());
        Ok(removed.is_some_and(|e| !e.is_expired(Instant::now())))
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }
}

/// Spawn a background task that periodically sweeps expired entries.
pub fn spawn_sweep_task(
    store: Arc<dyn FastStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired().await;
            if purged > 0 {
                debug!(count = purged, "Purged expired cache entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ttl::DataType;
    use crate::context::ContextCarrier;

    fn key(resource: &str) -> CacheKey {
        CacheKey::build(DataType::Document, &ContextCarrier::new("t1").unwrap(), resource)
    }

    #[tokio::test]
    async fn set_get_delete() {
        let store = InMemoryFastStore::new();
        store.set(&key("a"), serde_json::json!(1), None).await.unwrap();
        assert!(store.written_at(&key("a")).await.is_some());
        assert_eq!(store.get(&key("a")).await.unwrap(), Some(serde_json::json!(1)));
        assert!(store.delete(&key("a")).await.unwrap());
        assert!(store.get(&key("a")).await.unwrap().is_none());
        assert!(!store.delete(&key("a")).await.unwrap());
    }

    #[tokio::test]
    async fn entries_expire() {
        let store = InMemoryFastStore::new();
        store
            .set(&key("short"), serde_json::json!("v"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        store.set(&key("forever"), serde_json::json!("v"), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get(&key("short")).await.unwrap().is_none());
        assert!(store.get(&key("forever")).await.unwrap().is_some());
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }
}
