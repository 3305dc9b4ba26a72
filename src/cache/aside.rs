//! Cache-aside protocol: fast store, then durable store, then generation,
//! populating the fast store on every miss.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::key::CacheKey;
use crate::cache::store::FastStore;
use crate::cache::ttl::{DataType, TtlPolicy, TtlTier};
use crate::context::ContextCarrier;
use crate::error::{CacheError, Result};

/// Durable lookup consulted on a cache miss.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        ctx: &ContextCarrier,
        resource_id: &str,
    ) -> Result<Option<serde_json::Value>>;
}

/// Creates a value when neither the cache nor the durable store has it.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        ctx: &ContextCarrier,
        resource_id: &str,
    ) -> Result<Option<serde_json::Value>>;
}

/// Where a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Cache,
    Durable,
    Generated,
}

/// Lookup metrics returned with every value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub cache_hit: bool,
    pub source: CacheSource,
    pub key: String,
}

/// Outcome of a coordinated invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Whether the primary key held a live entry.
    pub primary_removed: bool,
    /// Related keys that were deleted (or already absent).
    pub related_cleared: Vec<String>,
    /// Related keys whose deletion failed, with the reason.
    pub related_failures: Vec<(String, String)>,
}

impl InvalidationReport {
    pub fn is_complete(&self) -> bool {
        self.related_failures.is_empty()
    }
}

/// Cache-aside layer over a shared [`FastStore`].
#[derive(Clone)]
pub struct CacheAside {
    store: Arc<dyn FastStore>,
    ttl: TtlPolicy,
}

impl CacheAside {
    pub fn new(store: Arc<dyn FastStore>, ttl: TtlPolicy) -> Self {
        Self { store, ttl }
    }

    pub fn store(&self) -> &Arc<dyn FastStore> {
        &self.store
    }

    /// Check the cache, then `fetcher`, then `generator`.
    ///
    /// Returns `Ok(None)` when every source misses. A failing fast store is
    /// treated as a miss: the durable store stays authoritative.
    pub async fn get_or_generate(
        &self,
        data_type: DataType,
        ctx: &ContextCarrier,
        resource_id: &str,
        fetcher: Option<&dyn Fetcher>,
        generator: Option<&dyn Generator>,
        ttl_override: Option<TtlTier>,
    ) -> Result<Option<(serde_json::Value, CacheMetrics)>> {
        ctx.require_tenant()?;
        let key = CacheKey::build(data_type, ctx, resource_id);

        match self.store.get(&key).await {
            Ok(Some(value)) => {
                debug!(key = %key, "Cache hit");
                return Ok(Some((value, metrics(&key, true, CacheSource::Cache))));
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Fast store read failed, falling through"),
        }

        let tier = ttl_override.unwrap_or_else(|| data_type.default_tier());

        if let Some(fetcher) = fetcher {
            if let Some(value) = fetcher.fetch(ctx, resource_id).await? {
                self.populate(&key, value.clone(), tier).await;
                return Ok(Some((value, metrics(&key, false, CacheSource::Durable))));
            }
        }

        if let Some(generator) = generator {
            if let Some(value) = generator.generate(ctx, resource_id).await? {
                self.populate(&key, value.clone(), tier).await;
                return Ok(Some((value, metrics(&key, false, CacheSource::Generated))));
            }
        }

        debug!(key = %key, "Cache-aside miss at every source");
        Ok(None)
    }

    /// Plain cache read, no fallbacks.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<serde_json::Value>> {
        Ok(self.store.get(key).await?)
    }

    /// Write-through helper: write `value` under `key` with `tier`
    /// (or the data type's default).
    pub async fn put(
        &self,
        key: &CacheKey,
        value: serde_json::Value,
        tier: Option<TtlTier>,
    ) -> Result<()> {
        let tier = tier.unwrap_or_else(|| key.data_type().default_tier());
        self.store.set(key, value, self.ttl.duration(tier)).await?;
        Ok(())
    }

    /// Remove a single key.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.store.delete(key).await?)
    }

    /// Invalidate `primary` and every key in `related`.
    ///
    /// All deletions are attempted. Related failures are logged and
    /// reported; a primary failure fails the whole operation.
    pub async fn invalidate_coordinated(
        &self,
        primary: &CacheKey,
        related: &[CacheKey],
    ) -> Result<InvalidationReport> {
        let (primary_result, related_results) = tokio::join!(
            self.store.delete(primary),
            join_all(related.iter().map(|k| self.store.delete(k)))
        );

        let mut report = InvalidationReport::default();
        for (key, result) in related.iter().zip(related_results) {
            match result {
                Ok(_) => report.related_cleared.push(key.to_string()),
                Err(e) => {
                    warn!(key = %key, error = %e, "Related cache invalidation failed");
                    report.related_failures.push((key.to_string(), e.to_string()));
                }
            }
        }

        match primary_result {
            Ok(removed) => {
                report.primary_removed = removed;
                debug!(
                    key = %primary,
                    related = report.related_cleared.len(),
                    failed = report.related_failures.len(),
                    "Coordinated invalidation done"
                );
                Ok(report)
            }
            Err(e) => Err(CacheError::PrimaryInvalidation {
                key: primary.to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    /// Invalidate a changed document and everything derived from it.
    ///
    /// Related set: the document's embedding and, when the context names a
    /// collection, that collection's vector store, semantic index and
    /// retrieval cache.
    pub async fn invalidate_document(
        &self,
        ctx: &ContextCarrier,
        document_id: &str,
    ) -> Result<InvalidationReport> {
        ctx.require_tenant()?;
        let primary = CacheKey::build(DataType::Document, ctx, document_id);
        self.invalidate_coordinated(&primary, &document_related_keys(ctx, document_id))
            .await
    }

    async fn populate(&self, key: &CacheKey, value: serde_json::Value, tier: TtlTier) {
        if let Err(e) = self.store.set(key, value, self.ttl.duration(tier)).await {
            warn!(key = %key, error = %e, "Failed to populate fast store");
        }
    }
}

/// Keys derived from a document.
pub fn document_related_keys(ctx: &ContextCarrier, document_id: &str) -> Vec<CacheKey> {
    let mut keys = vec![CacheKey::build(DataType::Embedding, ctx, document_id)];
    if let Some(collection) = ctx.collection_id() {
        keys.push(CacheKey::build(DataType::VectorStore, ctx, collection));
        keys.push(CacheKey::build(DataType::SemanticIndex, ctx, collection));
        keys.push(CacheKey::build(DataType::RetrievalCache, ctx, collection));
    }
    keys
}

fn metrics(key: &CacheKey, cache_hit: bool, source: CacheSource) -> CacheMetrics {
    CacheMetrics {
        cache_hit,
        source,
        key: key.to_string(),
    }
}
