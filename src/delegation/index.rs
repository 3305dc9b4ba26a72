//! In-process vector index over processed documents.
//!
//! Holds `tenant → collection → document → chunks` with one vector per
//! chunk. A document scores as its best-matching chunk.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::federation::{CollectionQuerier, SearchHit};
use super::similarity::cosine_similarity;
use crate::context::ContextCarrier;
use crate::error::ServiceError;
use crate::worker::embedding::Embedder;

#[derive(Debug, Clone)]
struct IndexedChunk {
    text: String,
    vector: Vec<f32>,
}

type Collections = HashMap<String, HashMap<String, Vec<IndexedChunk>>>;

pub struct VectorIndex {
    embedder: Arc<dyn Embedder>,
    tenants: RwLock<HashMap<String, Collections>>,
}

impl VectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Arc<Self> {
        Arc::new(Self {
            embedder,
            tenants: RwLock::new(HashMap::new()),
        })
    }

    /// Replace a document's chunks. `chunks` and `vectors` pair up by index.
    pub async fn upsert(
        &self,
        tenant_id: &str,
        collection_id: &str,
        document_id: &str,
        chunks: &[String],
        vectors: &[Vec<f32>],
    ) {
        let indexed: Vec<IndexedChunk> = chunks
            .iter()
            .zip(vectors)
            .map(|(text, vector)| IndexedChunk {
                text: text.clone(),
                vector: vector.clone(),
            })
            .collect();
        debug!(tenant = %tenant_id, collection = %collection_id, document_id = %document_id, chunks = indexed.len(), "Document indexed");
        self.tenants
            .write()
            .await
            .entry(tenant_id.to_string())
            .or_default()
            .entry(collection_id.to_string())
            .or_default()
            .insert(document_id.to_string(), indexed);
    }

    pub async fn remove(&self, tenant_id: &str, collection_id: &str, document_id: &str) -> bool {
        let mut tenants = self.tenants.write().await;
        tenants
            .get_mut(tenant_id)
            .and_then(|c| c.get_mut(collection_id))
            .is_some_and(|docs| docs.remove(document_id).is_some())
    }

    pub async fn document_count(&self, tenant_id: &str, collection_id: &str) -> usize {
        self.tenants
            .read()
            .await
            .get(tenant_id)
            .and_then(|c| c.get(collection_id))
            .map_or(0, HashMap::len)
    }

    /// Best chunk per document, highest similarity first.
    async fn search(
        &self,
        tenant_id: &str,
        collection_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Vec<SearchHit> {
        let tenants = self.tenants.read().await;
        let Some(docs) = tenants.get(tenant_id).and_then(|c| c.get(collection_id)) else {
            return Vec::new();
        };

        let mut hits: Vec<SearchHit> = docs
            .iter()
            .filter_map(|(document_id, chunks)| {
                chunks
                    .iter()
                    .filter_map(|c| cosine_similarity(query, &c.vector).map(|s| (s, c)))
                    .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(score, chunk)| SearchHit {
                        document_id: document_id.clone(),
                        score,
                        content: serde_json::json!({ "text": chunk.text }),
                    })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        hits.truncate(limit);
        hits
    }
}

#[async_trait]
impl CollectionQuerier for VectorIndex {
    async fn query(
        &self,
        ctx: &ContextCarrier,
        collection_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, ServiceError> {
        let vector = self.embedder.embed(query).await?;
        Ok(self.search(ctx.tenant_id(), collection_id, &vector, limit).await)
    }
}
