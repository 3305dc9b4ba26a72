//! Built-in handlers for the four job types.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::embedding::Embedder;
use super::handler::{ExecutionContext, JobHandler};
use crate::cache::{CacheAside, CacheKey, DataType, Generator};
use crate::context::ContextCarrier;
use crate::delegation::{CollectionCandidate, FederationEngine, VectorIndex};
use crate::error::{JobError, Result, ServiceError};
use crate::jobs::JobType;
use crate::jobs::memo::{DELEGATED_TO_PARAM, params_hash};

fn parse_params<T: for<'de> Deserialize<'de>>(
    params: &serde_json::Value,
) -> std::result::Result<T, JobError> {
    serde_json::from_value(params.clone()).map_err(|e| JobError::InvalidParams(e.to_string()))
}

// ── Embedding ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingParams {
    Single { text: String },
    Batch { texts: Vec<String> },
}

impl EmbeddingParams {
    fn into_texts(self) -> Vec<String> {
        match self {
            Self::Single { text } => vec![text],
            Self::Batch { texts } => texts,
        }
    }
}

/// Generates an embedding on a cache miss.
struct EmbeddingGenerator<'a> {
    embedder: &'a dyn Embedder,
    text: &'a str,
}

#[async_trait]
impl Generator for EmbeddingGenerator<'_> {
    async fn generate(
        &self,
        _ctx: &ContextCarrier,
        _resource_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let vector = self.embedder.embed(self.text).await?;
        Ok(Some(serde_json::json!(vector)))
    }
}

/// Text → vector, cached per text on the extended tier.
pub struct EmbeddingRequestHandler {
    embedder: Arc<dyn Embedder>,
    cache: CacheAside,
}

impl EmbeddingRequestHandler {
    pub fn new(embedder: Arc<dyn Embedder>, cache: CacheAside) -> Self {
        Self { embedder, cache }
    }
}

#[async_trait]
impl JobHandler for EmbeddingRequestHandler {
    fn job_type(&self) -> JobType {
        JobType::EmbeddingRequest
    }

    fn validate(&self, params: &serde_json::Value) -> std::result::Result<(), JobError> {
        parse_params::<EmbeddingParams>(params).map(|_| ())
    }

    async fn execute(
        &self,
        exec: &ExecutionContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let texts = parse_params::<EmbeddingParams>(params)?.into_texts();
        let total = texts.len().max(1);
        let mut embeddings = Vec::with_capacity(texts.len());
        let mut cache_hits = 0;

        for (i, text) in texts.iter().enumerate() {
            exec.check_cancelled()?;
            let generator = EmbeddingGenerator {
                embedder: self.embedder.as_ref(),
                text,
            };
            let resource_id = params_hash(&serde_json::json!(text));
            let (vector, metrics) = self
                .cache
                .get_or_generate(
                    DataType::Embedding,
                    &exec.ctx,
                    &resource_id,
                    None,
                    Some(&generator),
                    None,
                )
                .await?
                .ok_or_else(|| JobError::Failed {
                    id: exec.job_id,
                    reason: "embedder produced no vector".into(),
                })?;
            if metrics.cache_hit {
                cache_hits += 1;
            }
            embeddings.push(vector);
            exec.report_progress((i + 1) as f32 / total as f32).await;
        }

        debug!(job_id = %exec.job_id, count = embeddings.len(), cache_hits, "Embeddings ready");
        Ok(serde_json::json!({
            "embeddings": embeddings,
            "dimensions": self.embedder.dimensions(),
            "cache_hits": cache_hits,
        }))
    }
}

// ── Document processing ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct DocumentParams {
    document_id: String,
    text: String,
    #[serde(default)]
    chunk_size: Option<usize>,
}

/// Chunks a document, embeds the chunks and refreshes its cache entries.
pub struct DocumentProcessingHandler {
    embedder: Arc<dyn Embedder>,
    cache: CacheAside,
    index: Option<Arc<VectorIndex>>,
    chunk_size: usize,
}

impl DocumentProcessingHandler {
    /// Words per chunk when the job does not say.
    pub const DEFAULT_CHUNK_SIZE: usize = 200;

    pub fn new(embedder: Arc<dyn Embedder>, cache: CacheAside) -> Self {
        Self {
            embedder,
            cache,
            index: None,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }

    /// Also index chunks under the context's collection.
    pub fn with_index(mut self, index: Arc<VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }
}

/// Split `text` into chunks of at most `size` whitespace-separated words.
pub fn chunk_words(text: &str, size: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(size.max(1))
        .map(|chunk| chunk.join(" "))
        .collect()
}

#[async_trait]
impl JobHandler for DocumentProcessingHandler {
    fn job_type(&self) -> JobType {
        JobType::DocumentProcessing
    }

    fn validate(&self, params: &serde_json::Value) -> std::result::Result<(), JobError> {
        let parsed = parse_params::<DocumentParams>(params)?;
        if parsed.document_id.trim().is_empty() {
            return Err(JobError::InvalidParams("document_id must not be empty".into()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        exec: &ExecutionContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let doc = parse_params::<DocumentParams>(params)?;
        let chunks = chunk_words(&doc.text, doc.chunk_size.unwrap_or(self.chunk_size));
        let total = chunks.len().max(1);

        let mut vectors = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            exec.check_cancelled()?;
            vectors.push(self.embedder.embed(chunk).await?);
            exec.report_progress((i + 1) as f32 / (total + 1) as f32).await;
        }
        exec.check_cancelled()?;

        // Derived entries of the previous version go first, then the fresh ones.
        let report = self.cache.invalidate_document(&exec.ctx, &doc.document_id).await?;
        let document_key = CacheKey::build(DataType::Document, &exec.ctx, &doc.document_id);
        self.cache
            .put(
                &document_key,
                serde_json::json!({"document_id": doc.document_id, "chunks": chunks}),
                None,
            )
            .await?;
        let embedding_key = CacheKey::build(DataType::Embedding, &exec.ctx, &doc.document_id);
        self.cache
            .put(&embedding_key, serde_json::json!(vectors), None)
            .await?;
        if let (Some(index), Some(collection)) = (&self.index, exec.ctx.collection_id()) {
            index
                .upsert(exec.ctx.tenant_id(), collection, &doc.document_id, &chunks, &vectors)
                .await;
        }

        info!(
            job_id = %exec.job_id,
            document_id = %doc.document_id,
            chunks = chunks.len(),
            invalidated = report.related_cleared.len(),
            "Document processed"
        );
        Ok(serde_json::json!({
            "document_id": doc.document_id,
            "chunks": chunks.len(),
            "dimensions": self.embedder.dimensions(),
            "invalidated": report.related_cleared,
            "invalidation_failures": report.related_failures.len(),
        }))
    }
}

// ── Federated query ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FederatedQueryParams {
    query: String,
    #[serde(default)]
    collections: Vec<CollectionCandidate>,
    #[serde(default)]
    explicit: Vec<String>,
}

/// Runs the federation engine. The context's collection, if any, counts
/// as an explicit selection.
pub struct FederatedQueryHandler {
    engine: Arc<FederationEngine>,
}

impl FederatedQueryHandler {
    pub fn new(engine: Arc<FederationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for FederatedQueryHandler {
    fn job_type(&self) -> JobType {
        JobType::FederatedQuery
    }

    fn validate(&self, params: &serde_json::Value) -> std::result::Result<(), JobError> {
        parse_params::<FederatedQueryParams>(params).map(|_| ())
    }

    async fn execute(
        &self,
        exec: &ExecutionContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut request = parse_params::<FederatedQueryParams>(params)?;
        if let Some(collection) = exec.ctx.collection_id() {
            if !request.explicit.iter().any(|c| c == collection) {
                request.explicit.push(collection.to_string());
            }
        }

        let result = tokio::select! {
            result = self.engine.federate(&exec.ctx, &request.query, &request.collections, &request.explicit) => result?,
            _ = exec.cancelled() => return Err(JobError::Cancelled { id: exec.job_id }.into()),
        };
        Ok(serde_json::to_value(&result).map_err(crate::error::CacheError::from)?)
    }
}

// ── Agent execution ─────────────────────────────────────────────────────

/// Runs a query on behalf of the context's agent.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &ContextCarrier,
        query: &str,
        params: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ServiceError>;
}

/// Reference executor: answers with the query and who handled it.
pub struct EchoExecutor;

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn execute(
        &self,
        ctx: &ContextCarrier,
        query: &str,
        _params: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, ServiceError> {
        Ok(serde_json::json!({
            "agent_id": ctx.agent_id(),
            "response": query,
            "delegation_chain": ctx.delegation_chain(),
        }))
    }
}

#[derive(Deserialize)]
struct AgentParams {
    query: String,
}

pub struct AgentExecutionHandler {
    executor: Arc<dyn AgentExecutor>,
}

impl AgentExecutionHandler {
    pub fn new(executor: Arc<dyn AgentExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl JobHandler for AgentExecutionHandler {
    fn job_type(&self) -> JobType {
        JobType::AgentExecution
    }

    fn validate(&self, params: &serde_json::Value) -> std::result::Result<(), JobError> {
        parse_params::<AgentParams>(params).map(|_| ())
    }

    async fn execute(
        &self,
        exec: &ExecutionContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let request = parse_params::<AgentParams>(params)?;
        exec.check_cancelled()?;

        let output = tokio::select! {
            output = self.executor.execute(&exec.ctx, &request.query, params) => output?,
            _ = exec.cancelled() => return Err(JobError::Cancelled { id: exec.job_id }.into()),
        };
        Ok(serde_json::json!({
            "output": output,
            "delegated_to": params.get(DELEGATED_TO_PARAM),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::cache::{InMemoryFastStore, TtlPolicy};
    use crate::config::{CircuitBreakerConfig, DelegationConfig};
    use crate::delegation::{CollectionQuerier, CosineScorer, Descriptor, SearchHit};
    use crate::error::Error;
    use crate::jobs::JobRegistry;
    use crate::notify::NotificationHub;
    use crate::retry::RetryPolicy;
    use crate::store::LibSqlBackend;
    use crate::worker::embedding::HashingEmbedder;

    fn cache() -> CacheAside {
        CacheAside::new(InMemoryFastStore::new(), TtlPolicy::default())
    }

    async fn exec(ctx: ContextCarrier, cache: CacheAside) -> (ExecutionContext, CancellationToken) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = Arc::new(JobRegistry::new(store, cache, NotificationHub::new(8)));
        let token = CancellationToken::new();
        (
            ExecutionContext::new(Uuid::new_v4(), ctx, token.clone(), registry),
            token,
        )
    }

    fn ctx() -> ContextCarrier {
        ContextCarrier::new("t1").unwrap().with_collection("C")
    }

    #[tokio::test]
    async fn embedding_results_are_cached() {
        let cache = cache();
        let handler = EmbeddingRequestHandler::new(Arc::new(HashingEmbedder::new(8)), cache.clone());
        let (exec, _) = exec(ctx(), cache).await;
        let params = serde_json::json!({"texts": ["alpha", "beta", "alpha"]});

        let out = handler.execute(&exec, &params).await.unwrap();
        assert_eq!(out["embeddings"].as_array().unwrap().len(), 3);
        assert_eq!(out["dimensions"], 8);
        assert_eq!(out["cache_hits"], 1);
    }

    #[tokio::test]
    async fn embedding_params_are_validated() {
        let handler = EmbeddingRequestHandler::new(Arc::new(HashingEmbedder::new(8)), cache());
        assert!(handler.validate(&serde_json::json!({"text": "ok"})).is_ok());
        assert!(matches!(
            handler.validate(&serde_json::json!({"txt": "typo"})),
            Err(JobError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_embedding_stops() {
        let handler = EmbeddingRequestHandler::new(Arc::new(HashingEmbedder::new(8)), cache());
        let (exec, token) = exec(ctx(), cache()).await;
        token.cancel();
        let err = handler
            .execute(&exec, &serde_json::json!({"text": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::Cancelled { .. })));
    }

    #[test]
    fn chunking_by_words() {
        assert_eq!(chunk_words("a b c d e", 2), ["a b", "c d", "e"]);
        assert!(chunk_words("   ", 3).is_empty());
    }

    #[tokio::test]
    async fn document_processing_refreshes_derived_entries() {
        let cache = cache();
        let stale_index = CacheKey::build(DataType::SemanticIndex, &ctx(), "C");
        cache.put(&stale_index, serde_json::json!("old"), None).await.unwrap();

        let embedder = Arc::new(HashingEmbedder::new(8));
        let index = VectorIndex::new(embedder.clone());
        let handler = DocumentProcessingHandler::new(embedder, cache.clone()).with_index(index.clone());
        let (exec, _) = exec(ctx(), cache.clone()).await;
        let out = handler
            .execute(
                &exec,
                &serde_json::json!({"document_id": "doc-1", "text": "one two three four five", "chunk_size": 2}),
            )
            .await
            .unwrap();

        assert_eq!(out["chunks"], 3);
        assert!(cache.get(&stale_index).await.unwrap().is_none());
        let embedding = CacheKey::build(DataType::Embedding, &ctx(), "doc-1");
        let vectors = cache.get(&embedding).await.unwrap().unwrap();
        assert_eq!(vectors.as_array().unwrap().len(), 3);
        assert_eq!(index.document_count("t1", "C").await, 1);
    }

    struct Fixed(HashMap<String, Vec<SearchHit>>);

    #[async_trait]
    impl CollectionQuerier for Fixed {
        async fn query(
            &self,
            _ctx: &ContextCarrier,
            collection_id: &str,
            _query: &str,
            _limit: usize,
        ) -> std::result::Result<Vec<SearchHit>, ServiceError> {
            Ok(self.0.get(collection_id).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn federated_query_includes_context_collection() {
        let hits = HashMap::from([(
            "C".to_string(),
            vec![SearchHit {
                document_id: "d".into(),
                score: 1.0,
                content: serde_json::Value::Null,
            }],
        )]);
        let engine = FederationEngine::new(
            Arc::new(CosineScorer::new(Arc::new(HashingEmbedder::new(64)))),
            Arc::new(Fixed(hits)),
            DelegationConfig::default(),
            CircuitBreakerConfig::default(),
            RetryPolicy::none(),
        );
        let handler = FederatedQueryHandler::new(Arc::new(engine));
        let (exec, _) = exec(ctx(), cache()).await;

        let candidates = vec![CollectionCandidate {
            collection_id: "other".into(),
            descriptor: Descriptor::Text("unrelated topic".into()),
        }];
        let out = handler
            .execute(&exec, &serde_json::json!({"query": "q", "collections": candidates}))
            .await
            .unwrap();
        assert_eq!(out["hits"][0]["collection_id"], "C");
    }

    #[tokio::test]
    async fn echo_agent_reports_delegate() {
        let handler = AgentExecutionHandler::new(Arc::new(EchoExecutor));
        let ctx = ContextCarrier::new("t1")
            .unwrap()
            .with_agent("router")
            .delegate_to("tax", 3)
            .unwrap();
        let (exec, _) = exec(ctx, cache()).await;

        let out = handler
            .execute(&exec, &serde_json::json!({"query": "hi", "delegated_to": "tax"}))
            .await
            .unwrap();
        assert_eq!(out["output"]["agent_id"], "tax");
        assert_eq!(out["output"]["delegation_chain"], serde_json::json!(["router"]));
        assert_eq!(out["delegated_to"], "tax");
    }
}
