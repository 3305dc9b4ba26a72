//! Federated query across document collections.
//!
//! Collections are scored against the query, the relevant ones are queried
//! concurrently, and their hits are merged by weighted score.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::circuit::CircuitBreaker;
use super::similarity::{Descriptor, SimilarityScorer};
use crate::cache::{CacheAside, CacheKey, DataType};
use crate::config::{CircuitBreakerConfig, DelegationConfig};
use crate::context::ContextCarrier;
use crate::error::{DelegationError, Result, ServiceError};
use crate::jobs::memo::params_hash;
use crate::retry::RetryPolicy;

/// A collection that may take part in a federated query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionCandidate {
    pub collection_id: String,
    pub descriptor: Descriptor,
}

/// One hit returned by a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub document_id: String,
    pub score: f32,
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Runs a query against one collection.
#[async_trait]
pub trait CollectionQuerier: Send + Sync {
    async fn query(
        &self,
        ctx: &ContextCarrier,
        collection_id: &str,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<SearchHit>, ServiceError>;
}

/// A merged hit with its collection weight applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedHit {
    pub collection_id: String,
    pub document_id: String,
    pub score: f32,
    pub weight: f32,
    pub final_score: f32,
    #[serde(default)]
    pub content: serde_json::Value,
}

/// A collection chosen for the query and its weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncludedCollection {
    pub collection_id: String,
    pub weight: f32,
    pub explicit: bool,
}

/// Result of a federated query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederatedResult {
    pub hits: Vec<FederatedHit>,
    pub included: Vec<IncludedCollection>,
    /// Collections that failed to score or to answer, with the reason.
    pub failures: Vec<(String, String)>,
    /// Served from the fast store.
    #[serde(skip)]
    pub from_cache: bool,
}

/// Scores collections and merges their answers.
pub struct FederationEngine {
    scorer: Arc<dyn SimilarityScorer>,
    querier: Arc<dyn CollectionQuerier>,
    cache: Option<CacheAside>,
    config: DelegationConfig,
    circuit: CircuitBreakerConfig,
    retry: RetryPolicy,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl FederationEngine {
    pub fn new(
        scorer: Arc<dyn SimilarityScorer>,
        querier: Arc<dyn CollectionQuerier>,
        config: DelegationConfig,
        circuit: CircuitBreakerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            scorer,
            querier,
            cache: None,
            config,
            circuit,
            retry,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Cache merged results under `FederatedResults`.
    pub fn with_cache(mut self, cache: CacheAside) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run `query` across the relevant collections.
    ///
    /// Candidates scoring at least the inclusion threshold take part with
    /// their score as weight. Explicitly selected collections always take
    /// part, weighted no lower than the explicit floor. A failing
    /// collection is skipped; only when every included collection fails is
    /// the call an error.
    pub async fn federate(
        &self,
        ctx: &ContextCarrier,
        query: &str,
        candidates: &[CollectionCandidate],
        explicit: &[String],
    ) -> Result<FederatedResult> {
        ctx.require_tenant()?;

        let cache_key = self.cache_key(ctx, query, candidates, explicit);
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(value) = cache.get(key).await? {
                match serde_json::from_value::<FederatedResult>(value) {
                    Ok(mut cached) => {
                        debug!(key = %key, "Federated result served from cache");
                        cached.from_cache = true;
                        return Ok(cached);
                    }
                    Err(e) => warn!(key = %key, error = %e, "Discarding unreadable cached result"),
                }
            }
        }

        let mut result = FederatedResult::default();
        result.included = self.select_collections(query, candidates, explicit, &mut result.failures).await?;
        if result.included.is_empty() {
            if !candidates.is_empty() && result.failures.len() == candidates.len() {
                return Err(DelegationError::AllFailed {
                    count: candidates.len(),
                    failures: result
                        .failures
                        .iter()
                        .map(|(id, reason)| {
                            DelegationError::Scoring {
                                candidate: id.clone(),
                                reason: reason.clone(),
                            }
                            .to_string()
                        })
                        .collect(),
                }
                .into());
            }
            debug!(candidates = candidates.len(), "No collection relevant to query");
            return Ok(result);
        }

        let answers = join_all(
            result
                .included
                .iter()
                .map(|included| self.query_collection(ctx, &included.collection_id, query)),
        )
        .await;

        let mut hits = Vec::new();
        let mut answered = 0;
        for (included, answer) in result.included.iter().zip(answers) {
            match answer {
                Ok(collection_hits) => {
                    answered += 1;
                    hits.extend(collection_hits.into_iter().map(|hit| FederatedHit {
                        collection_id: included.collection_id.clone(),
                        document_id: hit.document_id,
                        score: hit.score,
                        weight: included.weight,
                        final_score: hit.score * included.weight,
                        content: hit.content,
                    }));
                }
                Err(e) => {
                    warn!(collection = %included.collection_id, error = %e, "Collection query failed, skipping");
                    result
                        .failures
                        .push((included.collection_id.clone(), e.to_string()));
                }
            }
        }

        if answered == 0 {
            return Err(DelegationError::AllFailed {
                count: result.included.len(),
                failures: result
                    .failures
                    .iter()
                    .map(|(id, reason)| format!("{id}: {reason}"))
                    .collect(),
            }
            .into());
        }

        hits.sort_by(|a, b| {
            b.final_score
                .total_cmp(&a.final_score)
                .then_with(|| a.collection_id.cmp(&b.collection_id))
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        hits.truncate(self.config.top_n);
        result.hits = hits;

        info!(
            collections = result.included.len(),
            failed = result.failures.len(),
            hits = result.hits.len(),
            "Federated query complete"
        );

        // Partial answers are not cached; the failing collections may recover.
        let cacheable = result.failures.is_empty();
        if let (true, Some(cache), Some(key)) = (cacheable, &self.cache, &cache_key) {
            match serde_json::to_value(&result) {
                Ok(value) => {
                    if let Err(e) = cache.put(key, value, None).await {
                        warn!(key = %key, error = %e, "Failed to cache federated result");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize federated result"),
            }
        }
        Ok(result)
    }

    /// Breaker guarding `collection_id`, created on first use.
    pub async fn breaker(&self, collection_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(collection_id) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .await
            .entry(collection_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(collection_id, self.circuit.clone())))
            .clone()
    }

    async fn select_collections(
        &self,
        query: &str,
        candidates: &[CollectionCandidate],
        explicit: &[String],
        failures: &mut Vec<(String, String)>,
    ) -> Result<Vec<IncludedCollection>> {
        let explicit: BTreeSet<&str> = explicit.iter().map(String::as_str).collect();
        let query_vector = match self.scorer.embed_query(query).await {
            Ok(vector) => Some(vector),
            // Explicit selections do not depend on scoring.
            Err(e) if !explicit.is_empty() => {
                warn!(error = %e, "Query embedding failed, querying explicit collections only");
                for candidate in candidates {
                    if !explicit.contains(candidate.collection_id.as_str()) {
                        failures.push((candidate.collection_id.clone(), e.to_string()));
                    }
                }
                None
            }
            Err(e) => return Err(e.into()),
        };

        let mut included = Vec::new();
        for candidate in candidates {
            let is_explicit = explicit.contains(candidate.collection_id.as_str());
            let scored = match &query_vector {
                Some(vector) => Some(self.scorer.score(vector, &candidate.descriptor).await),
                None => None,
            };
            let score = match scored {
                None => None,
                Some(Ok(score)) => Some(score),
                Some(Err(e)) => {
                    warn!(collection = %candidate.collection_id, error = %e, "Collection scoring failed");
                    if !is_explicit {
                        failures.push((candidate.collection_id.clone(), e.to_string()));
                    }
                    None
                }
            };

            let weight = match (score, is_explicit) {
                (Some(score), true) => score.max(self.config.explicit_weight_floor),
                (None, true) => self.config.explicit_weight_floor,
                (Some(score), false) if score >= self.config.inclusion_threshold => score,
                _ => continue,
            };
            included.push(IncludedCollection {
                collection_id: candidate.collection_id.clone(),
                weight,
                explicit: is_explicit,
            });
        }

        // Explicit selections without a descriptor still take part.
        for id in explicit {
            if !candidates.iter().any(|c| c.collection_id == id) {
                included.push(IncludedCollection {
                    collection_id: id.to_string(),
                    weight: self.config.explicit_weight_floor,
                    explicit: true,
                });
            }
        }
        Ok(included)
    }

    /// Query one collection under its breaker, timeout and retry policy.
    async fn query_collection(
        &self,
        ctx: &ContextCarrier,
        collection_id: &str,
        query: &str,
    ) -> std::result::Result<Vec<SearchHit>, ServiceError> {
        let breaker = self.breaker(collection_id).await;
        let timeout = self.config.collection_timeout;
        let limit = self.config.top_n;

        self.retry
            .retry(
                |attempt| {
                    let breaker = breaker.clone();
                    async move {
                        breaker
                            .call(|| async {
                                match tokio::time::timeout(
                                    timeout,
                                    self.querier.query(ctx, collection_id, query, limit),
                                )
                                .await
                                {
                                    Ok(answer) => answer,
                                    Err(_) => Err(ServiceError::Timeout {
                                        service: collection_id.to_string(),
                                        timeout,
                                    }),
                                }
                            })
                            .await
                            .inspect_err(|e| {
                                debug!(collection = %collection_id, attempt, error = %e, "Collection attempt failed");
                            })
                    }
                },
                ServiceError::is_transient,
            )
            .await
    }

    fn cache_key(
        &self,
        ctx: &ContextCarrier,
        query: &str,
        candidates: &[CollectionCandidate],
        explicit: &[String],
    ) -> Option<CacheKey> {
        self.cache.as_ref()?;
        let collections: BTreeSet<&str> = candidates.iter().map(|c| c.collection_id.as_str()).collect();
        let explicit: BTreeSet<&str> = explicit.iter().map(String::as_str).collect();
        let resource = params_hash(&serde_json::json!({
            "query": query,
            "collections": collections,
            "explicit": explicit,
        }));
        Some(CacheKey::build(DataType::FederatedResults, ctx, &resource))
    }
}
