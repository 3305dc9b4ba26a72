//! Similarity scoring between a query and a candidate descriptor.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DelegationError;
use crate::worker::embedding::Embedder;

/// What a candidate is matched on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Descriptor {
    /// Precomputed embedding.
    Vector(Vec<f32>),
    /// Free-text description, embedded at scoring time.
    Text(String),
}

/// Scores how well a candidate matches a query.
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    /// Prepare the query once per request.
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, DelegationError>;

    async fn score(&self, query: &[f32], descriptor: &Descriptor) -> Result<f32, DelegationError>;
}

/// Cosine similarity over embeddings.
pub struct CosineScorer {
    embedder: Arc<dyn Embedder>,
}

impl CosineScorer {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl SimilarityScorer for CosineScorer {
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, DelegationError> {
        self.embedder
            .embed(query)
            .await
            .map_err(|e| DelegationError::Embedding(e.to_string()))
    }

    async fn score(&self, query: &[f32], descriptor: &Descriptor) -> Result<f32, DelegationError> {
        let embedded;
        let vector = match descriptor {
            Descriptor::Vector(v) => v.as_slice(),
            Descriptor::Text(text) => {
                embedded = self
                    .embedder
                    .embed(text)
                    .await
                    .map_err(|e| DelegationError::Embedding(e.to_string()))?;
                embedded.as_slice()
            }
        };
        cosine_similarity(query, vector).ok_or_else(|| DelegationError::Embedding(format!(
            "dimension mismatch: query {} vs descriptor {}",
            query.len(),
            vector.len()
        )))
    }
}

/// Cosine of the angle between `a` and `b`; 0 when either is all zeros,
/// `None` when lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }
    Some(dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::embedding::HashingEmbedder;

    #[test]
    fn cosine_basics() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), None);
    }

    #[tokio::test]
    async fn text_descriptor_is_embedded() {
        let scorer = CosineScorer::new(Arc::new(HashingEmbedder::new(32)));
        let query = scorer.embed_query("legal contracts").await.unwrap();
        let score = scorer
            .score(&query, &Descriptor::Text("legal contracts".into()))
            .await
            .unwrap();
        assert!((score - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn mismatched_vector_is_an_error() {
        let scorer = CosineScorer::new(Arc::new(HashingEmbedder::new(32)));
        let query = scorer.embed_query("anything").await.unwrap();
        assert!(scorer.score(&query, &Descriptor::Vector(vec![1.0])).await.is_err());
    }
}
