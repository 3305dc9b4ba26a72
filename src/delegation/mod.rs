//! Delegation and federation.
//!
//! - `similarity` — query/descriptor scoring (cosine over embeddings)
//! - `scorer` — picks a delegate agent above a threshold
//! - `registry` — per-tenant agent profiles
//! - `federation` — weighted fan-out across document collections
//! - `index` — in-process vector index, the local collection querier
//! - `circuit` — per-downstream circuit breaker

pub mod circuit;
pub mod federation;
pub mod index;
pub mod registry;
pub mod scorer;
pub mod similarity;

pub use circuit::{CircuitBreaker, CircuitState};
pub use federation::{
    CollectionCandidate, CollectionQuerier, FederatedHit, FederatedResult, FederationEngine,
    SearchHit,
};
pub use index::VectorIndex;
pub use registry::{AgentProfile, AgentRegistry};
pub use scorer::{DelegationCandidate, DelegationDecision, DelegationScorer};
pub use similarity::{CosineScorer, Descriptor, SimilarityScorer};
