//! Data types and TTL tiers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;

/// Named expiry class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlTier {
    /// Volatile results.
    Short,
    /// Configuration and handles.
    Standard,
    /// Embeddings and stable artifacts.
    Extended,
    /// Never expires.
    Permanent,
}

/// Kind of cached value. Determines the default tier and which optional
/// context segments participate in the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    JobStatus,
    JobResult,
    FederatedResults,
    RetrievalCache,
    Configuration,
    VectorStore,
    SemanticIndex,
    AgentProfile,
    Embedding,
    Document,
    BatchArtifact,
}

/// Which optional context segments a data type's key includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyScope {
    pub agent: bool,
    pub collection: bool,
    pub conversation: bool,
}

impl KeyScope {
    pub const TENANT: Self = Self {
        agent: false,
        collection: false,
        conversation: false,
    };
    pub const COLLECTION: Self = Self {
        agent: false,
        collection: true,
        conversation: false,
    };
    pub const AGENT: Self = Self {
        agent: true,
        collection: false,
        conversation: false,
    };
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobStatus => "job_status",
            Self::JobResult => "job_result",
            Self::FederatedResults => "federated_results",
            Self::RetrievalCache => "retrieval_cache",
            Self::Configuration => "configuration",
            Self::VectorStore => "vector_store",
            Self::SemanticIndex => "semantic_index",
            Self::AgentProfile => "agent_profile",
            Self::Embedding => "embedding",
            Self::Document => "document",
            Self::BatchArtifact => "batch_artifact",
        }
    }

    /// Tier used when a call gives no override.
    pub fn default_tier(&self) -> TtlTier {
        match self {
            Self::JobStatus | Self::JobResult | Self::FederatedResults | Self::RetrievalCache => {
                TtlTier::Short
            }
            Self::Configuration | Self::VectorStore | Self::SemanticIndex | Self::AgentProfile => {
                TtlTier::Standard
            }
            Self::Embedding | Self::Document | Self::BatchArtifact => TtlTier::Extended,
        }
    }

    /// Optional segments folded into the key.
    ///
    /// Job records are tenant-scoped so any caller in the tenant resolves
    /// the same slot; collection artifacts are scoped to their collection.
    pub fn key_scope(&self) -> KeyScope {
        match self {
            Self::JobStatus | Self::JobResult | Self::Configuration | Self::BatchArtifact => {
                KeyScope::TENANT
            }
            Self::FederatedResults
            | Self::RetrievalCache
            | Self::VectorStore
            | Self::SemanticIndex
            | Self::Embedding
            | Self::Document => KeyScope::COLLECTION,
            Self::AgentProfile => KeyScope::AGENT,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier → duration mapping.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    short: Duration,
    standard: Duration,
    extended: Duration,
}

impl TtlPolicy {
    /// `None` means the entry never expires.
    pub fn duration(&self, tier: TtlTier) -> Option<Duration> {
        match tier {
            TtlTier::Short => Some(self.short),
            TtlTier::Standard => Some(self.standard),
            TtlTier::Extended => Some(self.extended),
            TtlTier::Permanent => None,
        }
    }
}

impl From<&CacheConfig> for TtlPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            short: config.short_ttl,
            standard: config.standard_ttl,
            extended: config.extended_ttl,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}
