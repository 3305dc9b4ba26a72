//! Agent registry — per-tenant agent profiles consulted for delegation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::scorer::DelegationCandidate;
use super::similarity::Descriptor;
use crate::error::ConfigError;

/// What the registry knows about one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: String,
    pub description: String,
    /// Precomputed embedding of the description, if available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default = "accepts_by_default")]
    pub accepts_delegation: bool,
}

fn accepts_by_default() -> bool {
    true
}

impl AgentProfile {
    pub fn new(agent_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            description: description.into(),
            embedding: None,
            accepts_delegation: true,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn refusing_delegation(mut self) -> Self {
        self.accepts_delegation = false;
        self
    }

    pub fn to_candidate(&self) -> DelegationCandidate {
        let descriptor = match &self.embedding {
            Some(v) => Descriptor::Vector(v.clone()),
            None => Descriptor::Text(self.description.clone()),
        };
        DelegationCandidate {
            candidate_id: self.agent_id.clone(),
            descriptor,
            accepts_delegation: self.accepts_delegation,
        }
    }
}

/// Tenant → agent → profile. Lookups take the read lock, mutations the
/// write lock.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, HashMap<String, AgentProfile>>>,
}

impl AgentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace a profile. Returns the previous one.
    pub async fn upsert(&self, tenant_id: &str, profile: AgentProfile) -> Option<AgentProfile> {
        debug!(tenant = %tenant_id, agent_id = %profile.agent_id, "Agent profile registered");
        self.agents
            .write()
            .await
            .entry(tenant_id.to_string())
            .or_default()
            .insert(profile.agent_id.clone(), profile)
    }

    /// Load profiles from a JSON file mapping tenant ids to profile lists:
    ///
    /// ```json
    /// {"acme": [{"agent_id": "tax", "description": "tax filing questions"}]}
    /// ```
    ///
    /// Returns the number of profiles registered.
    pub async fn load_file(&self, path: &Path) -> Result<usize, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let seeded: HashMap<String, Vec<AgentProfile>> =
            serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                key: path.display().to_string(),
                message: e.to_string(),
            })?;

        let mut count = 0;
        for (tenant_id, profiles) in seeded {
            for profile in profiles {
                self.upsert(&tenant_id, profile).await;
                count += 1;
            }
        }
        info!(path = %path.display(), agents = count, "Agent profiles loaded");
        Ok(count)
    }

    pub async fn remove(&self, tenant_id: &str, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        let Some(tenant) = agents.get_mut(tenant_id) else {
            return false;
        };
        let removed = tenant.remove(agent_id).is_some();
        if tenant.is_empty() {
            agents.remove(tenant_id);
        }
        removed
    }

    pub async fn get(&self, tenant_id: &str, agent_id: &str) -> Option<AgentProfile> {
        self.agents
            .read()
            .await
            .get(tenant_id)
            .and_then(|t| t.get(agent_id))
            .cloned()
    }

    /// All profiles of a tenant, ordered by agent id.
    pub async fn list(&self, tenant_id: &str) -> Vec<AgentProfile> {
        let agents = self.agents.read().await;
        let mut profiles: Vec<AgentProfile> = agents
            .get(tenant_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        profiles.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        profiles
    }

    pub async fn delegation_candidates(&self, tenant_id: &str) -> Vec<DelegationCandidate> {
        self.list(tenant_id)
            .await
            .iter()
            .map(AgentProfile::to_candidate)
            .collect()
    }
}
