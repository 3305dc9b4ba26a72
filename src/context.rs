//! Request context carried with every operation and every enqueued job.
//!
//! A [`ContextCarrier`] is immutable: delegation and propagation produce new
//! values. Worker tasks receive it explicitly, either as a parameter or
//! rebuilt from a message envelope, never through task-local state.

use serde::{Deserialize, Serialize};

use crate::error::ContextError;

/// Tenant / agent / conversation / collection identifiers for a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextCarrier {
    tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collection_id: Option<String>,
    /// Agents that handed this request on, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    delegation_chain: Vec<String>,
}

impl ContextCarrier {
    /// Create a carrier for `tenant_id`. Empty tenants are rejected.
    pub fn new(tenant_id: impl Into<String>) -> Result<Self, ContextError> {
        let tenant_id = tenant_id.into();
        if tenant_id.trim().is_empty() {
            return Err(ContextError::MissingTenant);
        }
        Ok(Self {
            tenant_id,
            agent_id: None,
            conversation_id: None,
            collection_id: None,
            delegation_chain: Vec::new(),
        })
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = non_empty(agent_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = non_empty(conversation_id.into());
        self
    }

    pub fn with_collection(mut self, collection_id: impl Into<String>) -> Self {
        self.collection_id = non_empty(collection_id.into());
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn collection_id(&self) -> Option<&str> {
        self.collection_id.as_deref()
    }

    pub fn delegation_chain(&self) -> &[String] {
        &self.delegation_chain
    }

    /// Fails when the tenant is empty. Carriers deserialized from the wire
    /// bypass [`ContextCarrier::new`], so boundaries call this explicitly.
    pub fn require_tenant(&self) -> Result<&str, ContextError> {
        if self.tenant_id.trim().is_empty() {
            return Err(ContextError::MissingTenant);
        }
        Ok(&self.tenant_id)
    }

    /// Independent copy for a hand-off.
    pub fn propagate(&self) -> Self {
        self.clone()
    }

    /// Derive the carrier for executing on behalf of `agent_id`.
    ///
    /// The current agent is pushed onto the delegation chain. Delegating to
    /// an agent already in the chain, or past `max_depth` hops, fails.
    pub fn delegate_to(
        &self,
        agent_id: impl Into<String>,
        max_depth: usize,
    ) -> Result<Self, ContextError> {
        let target = agent_id.into();
        if target.trim().is_empty() {
            return Err(ContextError::InvalidField {
                field: "agent_id",
                reason: "delegation target is empty".into(),
            });
        }

        let mut chain = self.delegation_chain.clone();
        if let Some(current) = &self.agent_id {
            chain.push(current.clone());
        }

        if chain.iter().any(|a| a == &target) {
            return Err(ContextError::DelegationCycle { agent_id: target });
        }
        if chain.len() > max_depth {
            return Err(ContextError::DelegationDepthExceeded {
                depth: chain.len(),
                max: max_depth,
            });
        }

        Ok(Self {
            agent_id: Some(target),
            delegation_chain: chain,
            ..self.clone()
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() { None } else { Some(s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tenant_is_rejected() {
        assert_eq!(ContextCarrier::new("").unwrap_err(), ContextError::MissingTenant);
        assert_eq!(ContextCarrier::new("   ").unwrap_err(), ContextError::MissingTenant);
    }

    #[test]
    fn deserialized_empty_tenant_fails_require() {
        let ctx: ContextCarrier = serde_json::from_str(r#"{"tenant_id":""}"#).unwrap();
        assert_eq!(ctx.require_tenant().unwrap_err(), ContextError::MissingTenant);
    }

    #[test]
    fn delegation_does_not_mutate_caller() {
        let caller = ContextCarrier::new("t1")
            .unwrap()
            .with_agent("router")
            .with_conversation("conv-1");
        let delegated = caller.delegate_to("researcher", 3).unwrap();

        assert_eq!(caller.agent_id(), Some("router"));
        assert_eq!(delegated.agent_id(), Some("researcher"));
        assert_eq!(delegated.tenant_id(), "t1");
        assert_eq!(delegated.conversation_id(), Some("conv-1"));
        assert_eq!(delegated.delegation_chain(), ["router".to_string()]);
    }

    #[test]
    fn delegating_back_is_a_cycle() {
        let ctx = ContextCarrier::new("t1").unwrap().with_agent("a");
        let b = ctx.delegate_to("b", 5).unwrap();
        let err = b.delegate_to("a", 5).unwrap_err();
        assert_eq!(err, ContextError::DelegationCycle { agent_id: "a".into() });
    }

    #[test]
    fn self_delegation_is_a_cycle() {
        let ctx = ContextCarrier::new("t1").unwrap().with_agent("a");
        assert!(matches!(
            ctx.delegate_to("a", 5),
            Err(ContextError::DelegationCycle { .. })
        ));
    }

    #[test]
    fn depth_limit_applies() {
        let ctx = ContextCarrier::new("t1").unwrap().with_agent("a");
        let b = ctx.delegate_to("b", 1).unwrap();
        let err = b.delegate_to("c", 1).unwrap_err();
        assert_eq!(err, ContextError::DelegationDepthExceeded { depth: 2, max: 1 });
    }

    #[test]
    fn blank_optional_ids_are_dropped() {
        let ctx = ContextCarrier::new("t1").unwrap().with_agent("").with_collection(" ");
        assert!(ctx.agent_id().is_none());
        assert!(ctx.collection_id().is_none());
    }
}
