//! Message envelope shared by the work queue and service-to-service
//! notifications, plus the queue naming convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ContextCarrier;
use crate::error::{ContextError, EnvelopeError, ErrorInfo};

/// Current envelope schema version.
pub const SCHEMA_VERSION: &str = "1.0";

/// Lifecycle status of an enveloped task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// `{domain, action}` routing type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageType {
    pub domain: String,
    pub action: String,
}

impl MessageType {
    pub fn new(domain: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            action: action.into(),
        }
    }
}

/// Envelope wrapping every unit of work that crosses a queue or service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: Uuid,
    pub task_id: Uuid,
    pub tenant_id: String,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub schema_version: String,
    pub status: EnvelopeStatus,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub source_service: String,
    pub target_service: String,
    pub payload: serde_json::Value,
    /// 0 is highest, 9 lowest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl MessageEnvelope {
    /// New pending envelope for `task_id`, carrying `ctx`.
    pub fn new(
        ctx: &ContextCarrier,
        task_id: Uuid,
        message_type: MessageType,
        source_service: impl Into<String>,
        target_service: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut envelope = Self {
            message_id: Uuid::new_v4(),
            task_id,
            tenant_id: ctx.tenant_id().to_string(),
            correlation_id: Uuid::new_v4(),
            created_at: Utc::now(),
            schema_version: SCHEMA_VERSION.to_string(),
            status: EnvelopeStatus::Pending,
            message_type,
            source_service: source_service.into(),
            target_service: target_service.into(),
            payload,
            priority: None,
            metadata: None,
            error: None,
        };
        envelope.attach_context(ctx);
        envelope
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Store the carrier under `metadata.context`, keeping other metadata.
    fn attach_context(&mut self, ctx: &ContextCarrier) {
        let context = serde_json::to_value(ctx).unwrap_or(serde_json::Value::Null);
        match self.metadata.as_mut().and_then(|m| m.as_object_mut()) {
            Some(map) => {
                map.insert("context".to_string(), context);
            }
            None => {
                self.metadata = Some(serde_json::json!({ "context": context }));
            }
        }
    }

    /// Rebuild the carrier on the receiving side.
    ///
    /// The envelope's `tenant_id` is authoritative; a mismatching carrier
    /// in metadata is rejected.
    pub fn context(&self) -> Result<ContextCarrier, ContextError> {
        let embedded = self
            .metadata
            .as_ref()
            .and_then(|m| m.get("context"))
            .cloned()
            .map(serde_json::from_value::<ContextCarrier>)
            .transpose()
            .map_err(|e| ContextError::InvalidField {
                field: "metadata.context",
                reason: e.to_string(),
            })?;

        match embedded {
            Some(ctx) => {
                ctx.require_tenant()?;
                if ctx.tenant_id() != self.tenant_id {
                    return Err(ContextError::InvalidField {
                        field: "tenant_id",
                        reason: "envelope and context tenants differ".into(),
                    });
                }
                Ok(ctx)
            }
            None => ContextCarrier::new(self.tenant_id.clone()),
        }
    }

    /// Check required fields and ranges.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.tenant_id.trim().is_empty() {
            return Err(EnvelopeError::MissingField("tenant_id"));
        }
        if self.schema_version.is_empty() {
            return Err(EnvelopeError::MissingField("schema_version"));
        }
        if self.source_service.is_empty() {
            return Err(EnvelopeError::MissingField("source_service"));
        }
        if self.target_service.is_empty() {
            return Err(EnvelopeError::MissingField("target_service"));
        }
        if self.message_type.domain.is_empty() || self.message_type.action.is_empty() {
            return Err(EnvelopeError::MissingField("type"));
        }
        if let Some(p) = self.priority {
            if p > 9 {
                return Err(EnvelopeError::InvalidPriority(p));
            }
        }
        Ok(())
    }

    /// Response envelope for the same request: same task and correlation,
    /// services swapped.
    pub fn reply(&self, status: EnvelopeStatus, payload: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            created_at: Utc::now(),
            status,
            source_service: self.target_service.clone(),
            target_service: self.source_service.clone(),
            payload,
            error: None,
            ..self.clone()
        }
    }

    /// Failed response carrying `error`.
    pub fn reply_error(&self, error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..self.reply(EnvelopeStatus::Failed, serde_json::Value::Null)
        }
    }

    /// Queue this envelope routes to.
    pub fn queue_name(&self) -> String {
        queue_name(
            &self.target_service,
            self.priority.unwrap_or(DEFAULT_PRIORITY),
            &self.message_type.domain,
            &self.message_type.action,
        )
    }
}

/// Priority used when an envelope sets none.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Priority band label used in queue names.
pub fn priority_label(priority: u8) -> &'static str {
    match priority {
        0..=2 => "high",
        3..=6 => "medium",
        _ => "low",
    }
}

/// `{service}.{priority}.{domain}.{action}`
pub fn queue_name(service: &str, priority: u8, domain: &str, action: &str) -> String {
    format!("{service}.{}.{domain}.{action}", priority_label(priority))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ContextCarrier {
        ContextCarrier::new("t1")
            .unwrap()
            .with_agent("agent-7")
            .with_collection("docs")
    }

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new(
            &ctx(),
            Uuid::new_v4(),
            MessageType::new("embedding", "execute"),
            "orchestrator",
            "embedding_service",
            serde_json::json!({"text": "hello"}),
        )
    }

    #[test]
    fn queue_name_follows_convention() {
        assert_eq!(
            queue_name("embedding_service", 0, "embedding", "execute"),
            "embedding_service.high.embedding.execute"
        );
        assert_eq!(envelope().with_priority(8).queue_name(), "embedding_service.low.embedding.execute");
        assert_eq!(envelope().queue_name(), "embedding_service.medium.embedding.execute");
    }

    #[test]
    fn context_survives_serialization() {
        let env = envelope();
        let wire = serde_json::to_string(&env).unwrap();
        let back: MessageEnvelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.context().unwrap(), ctx());
        assert!(wire.contains(r#""type":{"domain":"embedding","action":"execute"}"#));
    }

    #[test]
    fn mismatched_tenant_is_rejected() {
        let mut env = envelope();
        env.tenant_id = "t2".into();
        assert!(env.context().is_err());
    }

    #[test]
    fn validate_rejects_bad_priority_and_missing_tenant() {
        assert!(matches!(
            envelope().with_priority(10).validate(),
            Err(EnvelopeError::InvalidPriority(10))
        ));
        let mut env = envelope();
        env.tenant_id.clear();
        assert!(matches!(env.validate(), Err(EnvelopeError::MissingField("tenant_id"))));
    }

    #[test]
    fn reply_keeps_correlation_and_swaps_services() {
        let request = envelope();
        let response = request.reply_error(ErrorInfo::new("timeout", "slow", true));
        assert_eq!(response.correlation_id, request.correlation_id);
        assert_eq!(response.task_id, request.task_id);
        assert_ne!(response.message_id, request.message_id);
        assert_eq!(response.source_service, "embedding_service");
        assert_eq!(response.target_service, "orchestrator");
        assert_eq!(response.status, EnvelopeStatus::Failed);
        assert!(response.error.unwrap().retryable);
    }
}
