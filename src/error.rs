//! Error types for the job orchestrator.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Delegation error: {0}")]
    Delegation(#[from] DelegationError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request-context validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("Missing tenant_id")]
    MissingTenant,

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Delegation cycle: agent {agent_id} already in chain")]
    DelegationCycle { agent_id: String },

    #[error("Delegation depth {depth} exceeds limit {max}")]
    DelegationDepthExceeded { depth: usize, max: usize },
}

/// Durable-store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Fast-store errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Backend(String),

    #[error("Failed to invalidate primary key {key}: {reason}")]
    PrimaryInvalidation { key: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Job {id} is already terminal ({state})")]
    AlreadyTerminal { id: Uuid, state: String },

    #[error("Unknown job type: {0}")]
    UnknownType(String),

    #[error("No handler registered for job type {0}")]
    NoHandler(String),

    #[error("Job {id} exceeded max duration {limit:?}")]
    Timeout { id: Uuid, limit: Duration },

    #[error("Job {id} was cancelled")]
    Cancelled { id: Uuid },

    #[error("Job {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Work queue closed")]
    QueueClosed,
}

/// Notification channel errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NotifyError {
    #[error("Subscriber {client_id} buffer overflowed")]
    Overflow { client_id: Uuid },

    #[error("Subscriber {client_id} disconnected")]
    Disconnected { client_id: Uuid },
}

/// Delegation / federation errors.
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("All {count} candidates failed: {}", .failures.join("; "))]
    AllFailed { count: usize, failures: Vec<String> },

    #[error("Scoring failed for {candidate}: {reason}")]
    Scoring { candidate: String, reason: String },

    #[error("Embedding failed: {0}")]
    Embedding(String),
}

/// Downstream service errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service {service} timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    #[error("Service {service} unavailable (circuit open)")]
    Unavailable { service: String },

    #[error("Transient failure calling {service}: {reason}")]
    Transient { service: String, reason: String },

    #[error("Service {service} rejected the request: {reason}")]
    Rejected { service: String, reason: String },
}

impl ServiceError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient { .. })
    }
}

/// Message envelope errors.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Envelope missing required field {0}")]
    MissingField(&'static str),

    #[error("Priority {0} out of range 0..=9")]
    InvalidPriority(u8),

    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Error object carried across service boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Whether a caller may resubmit.
    pub retryable: bool,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn cancelled(job_id: Uuid) -> Self {
        Self::new(codes::CANCELLED, format!("Job {job_id} was cancelled"), false)
    }
}

/// Stable error codes.
pub mod codes {
    pub const VALIDATION: &str = "validation_error";
    pub const NOT_FOUND: &str = "not_found";
    pub const TRANSIENT: &str = "transient_service_error";
    pub const INVALID_TRANSITION: &str = "invalid_transition";
    pub const TIMEOUT: &str = "timeout";
    pub const CANCELLED: &str = "cancelled";
    pub const SERVICE_UNAVAILABLE: &str = "service_unavailable";
    pub const CONFLICT: &str = "conflict";
    pub const INTERRUPTED: &str = "interrupted";
    pub const EXECUTION_FAILED: &str = "execution_failed";
    pub const INTERNAL: &str = "internal_error";
}

impl Error {
    /// Stable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Context(_) | Self::Envelope(_) => codes::VALIDATION,
            Self::Job(JobError::UnknownType(_) | JobError::InvalidParams(_)) => codes::VALIDATION,
            Self::Job(JobError::NotFound { .. }) => codes::NOT_FOUND,
            Self::Job(JobError::InvalidTransition { .. }) => codes::INVALID_TRANSITION,
            Self::Job(JobError::AlreadyTerminal { .. }) => codes::CONFLICT,
            Self::Job(JobError::Timeout { .. }) => codes::TIMEOUT,
            Self::Job(JobError::Cancelled { .. }) => codes::CANCELLED,
            Self::Job(JobError::Failed { .. }) => codes::EXECUTION_FAILED,
            Self::Service(ServiceError::Unavailable { .. }) => codes::SERVICE_UNAVAILABLE,
            Self::Service(e) if e.is_transient() => codes::TRANSIENT,
            Self::Service(_) => codes::EXECUTION_FAILED,
            Self::Delegation(_) => codes::EXECUTION_FAILED,
            _ => codes::INTERNAL,
        }
    }

    /// Whether callers may retry automatically.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Service(_) => matches!(
                self.code(),
                codes::TRANSIENT | codes::SERVICE_UNAVAILABLE
            ),
            Self::Job(JobError::Timeout { .. }) => true,
            _ => false,
        }
    }

    /// Convert to the boundary-crossing error object.
    pub fn info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.to_string(), self.is_retryable())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
