//! Job record and state machine.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ContextCarrier;
use crate::error::{ContextError, ErrorInfo, JobError};

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    AgentExecution,
    EmbeddingRequest,
    DocumentProcessing,
    FederatedQuery,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        Self::AgentExecution,
        Self::EmbeddingRequest,
        Self::DocumentProcessing,
        Self::FederatedQuery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentExecution => "agent_execution",
            Self::EmbeddingRequest => "embedding_request",
            Self::DocumentProcessing => "document_processing",
            Self::FederatedQuery => "federated_query",
        }
    }

    /// Service that executes this job type, used for envelope routing.
    pub fn target_service(&self) -> &'static str {
        match self {
            Self::AgentExecution => "agent_service",
            Self::EmbeddingRequest => "embedding_service",
            Self::DocumentProcessing => "ingestion_service",
            Self::FederatedQuery => "query_service",
        }
    }

    /// Envelope routing domain.
    pub fn domain(&self) -> &'static str {
        match self {
            Self::AgentExecution => "agent",
            Self::EmbeddingRequest => "embedding",
            Self::DocumentProcessing => "document",
            Self::FederatedQuery => "query",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| JobError::UnknownType(s.to_string()))
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Registered, waiting for a worker.
    Queued,
    /// A worker is executing it.
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Processing)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub job_type: JobType,
    pub params: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Fraction done, 0.0..=1.0, while processing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
}

/// Longest max duration a job can carry; the durable store keeps it as a
/// signed 64-bit integer.
pub const MAX_JOB_DURATION_SECS: u64 = i64::MAX as u64;

impl Job {
    /// New queued job owned by `ctx`'s tenant.
    pub fn new(
        ctx: &ContextCarrier,
        job_type: JobType,
        params: serde_json::Value,
        max_duration: Option<Duration>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id().to_string(),
            job_type,
            params,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            progress: None,
            agent_id: ctx.agent_id().map(str::to_string),
            conversation_id: ctx.conversation_id().map(str::to_string),
            collection_id: ctx.collection_id().map(str::to_string),
            max_duration_secs: max_duration.map(|d| d.as_secs().max(1)),
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_secs.map(Duration::from_secs)
    }

    /// Snapshot of the submitting context.
    pub fn context(&self) -> Result<ContextCarrier, ContextError> {
        let mut ctx = ContextCarrier::new(self.tenant_id.clone())?;
        if let Some(agent) = &self.agent_id {
            ctx = ctx.with_agent(agent.clone());
        }
        if let Some(conversation) = &self.conversation_id {
            ctx = ctx.with_conversation(conversation.clone());
        }
        if let Some(collection) = &self.collection_id {
            ctx = ctx.with_collection(collection.clone());
        }
        Ok(ctx)
    }

    /// Apply `update`, enforcing the state machine.
    ///
    /// A `JobUpdate` with the current status and a progress value is a
    /// progress report and is only allowed while processing.
    pub fn apply(&mut self, update: JobUpdate) -> Result<(), JobError> {
        let progress_only = update.status == self.status && update.status == JobStatus::Processing;
        if !progress_only && !self.status.can_transition_to(update.status) {
            return Err(JobError::InvalidTransition {
                id: self.job_id,
                state: self.status.to_string(),
                target: update.status.to_string(),
            });
        }

        self.status = update.status;
        self.updated_at = Utc::now();
        if let Some(progress) = update.progress {
            self.progress = Some(progress.clamp(0.0, 1.0));
        }
        match update.status {
            JobStatus::Completed => {
                self.progress = Some(1.0);
                self.result = update.result;
            }
            JobStatus::Failed | JobStatus::Cancelled => {
                self.error = update.error;
            }
            _ => {}
        }
        Ok(())
    }
}

/// A requested status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
    pub progress: Option<f32>,
}

impl JobUpdate {
    pub fn processing() -> Self {
        Self::status(JobStatus::Processing)
    }

    pub fn progress(progress: f32) -> Self {
        Self {
            progress: Some(progress),
            ..Self::status(JobStatus::Processing)
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::status(JobStatus::Completed)
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::status(JobStatus::Failed)
        }
    }

    pub fn cancelled(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Self::status(JobStatus::Cancelled)
        }
    }

    fn status(status: JobStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
            progress: None,
        }
    }
}
