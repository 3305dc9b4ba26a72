//! Job handler trait, registry and per-execution context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::ContextCarrier;
use crate::error::{JobError, Result};
use crate::jobs::{JobRegistry, JobType};

/// What a handler sees while running one job.
pub struct ExecutionContext {
    pub job_id: Uuid,
    /// Carrier rebuilt from the work envelope.
    pub ctx: ContextCarrier,
    cancel: CancellationToken,
    registry: Arc<JobRegistry>,
}

impl ExecutionContext {
    pub fn new(
        job_id: Uuid,
        ctx: ContextCarrier,
        cancel: CancellationToken,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            job_id,
            ctx,
            cancel,
            registry,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Safe point: bail out if the job was cancelled or timed out.
    pub fn check_cancelled(&self) -> std::result::Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled { id: self.job_id });
        }
        Ok(())
    }

    /// Resolves once the job is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Publish progress. Failures are logged, never fatal to the job.
    pub async fn report_progress(&self, progress: f32) {
        if self.is_cancelled() {
            return;
        }
        if let Err(e) = self.registry.report_progress(self.job_id, progress).await {
            debug!(job_id = %self.job_id, error = %e, "Progress not recorded");
        }
    }
}

/// Executes one kind of job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Reject malformed params before the job is registered.
    fn validate(&self, _params: &serde_json::Value) -> std::result::Result<(), JobError> {
        Ok(())
    }

    /// Run the job. Long handlers should call
    /// [`ExecutionContext::check_cancelled`] between steps.
    async fn execute(
        &self,
        exec: &ExecutionContext,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value>;
}

/// Job type → handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for its job type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type();
        if self.handlers.insert(job_type, handler).is_some() {
            warn!(job_type = %job_type, "Replaced existing job handler");
        } else {
            debug!(job_type = %job_type, "Registered job handler");
        }
    }

    pub fn with(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}
