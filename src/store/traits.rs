//! Durable job store trait.
//!
//! The durable store is the source of truth for job records; the fast
//! store and the registry's lock table are rebuildable from it.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobStatus};

/// Backend-agnostic persistence for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert a freshly registered job.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by ID, regardless of tenant. Callers enforce ownership.
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Overwrite the mutable fields of an existing job.
    async fn update_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Most recent jobs of a tenant, newest first.
    async fn list_jobs(&self, tenant_id: &str, limit: usize) -> Result<Vec<Job>, DatabaseError>;

    /// All jobs currently in `status`, oldest first.
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError>;
}
