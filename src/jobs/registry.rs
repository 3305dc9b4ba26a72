//! Job registry — durable + cached job records with single-writer updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheAside, CacheKey, DataType, Fetcher};
use crate::context::ContextCarrier;
use crate::error::{CacheError, ErrorInfo, JobError, Result, codes};
use crate::jobs::memo::memo_resource_id;
use crate::jobs::model::{Job, JobStatus, JobType, JobUpdate};
use crate::notify::{JobEvent, NotificationHub};
use crate::store::JobStore;

/// Owns the lifecycle of every job record.
///
/// Writes go to the durable store first, then the fast store, then the
/// notification hub. Status updates for one job are serialized by a
/// per-job lock held across load, validate, persist and publish.
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    cache: CacheAside,
    hub: Arc<NotificationHub>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>, cache: CacheAside, hub: Arc<NotificationHub>) -> Self {
        Self {
            store,
            cache,
            hub,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn cache(&self) -> &CacheAside {
        &self.cache
    }

    /// Register a new queued job owned by `ctx`'s tenant.
    pub async fn register_job(
        &self,
        ctx: &ContextCarrier,
        job_type: JobType,
        params: serde_json::Value,
        max_duration: Option<Duration>,
    ) -> Result<Job> {
        ctx.require_tenant()?;
        let job = Job::new(ctx, job_type, params, max_duration);
        self.store.insert_job(&job).await?;
        self.cache_status(&job).await;

        info!(
            job_id = %job.job_id,
            tenant = %job.tenant_id,
            job_type = %job.job_type,
            "Job registered"
        );
        self.hub.publish(JobEvent::from_job(&job)).await;
        Ok(job)
    }

    /// Register a job that is already answered by a memoized result.
    pub async fn register_memoized(
        &self,
        ctx: &ContextCarrier,
        job_type: JobType,
        params: serde_json::Value,
        result: serde_json::Value,
    ) -> Result<Job> {
        ctx.require_tenant()?;
        let mut job = Job::new(ctx, job_type, params, None);
        job.status = JobStatus::Completed;
        job.progress = Some(1.0);
        job.result = Some(result);
        self.store.insert_job(&job).await?;
        self.cache_status(&job).await;

        info!(job_id = %job.job_id, tenant = %job.tenant_id, job_type = %job.job_type, "Job answered from memo");
        self.hub.publish(JobEvent::from_job(&job)).await;
        Ok(job)
    }

    /// Current job record, if it exists and belongs to `ctx`'s tenant.
    ///
    /// A cache miss is repopulated under the job's lock, so a durable read
    /// racing a status update can never overwrite the newer entry.
    pub async fn get_job_status(&self, ctx: &ContextCarrier, job_id: Uuid) -> Result<Option<Job>> {
        let key = CacheKey::build(DataType::JobStatus, ctx, &job_id.to_string());
        if let Some(value) = self.cache.get(&key).await? {
            return self.decode_job(ctx, job_id, value, true);
        }

        let fetcher = JobFetcher {
            store: self.store.as_ref(),
        };
        let lock = self.job_lock(job_id).await;
        let found = {
            let _guard = lock.lock().await;
            self.cache
                .get_or_generate(
                    DataType::JobStatus,
                    ctx,
                    &job_id.to_string(),
                    Some(&fetcher),
                    None,
                    None,
                )
                .await
        };
        self.release_lock(job_id, lock).await;

        match found? {
            Some((value, metrics)) => self.decode_job(ctx, job_id, value, metrics.cache_hit),
            None => Ok(None),
        }
    }

    /// Durable read without tenant filtering, for workers.
    pub async fn load_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.store.get_job(job_id).await?)
    }

    /// Apply a status transition.
    ///
    /// Concurrent updates to the same job are serialized; the loser of a
    /// race between two terminal statuses gets `JobError::InvalidTransition`.
    pub async fn update_job_status(&self, job_id: Uuid, update: JobUpdate) -> Result<Job> {
        let lock = self.job_lock(job_id).await;
        let applied = {
            let _guard = lock.lock().await;
            self.apply_update(job_id, update).await
        };
        self.release_lock(job_id, lock).await;

        let job = applied?;
        if job.status.is_terminal() {
            info!(job_id = %job_id, status = %job.status, "Job finished");
        } else {
            debug!(job_id = %job_id, status = %job.status, progress = ?job.progress, "Job status updated");
        }
        Ok(job)
    }

    /// Load, validate, persist and publish one update. Caller holds the
    /// job's lock.
    async fn apply_update(&self, job_id: Uuid, update: JobUpdate) -> Result<Job> {
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;

        if let Err(e) = job.apply(update) {
            error!(job_id = %job_id, error = %e, "Rejected job status transition");
            return Err(e.into());
        }

        self.store.update_job(&job).await?;
        self.cache_status(&job).await;
        if job.status == JobStatus::Completed {
            self.memoize(&job).await;
        }
        self.hub.publish(JobEvent::from_job(&job)).await;
        Ok(job)
    }

    /// Record progress of a processing job without changing its status.
    pub async fn report_progress(&self, job_id: Uuid, progress: f32) -> Result<Job> {
        self.update_job_status(job_id, JobUpdate::progress(progress))
            .await
    }

    /// Memoized result for identical params of the same job type, if any.
    pub async fn lookup_memoized(
        &self,
        ctx: &ContextCarrier,
        job_type: JobType,
        params: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        ctx.require_tenant()?;
        let key = CacheKey::build(DataType::JobResult, ctx, &memo_resource_id(job_type, ctx, params));
        self.cache.get(&key).await
    }

    /// Recent jobs of `ctx`'s tenant, newest first.
    pub async fn list_jobs(&self, ctx: &ContextCarrier, limit: usize) -> Result<Vec<Job>> {
        let tenant = ctx.require_tenant()?;
        Ok(self.store.list_jobs(tenant, limit).await?)
    }

    /// Reconcile after a restart.
    ///
    /// Jobs left processing by a dead worker are failed as interrupted.
    /// Queued jobs are re-cached and returned for re-enqueueing.
    pub async fn recover(&self) -> Result<Vec<Job>> {
        let interrupted = self.store.list_jobs_by_status(JobStatus::Processing).await?;
        for job in &interrupted {
            let error = ErrorInfo::new(
                codes::INTERRUPTED,
                "Job was interrupted by a restart",
                true,
            );
            if let Err(e) = self
                .update_job_status(job.job_id, JobUpdate::failed(error))
                .await
            {
                warn!(job_id = %job.job_id, error = %e, "Failed to mark interrupted job");
            }
        }

        let queued = self.store.list_jobs_by_status(JobStatus::Queued).await?;
        for job in &queued {
            self.cache_status(job).await;
        }

        info!(
            interrupted = interrupted.len(),
            queued = queued.len(),
            "Job registry recovered"
        );
        Ok(queued)
    }

    async fn job_lock(&self, job_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(job_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the table entry once no other task holds or awaits `lock`.
    async fn release_lock(&self, job_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference is ours, one is the table's.
        let ours = locks.get(&job_id).is_some_and(|held| Arc::ptr_eq(held, &lock));
        if ours && Arc::strong_count(&lock) <= 2 {
            locks.remove(&job_id);
        }
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    fn decode_job(
        &self,
        ctx: &ContextCarrier,
        job_id: Uuid,
        value: serde_json::Value,
        cache_hit: bool,
    ) -> Result<Option<Job>> {
        let job: Job = serde_json::from_value(value).map_err(CacheError::from)?;
        // Keys are tenant-scoped, so this only trips on a corrupted entry.
        if job.tenant_id != ctx.tenant_id() {
            warn!(job_id = %job_id, "Cached job belongs to another tenant");
            return Ok(None);
        }
        debug!(job_id = %job_id, cache_hit, "Job status read");
        Ok(Some(job))
    }

    /// Best-effort write of the status entry; the durable store already
    /// holds the record.
    async fn cache_status(&self, job: &Job) {
        let ctx = match job.context() {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Job has no valid context, not cached");
                return;
            }
        };
        let key = CacheKey::build(DataType::JobStatus, &ctx, &job.job_id.to_string());
        let value = match serde_json::to_value(job) {
            Ok(value) => value,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Failed to serialize job for cache");
                return;
            }
        };
        if let Err(e) = self.cache.put(&key, value, None).await {
            warn!(job_id = %job.job_id, error = %e, "Failed to cache job status");
        }
    }

    async fn memoize(&self, job: &Job) {
        let (Ok(ctx), Some(result)) = (job.context(), job.result.clone()) else {
            return;
        };
        let key = CacheKey::build(
            DataType::JobResult,
            &ctx,
            &memo_resource_id(job.job_type, &ctx, &job.params),
        );
        if let Err(e) = self.cache.put(&key, result, None).await {
            warn!(job_id = %job.job_id, error = %e, "Failed to memoize job result");
        }
    }
}

/// Durable lookup of a job record, filtered by tenant.
struct JobFetcher<'a> {
    store: &'a dyn JobStore,
}

#[async_trait]
impl Fetcher for JobFetcher<'_> {
    async fn fetch(
        &self,
        ctx: &ContextCarrier,
        resource_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let Ok(job_id) = Uuid::parse_str(resource_id) else {
            return Ok(None);
        };
        match self.store.get_job(job_id).await? {
            Some(job) if job.tenant_id == ctx.tenant_id() => Ok(Some(
                serde_json::to_value(&job).map_err(CacheError::from)?,
            )),
            _ => Ok(None),
        }
    }
}
