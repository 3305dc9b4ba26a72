//! Work dispatcher — submission, the worker pool and cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::{ExecutionContext, HandlerRegistry, JobHandler};
use crate::config::WorkerConfig;
use crate::context::ContextCarrier;
use crate::delegation::{AgentRegistry, DelegationScorer};
use crate::envelope::{DEFAULT_PRIORITY, MessageEnvelope, MessageType};
use crate::error::{Error, ErrorInfo, JobError, Result, codes};
use crate::jobs::memo::DELEGATED_TO_PARAM;
use crate::jobs::model::MAX_JOB_DURATION_SECS;
use crate::jobs::{Job, JobRegistry, JobStatus, JobType, JobUpdate};

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Overrides the configured default max duration.
    pub max_duration: Option<Duration>,
    /// Envelope priority, 0 (highest) to 9.
    pub priority: Option<u8>,
}

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job: Job,
    /// Answered from a memoized result without running a handler.
    pub memoized: bool,
    /// Agent the job was delegated to, if any.
    pub delegated_to: Option<String>,
}

/// Delegation inputs for `agent_execution` jobs.
pub struct Delegation {
    pub scorer: Arc<DelegationScorer>,
    pub agents: Arc<AgentRegistry>,
    pub max_depth: usize,
}

/// Accepts jobs, queues them as envelopes and runs them on a bounded pool.
pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    handlers: Arc<HandlerRegistry>,
    delegation: Option<Delegation>,
    config: WorkerConfig,
    service_name: String,
    queue_tx: mpsc::Sender<MessageEnvelope>,
    queue_rx: Mutex<Option<mpsc::Receiver<MessageEnvelope>>>,
    /// Cancellation handles of jobs currently executing.
    running: RwLock<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<JobRegistry>,
        handlers: Arc<HandlerRegistry>,
        config: WorkerConfig,
        service_name: impl Into<String>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            registry,
            handlers,
            delegation: None,
            config,
            service_name: service_name.into(),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            running: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Enable delegate selection for `agent_execution` jobs.
    pub fn with_delegation(mut self, delegation: Delegation) -> Self {
        self.delegation = Some(delegation);
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Validate, memo-check, optionally delegate, register and enqueue.
    pub async fn submit(
        &self,
        ctx: &ContextCarrier,
        job_type: JobType,
        params: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<SubmitOutcome> {
        ctx.require_tenant()?;
        if !params.is_object() {
            return Err(JobError::InvalidParams("params must be a JSON object".into()).into());
        }
        let handler = self
            .handlers
            .get(job_type)
            .ok_or_else(|| JobError::NoHandler(job_type.to_string()))?;
        handler.validate(&params)?;
        if let Some(priority) = options.priority {
            if priority > 9 {
                return Err(JobError::InvalidParams(format!("priority {priority} out of range 0..=9")).into());
            }
        }
        if let Some(limit) = options.max_duration {
            if limit.as_secs() > MAX_JOB_DURATION_SECS {
                return Err(JobError::InvalidParams(format!(
                    "max duration {}s exceeds {MAX_JOB_DURATION_SECS}s",
                    limit.as_secs()
                ))
                .into());
            }
        }

        // The memo key depends on the executing agent, so delegation comes first.
        let (exec_ctx, params, delegated_to) = self.maybe_delegate(ctx, job_type, params).await;

        if let Some(result) = self.registry.lookup_memoized(&exec_ctx, job_type, &params).await? {
            let job = self
                .registry
                .register_memoized(&exec_ctx, job_type, params, result)
                .await?;
            return Ok(SubmitOutcome {
                job,
                memoized: true,
                delegated_to,
            });
        }

        let max_duration = options.max_duration.or(self.config.default_max_duration);
        let job = self
            .registry
            .register_job(&exec_ctx, job_type, params, max_duration)
            .await?;

        let envelope = self
            .envelope_for(&exec_ctx, &job)
            .with_priority(options.priority.unwrap_or(DEFAULT_PRIORITY));
        self.enqueue(envelope).await?;

        Ok(SubmitOutcome {
            job,
            memoized: false,
            delegated_to,
        })
    }

    /// Cancel a queued or running job owned by `ctx`'s tenant.
    pub async fn cancel(&self, ctx: &ContextCarrier, job_id: Uuid) -> Result<bool> {
        let job = self
            .registry
            .get_job_status(ctx, job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;
        if job.status.is_terminal() {
            return Err(already_terminal(job_id, job.status));
        }

        if let Some(token) = self.running.read().await.get(&job_id) {
            token.cancel();
        }

        match self
            .registry
            .update_job_status(job_id, JobUpdate::cancelled(ErrorInfo::cancelled(job_id)))
            .await
        {
            Ok(_) => {
                info!(job_id = %job_id, tenant = %ctx.tenant_id(), "Job cancelled");
                Ok(true)
            }
            // Finished between the status read and the update.
            Err(Error::Job(JobError::InvalidTransition { .. })) => {
                let status = self
                    .registry
                    .load_job(job_id)
                    .await?
                    .map_or(JobStatus::Completed, |j| j.status);
                Err(already_terminal(job_id, status))
            }
            Err(e) => Err(e),
        }
    }

    /// Start the worker pool. Runs until [`Dispatcher::shutdown`].
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut rx = self
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or(JobError::QueueClosed)?;
        let this = Arc::clone(self);
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_jobs.max(1)));

        info!(workers = self.config.max_parallel_jobs, "Worker pool started");
        Ok(tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    envelope = rx.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = this.shutdown.cancelled() => break,
                };
                let permit = tokio::select! {
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    _ = this.shutdown.cancelled() => break,
                };
                let worker = Arc::clone(&this);
                tokio::spawn(async move {
                    let _permit = permit;
                    worker.execute(envelope).await;
                });
            }
            info!("Worker pool stopped");
        }))
    }

    /// Stop accepting queued work and cancel running jobs.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Re-enqueue jobs that were queued before a restart.
    pub async fn requeue(&self, jobs: Vec<Job>) -> Result<usize> {
        let mut count = 0;
        for job in jobs {
            let ctx = job.context()?;
            let envelope = self.envelope_for(&ctx, &job).with_priority(DEFAULT_PRIORITY);
            self.enqueue(envelope).await?;
            count += 1;
        }
        if count > 0 {
            info!(count, "Requeued recovered jobs");
        }
        Ok(count)
    }

    /// Number of jobs currently executing.
    pub async fn running_count(&self) -> usize {
        self.running.read().await.len()
    }

    async fn maybe_delegate(
        &self,
        ctx: &ContextCarrier,
        job_type: JobType,
        mut params: serde_json::Value,
    ) -> (ContextCarrier, serde_json::Value, Option<String>) {
        let unchanged = |params: serde_json::Value| -> (ContextCarrier, serde_json::Value, Option<String>) {
            (ctx.propagate(), params, None)
        };
        let Some(delegation) = &self.delegation else {
            return unchanged(params);
        };
        if job_type != JobType::AgentExecution {
            return unchanged(params);
        }
        let (Some(query), Some(current)) = (
            params.get("query").and_then(|q| q.as_str()).map(str::to_string),
            ctx.agent_id(),
        ) else {
            return unchanged(params);
        };

        let candidates = delegation.agents.delegation_candidates(ctx.tenant_id()).await;
        let decision = match delegation
            .scorer
            .select_delegate(&query, Some(current), &candidates)
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(tenant = %ctx.tenant_id(), agent_id = %current, error = %e, "Delegate scoring failed, keeping agent");
                return unchanged(params);
            }
        };
        let Some(delegate) = decision.selected else {
            return unchanged(params);
        };

        match ctx.delegate_to(delegate.clone(), delegation.max_depth) {
            Ok(delegated) => {
                if let Some(map) = params.as_object_mut() {
                    map.insert(DELEGATED_TO_PARAM.to_string(), serde_json::json!(delegate));
                }
                info!(tenant = %ctx.tenant_id(), from = %current, to = %delegate, "Job delegated");
                (delegated, params, Some(delegate))
            }
            Err(e) => {
                warn!(tenant = %ctx.tenant_id(), agent_id = %current, error = %e, "Delegation refused");
                unchanged(params)
            }
        }
    }

    fn envelope_for(&self, ctx: &ContextCarrier, job: &Job) -> MessageEnvelope {
        MessageEnvelope::new(
            ctx,
            job.job_id,
            MessageType::new(job.job_type.domain(), "execute"),
            self.service_name.clone(),
            job.job_type.target_service(),
            serde_json::json!({
                "job_id": job.job_id,
                "job_type": job.job_type,
            }),
        )
    }

    async fn enqueue(&self, envelope: MessageEnvelope) -> Result<()> {
        envelope.validate()?;
        let job_id = envelope.task_id;
        let queue = envelope.queue_name();
        if self.queue_tx.send(envelope).await.is_err() {
            error!(job_id = %job_id, "Work queue closed, failing job");
            let info = ErrorInfo::new(codes::INTERNAL, "Work queue closed", true);
            self.fail_unstarted(job_id, info).await;
            return Err(JobError::QueueClosed.into());
        }
        debug!(job_id = %job_id, queue = %queue, "Job enqueued");
        Ok(())
    }

    /// Fail a job that never ran. Queued jobs can only start or be
    /// cancelled, so it passes through processing.
    async fn fail_unstarted(&self, job_id: Uuid, info: ErrorInfo) {
        let result = match self.registry.update_job_status(job_id, JobUpdate::processing()).await {
            Ok(_) => self.registry.update_job_status(job_id, JobUpdate::failed(info)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(job_id = %job_id, error = %e, "Could not fail unstarted job");
        }
    }

    /// Run one envelope to a terminal status.
    async fn execute(&self, envelope: MessageEnvelope) {
        let job_id = envelope.task_id;
        let ctx = match envelope.context() {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Envelope carries no usable context");
                return;
            }
        };

        let job = match self.registry.load_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "Dequeued unknown job");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to load dequeued job");
                return;
            }
        };
        if job.status != JobStatus::Queued {
            debug!(job_id = %job_id, status = %job.status, "Skipping job that is no longer queued");
            return;
        }
        let Some(handler) = self.handlers.get(job.job_type) else {
            let info = Error::from(JobError::NoHandler(job.job_type.to_string())).info();
            self.fail_unstarted(job_id, info).await;
            return;
        };

        let token = self.shutdown.child_token();
        self.running.write().await.insert(job_id, token.clone());
        if let Err(e) = self
            .registry
            .update_job_status(job_id, JobUpdate::processing())
            .await
        {
            // Cancelled while queued.
            debug!(job_id = %job_id, error = %e, "Job not started");
            self.running.write().await.remove(&job_id);
            return;
        }
        info!(job_id = %job_id, tenant = %ctx.tenant_id(), job_type = %job.job_type, "Job started");

        let exec = ExecutionContext::new(job_id, ctx, token.clone(), Arc::clone(&self.registry));
        let limit = job.max_duration();
        let run = handler.execute(&exec, &job.params);
        tokio::pin!(run);

        let outcome = match limit {
            Some(limit) => {
                tokio::select! {
                    outcome = &mut run => Some(outcome),
                    _ = tokio::time::sleep(limit) => None,
                }
            }
            None => Some(run.as_mut().await),
        };

        let update = match outcome {
            Some(_) if token.is_cancelled() => None,
            Some(Ok(result)) => Some(JobUpdate::completed(result)),
            Some(Err(e)) => {
                warn!(job_id = %job_id, error = %e, "Job handler failed");
                Some(JobUpdate::failed(e.info()))
            }
            None => {
                let limit = limit.unwrap_or_default();
                warn!(job_id = %job_id, limit_secs = limit.as_secs(), "Job exceeded max duration");
                token.cancel();
                // Let the handler reach a safe point before it is dropped.
                let grace = self.config.cancel_grace;
                let forced = tokio::time::timeout(grace, &mut run).await.is_err();
                let mut info = Error::from(JobError::Timeout { id: job_id, limit }).info();
                if forced {
                    error!(
                        job_id = %job_id,
                        grace_ms = grace.as_millis() as u64,
                        "Handler ignored cancellation, forcing abort"
                    );
                    info.message = format!("{}; handler aborted after ignoring cancellation", info.message);
                    info = info.with_details(serde_json::json!({
                        "forced_abort": true,
                        "grace_ms": grace.as_millis() as u64,
                    }));
                }
                Some(JobUpdate::failed(info))
            }
        };

        if let Some(update) = update {
            if let Err(e) = self.registry.update_job_status(job_id, update).await {
                debug!(job_id = %job_id, error = %e, "Final status not recorded");
            }
        }
        self.running.write().await.remove(&job_id);
    }
}

fn already_terminal(job_id: Uuid, status: JobStatus) -> Error {
    JobError::AlreadyTerminal {
        id: job_id,
        state: status.to_string(),
    }
    .into()
}


#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::cache::{CacheAside, InMemoryFastStore, TtlPolicy};
    use crate::delegation::{AgentProfile, CosineScorer};
    use crate::notify::NotificationHub;
    use crate::store::LibSqlBackend;
    use crate::worker::embedding::HashingEmbedder;

    struct Echo(JobType);

    #[async_trait]
    impl JobHandler for Echo {
        fn job_type(&self) -> JobType {
            self.0
        }

        async fn execute(
            &self,
            _exec: &ExecutionContext,
            params: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::json!({ "echo": params }))
        }
    }

    /// Runs until cancelled.
    struct Slow;

    #[async_trait]
    impl JobHandler for Slow {
        fn job_type(&self) -> JobType {
            JobType::AgentExecution
        }

        async fn execute(
            &self,
            exec: &ExecutionContext,
            _params: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            exec.cancelled().await;
            Err(JobError::Cancelled { id: exec.job_id }.into())
        }
    }

    struct Broken;

    #[async_trait]
    impl JobHandler for Broken {
        fn job_type(&self) -> JobType {
            JobType::DocumentProcessing
        }

        async fn execute(
            &self,
            exec: &ExecutionContext,
            _params: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            Err(JobError::Failed {
                id: exec.job_id,
                reason: "parser crashed".into(),
            }
            .into())
        }
    }

    async fn dispatcher(handlers: HandlerRegistry) -> Dispatcher {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let cache = CacheAside::new(InMemoryFastStore::new(), TtlPolicy::default());
        let registry = Arc::new(JobRegistry::new(store, cache, NotificationHub::new(16)));
        Dispatcher::new(
            registry,
            Arc::new(handlers),
            WorkerConfig::default(),
            "orchestrator",
        )
    }

    fn ctx() -> ContextCarrier {
        ContextCarrier::new("t1").unwrap().with_agent("router")
    }

    async fn wait_for(dispatcher: &Dispatcher, job_id: Uuid, done: impl Fn(&Job) -> bool) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(job) = dispatcher.registry().get_job_status(&ctx(), job_id).await.unwrap() {
                    if done(&job) {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach the expected state")
    }

    #[tokio::test]
    async fn completed_results_are_memoized() {
        let dispatcher = Arc::new(dispatcher(HandlerRegistry::new().with(Arc::new(Echo(JobType::EmbeddingRequest)))).await);
        dispatcher.start().await.unwrap();

        let params = serde_json::json!({"text": "hello", "model": "m1"});
        let first = dispatcher
            .submit(&ctx(), JobType::EmbeddingRequest, params, SubmitOptions::default())
            .await
            .unwrap();
        assert!(!first.memoized);
        assert_eq!(first.job.status, JobStatus::Queued);

        let done = wait_for(&dispatcher, first.job.job_id, |j| j.status.is_terminal()).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.as_ref().unwrap()["echo"]["text"], "hello");

        // Same params in a different key order.
        let second = dispatcher
            .submit(
                &ctx(),
                JobType::EmbeddingRequest,
                serde_json::json!({"model": "m1", "text": "hello"}),
                SubmitOptions::default(),
            )
            .await
            .unwrap();
        assert!(second.memoized);
        assert_ne!(second.job.job_id, first.job.job_id);
        assert_eq!(second.job.status, JobStatus::Completed);
        assert_eq!(second.job.result, done.result);
    }

    #[tokio::test]
    async fn submit_rejects_unhandled_and_malformed() {
        let dispatcher = dispatcher(HandlerRegistry::new().with(Arc::new(Echo(JobType::EmbeddingRequest)))).await;

        let err = dispatcher
            .submit(&ctx(), JobType::FederatedQuery, serde_json::json!({}), SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NoHandler(_))));

        let err = dispatcher
            .submit(&ctx(), JobType::EmbeddingRequest, serde_json::json!("text"), SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::InvalidParams(_))));

        let options = SubmitOptions {
            priority: Some(12),
            ..Default::default()
        };
        let err = dispatcher
            .submit(&ctx(), JobType::EmbeddingRequest, serde_json::json!({}), options)
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::VALIDATION);
    }

    #[tokio::test]
    async fn running_job_can_be_cancelled() {
        let dispatcher = Arc::new(dispatcher(HandlerRegistry::new().with(Arc::new(Slow))).await);
        dispatcher.start().await.unwrap();

        let outcome = dispatcher
            .submit(&ctx(), JobType::AgentExecution, serde_json::json!({"query": "q"}), SubmitOptions::default())
            .await
            .unwrap();
        let job_id = outcome.job.job_id;
        wait_for(&dispatcher, job_id, |j| j.status == JobStatus::Processing).await;

        assert!(dispatcher.cancel(&ctx(), job_id).await.unwrap());
        let job = wait_for(&dispatcher, job_id, |j| j.status.is_terminal()).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error.unwrap().code, codes::CANCELLED);

        let err = dispatcher.cancel(&ctx(), job_id).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::AlreadyTerminal { .. })));

        tokio::time::timeout(Duration::from_secs(1), async {
            while dispatcher.running_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn queued_job_cancelled_before_start_never_runs() {
        let dispatcher = Arc::new(dispatcher(HandlerRegistry::new().with(Arc::new(Echo(JobType::EmbeddingRequest)))).await);
        let outcome = dispatcher
            .submit(&ctx(), JobType::EmbeddingRequest, serde_json::json!({"text": "x"}), SubmitOptions::default())
            .await
            .unwrap();
        dispatcher.cancel(&ctx(), outcome.job.job_id).await.unwrap();

        dispatcher.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let job = dispatcher.registry().load_job(outcome.job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn cancel_is_tenant_scoped() {
        let dispatcher = dispatcher(HandlerRegistry::new().with(Arc::new(Echo(JobType::EmbeddingRequest)))).await;
        let outcome = dispatcher
            .submit(&ctx(), JobType::EmbeddingRequest, serde_json::json!({"text": "x"}), SubmitOptions::default())
            .await
            .unwrap();

        let other = ContextCarrier::new("t2").unwrap();
        let err = dispatcher.cancel(&other, outcome.job.job_id).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn overrunning_job_fails_with_timeout() {
        let dispatcher = Arc::new(dispatcher(HandlerRegistry::new().with(Arc::new(Slow))).await);
        dispatcher.start().await.unwrap();

        let options = SubmitOptions {
            max_duration: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let outcome = dispatcher
            .submit(&ctx(), JobType::AgentExecution, serde_json::json!({"query": "q"}), options)
            .await
            .unwrap();

        let job = wait_for(&dispatcher, outcome.job.job_id, |j| j.status.is_terminal()).await;
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert_eq!(error.code, codes::TIMEOUT);
        assert!(error.retryable);
    }

    /// Never looks at its cancellation token.
    struct Stubborn;

    #[async_trait]
    impl JobHandler for Stubborn {
        fn job_type(&self) -> JobType {
            JobType::FederatedQuery
        }

        async fn execute(
            &self,
            _exec: &ExecutionContext,
            _params: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::json!("too late"))
        }
    }

    #[tokio::test]
    async fn handler_ignoring_cancellation_is_aborted() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let cache = CacheAside::new(InMemoryFastStore::new(), TtlPolicy::default());
        let registry = Arc::new(JobRegistry::new(store.clone(), cache, NotificationHub::new(16)));
        let config = WorkerConfig {
            cancel_grace: Duration::from_millis(100),
            ..WorkerConfig::default()
        };
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            Arc::new(HandlerRegistry::new().with(Arc::new(Stubborn))),
            config,
            "orchestrator",
        ));
        dispatcher.start().await.unwrap();

        let options = SubmitOptions {
            max_duration: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let outcome = dispatcher
            .submit(&ctx(), JobType::FederatedQuery, serde_json::json!({"query": "q"}), options)
            .await
            .unwrap();

        let job = wait_for(&dispatcher, outcome.job.job_id, |j| j.status.is_terminal()).await;
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert_eq!(error.code, codes::TIMEOUT);
        assert_eq!(error.details.unwrap()["forced_abort"], true);

        let history = store.job_transitions(job.job_id).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.to, JobStatus::Failed);
        assert!(last.reason.as_deref().unwrap().contains("aborted"));
    }

    #[tokio::test]
    async fn cooperative_timeout_is_not_a_forced_abort() {
        let dispatcher = Arc::new(dispatcher(HandlerRegistry::new().with(Arc::new(Slow))).await);
        dispatcher.start().await.unwrap();

        let options = SubmitOptions {
            max_duration: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let outcome = dispatcher
            .submit(&ctx(), JobType::AgentExecution, serde_json::json!({"query": "q"}), options)
            .await
            .unwrap();

        let job = wait_for(&dispatcher, outcome.job.job_id, |j| j.status.is_terminal()).await;
        assert!(job.error.unwrap().details.is_none());
    }

    #[tokio::test]
    async fn unstorable_max_duration_is_rejected() {
        let dispatcher = dispatcher(HandlerRegistry::new().with(Arc::new(Echo(JobType::EmbeddingRequest)))).await;
        let options = SubmitOptions {
            max_duration: Some(Duration::from_secs(u64::MAX)),
            ..Default::default()
        };
        let err = dispatcher
            .submit(&ctx(), JobType::EmbeddingRequest, serde_json::json!({"text": "x"}), options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn handler_errors_fail_the_job() {
        let dispatcher = Arc::new(dispatcher(HandlerRegistry::new().with(Arc::new(Broken))).await);
        dispatcher.start().await.unwrap();

        let outcome = dispatcher
            .submit(&ctx(), JobType::DocumentProcessing, serde_json::json!({"document_id": "d1"}), SubmitOptions::default())
            .await
            .unwrap();
        let job = wait_for(&dispatcher, outcome.job.job_id, |j| j.status.is_terminal()).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().message.contains("parser crashed"));
    }

    #[tokio::test]
    async fn agent_jobs_are_delegated_to_best_match() {
        let agents = AgentRegistry::new();
        agents.upsert("t1", AgentProfile::new("tax", "tax return filing")).await;
        agents.upsert("t1", AgentProfile::new("weather", "rain forecast tomorrow")).await;
        let scorer = DelegationScorer::new(
            Arc::new(CosineScorer::new(Arc::new(HashingEmbedder::new(1024)))),
            0.7,
        );
        let dispatcher = dispatcher(HandlerRegistry::new().with(Arc::new(Echo(JobType::AgentExecution))))
            .await
            .with_delegation(Delegation {
                scorer: Arc::new(scorer),
                agents,
                max_depth: 3,
            });

        let outcome = dispatcher
            .submit(&ctx(), JobType::AgentExecution, serde_json::json!({"query": "tax return filing"}), SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.delegated_to.as_deref(), Some("tax"));
        assert_eq!(outcome.job.agent_id.as_deref(), Some("tax"));
        assert_eq!(outcome.job.params[DELEGATED_TO_PARAM], "tax");

        let outcome = dispatcher
            .submit(&ctx(), JobType::AgentExecution, serde_json::json!({"query": "stock prices"}), SubmitOptions::default())
            .await
            .unwrap();
        assert!(outcome.delegated_to.is_none());
        assert_eq!(outcome.job.agent_id.as_deref(), Some("router"));
    }

    #[tokio::test]
    async fn delegated_results_are_memoized_per_delegate() {
        let agents = AgentRegistry::new();
        agents.upsert("t1", AgentProfile::new("tax", "tax return filing")).await;
        let scorer = DelegationScorer::new(
            Arc::new(CosineScorer::new(Arc::new(HashingEmbedder::new(1024)))),
            0.7,
        );
        let dispatcher = Arc::new(
            dispatcher(HandlerRegistry::new().with(Arc::new(Echo(JobType::AgentExecution))))
                .await
                .with_delegation(Delegation {
                    scorer: Arc::new(scorer),
                    agents,
                    max_depth: 3,
                }),
        );
        dispatcher.start().await.unwrap();
        let params = serde_json::json!({"query": "tax return filing"});

        let first = dispatcher
            .submit(&ctx(), JobType::AgentExecution, params.clone(), SubmitOptions::default())
            .await
            .unwrap();
        wait_for(&dispatcher, first.job.job_id, |j| j.status.is_terminal()).await;

        let again = dispatcher
            .submit(&ctx(), JobType::AgentExecution, params, SubmitOptions::default())
            .await
            .unwrap();
        assert!(again.memoized);
        assert_eq!(again.delegated_to.as_deref(), Some("tax"));
        assert_eq!(again.job.agent_id.as_deref(), Some("tax"));
    }

    #[tokio::test]
    async fn recovered_jobs_are_requeued() {
        let dispatcher = Arc::new(dispatcher(HandlerRegistry::new().with(Arc::new(Echo(JobType::EmbeddingRequest)))).await);
        let job = dispatcher
            .registry()
            .register_job(&ctx(), JobType::EmbeddingRequest, serde_json::json!({"text": "again"}), None)
            .await
            .unwrap();

        let queued = dispatcher.registry().recover().await.unwrap();
        assert_eq!(dispatcher.requeue(queued).await.unwrap(), 1);
        dispatcher.start().await.unwrap();

        let done = wait_for(&dispatcher, job.job_id, |j| j.status.is_terminal()).await;
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn shutdown_stops_the_pool() {
        let dispatcher = Arc::new(dispatcher(HandlerRegistry::new()).await);
        let handle = dispatcher.start().await.unwrap();
        assert!(dispatcher.start().await.is_err());

        dispatcher.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
