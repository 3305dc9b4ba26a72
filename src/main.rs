use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use job_orchestrator::api::{AppState, job_routes};
use job_orchestrator::cache::{CacheAside, FastStore, InMemoryFastStore, TtlPolicy, store::spawn_sweep_task};
use job_orchestrator::config::OrchestratorConfig;
use job_orchestrator::delegation::{AgentRegistry, CosineScorer, DelegationScorer, FederationEngine, VectorIndex};
use job_orchestrator::jobs::JobRegistry;
use job_orchestrator::notify::NotificationHub;
use job_orchestrator::retry::RetryPolicy;
use job_orchestrator::store::LibSqlBackend;
use job_orchestrator::worker::builtin::{
    AgentExecutionHandler, DocumentProcessingHandler, EchoExecutor, EmbeddingRequestHandler,
    FederatedQueryHandler,
};
use job_orchestrator::worker::{Delegation, Dispatcher, HandlerRegistry, HashingEmbedder};

/// Install the subscriber. With `ORCH_LOG_DIR` set, logs also go to a daily
/// rolling file; the returned guard must live as long as the process.
fn init_tracing() -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = fmt::layer().with_target(false);

    let (file_layer, guard) = match std::env::var("ORCH_LOG_DIR") {
        Ok(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {dir}"))?;
            let appender = tracing_appender::rolling::daily(&dir, "orchestrator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout)
        .with(file_layer)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing()?;

    let config = OrchestratorConfig::from_env().context("Invalid configuration")?;
    info!(
        service = %config.service_name,
        bind = %config.bind_addr,
        workers = config.worker.max_parallel_jobs,
        "Job orchestrator v{}",
        env!("CARGO_PKG_VERSION")
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlBackend::new_local(Path::new(&config.db_path))
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path))?,
    );
    info!(path = %config.db_path, "Database ready");

    // ── Cache + notifications ────────────────────────────────────────────
    let fast_store: Arc<dyn FastStore> = InMemoryFastStore::new();
    let _sweep_handle = spawn_sweep_task(Arc::clone(&fast_store), config.cache.sweep_interval);
    let cache = CacheAside::new(fast_store, TtlPolicy::from(&config.cache));
    let hub = NotificationHub::new(config.notify.buffer);
    let registry = Arc::new(JobRegistry::new(store, cache.clone(), hub));

    // ── Handlers ─────────────────────────────────────────────────────────
    let embedder = Arc::new(HashingEmbedder::default());
    let similarity = Arc::new(CosineScorer::new(embedder.clone()));
    let index = VectorIndex::new(embedder.clone());
    let federation = FederationEngine::new(
        similarity.clone(),
        index.clone(),
        config.delegation.clone(),
        config.circuit.clone(),
        RetryPolicy::from(&config.retry),
    )
    .with_cache(cache.clone());

    let handlers = HandlerRegistry::new()
        .with(Arc::new(EmbeddingRequestHandler::new(embedder.clone(), cache.clone())))
        .with(Arc::new(
            DocumentProcessingHandler::new(embedder.clone(), cache.clone()).with_index(index),
        ))
        .with(Arc::new(FederatedQueryHandler::new(Arc::new(federation))))
        .with(Arc::new(AgentExecutionHandler::new(Arc::new(EchoExecutor))));

    let agents = AgentRegistry::new();
    match &config.agents_file {
        Some(path) => {
            agents
                .load_file(Path::new(path))
                .await
                .with_context(|| format!("Failed to load agent profiles from {path}"))?;
        }
        None => warn!("ORCH_AGENTS_FILE not set, agent jobs will not be delegated"),
    }
    let delegation = Delegation {
        scorer: Arc::new(DelegationScorer::new(
            similarity,
            config.delegation.delegation_threshold,
        )),
        agents,
        max_depth: config.delegation.max_delegation_depth,
    };
    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::clone(&registry),
            Arc::new(handlers),
            config.worker.clone(),
            config.service_name.clone(),
        )
        .with_delegation(delegation),
    );

    // ── Startup recovery ─────────────────────────────────────────────────
    let queued = registry.recover().await.context("Job recovery failed")?;
    let _worker_handle = dispatcher.start().await?;
    let requeued = dispatcher.requeue(queued).await?;
    if requeued > 0 {
        info!(count = requeued, "Recovered queued jobs");
    }

    // ── HTTP / WebSocket ─────────────────────────────────────────────────
    let app = job_routes(AppState {
        dispatcher: Arc::clone(&dispatcher),
        notify: config.notify.clone(),
        service_name: config.service_name.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Listening");

    let shutdown = Arc::clone(&dispatcher);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutting down");
            shutdown.shutdown();
        })
        .await
        .context("Server error")?;
    Ok(())
}
