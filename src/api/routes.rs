//! REST endpoints for jobs plus the per-job status socket.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State, ws::WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use super::extract::{ApiError, RequestContext};
use crate::config::NotifyConfig;
use crate::error::JobError;
use crate::jobs::JobType;
use crate::notify::ws::{JobSocket, handle_job_socket};
use crate::worker::{Dispatcher, SubmitOptions};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub notify: NotifyConfig,
    pub service_name: String,
}

/// Build the router with job REST and WebSocket routes.
pub fn job_routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs))
        // One segment name: `POST` takes a job type, `GET` a job id.
        .route("/jobs/{id}", get(get_job).post(submit_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/ws/jobs/{id}", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": state.service_name,
        "running_jobs": state.dispatcher.running_count().await,
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

fn parse_job_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id)
        .map_err(|_| ApiError::from(JobError::InvalidParams(format!("invalid job id: {id}"))))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(default = "empty_params")]
    params: serde_json::Value,
    #[serde(default)]
    max_duration_secs: Option<u64>,
    #[serde(default)]
    priority: Option<u8>,
}

fn empty_params() -> serde_json::Value {
    serde_json::json!({})
}

async fn submit_job(
    State(state): State<AppState>,
    Path(job_type): Path<String>,
    RequestContext(ctx): RequestContext,
    Json(body): Json<SubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_type: JobType = job_type.parse()?;
    let options = SubmitOptions {
        max_duration: body.max_duration_secs.map(Duration::from_secs),
        priority: body.priority,
    };
    let outcome = state
        .dispatcher
        .submit(&ctx, job_type, body.params, options)
        .await?;

    info!(
        job_id = %outcome.job.job_id,
        tenant = %ctx.tenant_id(),
        job_type = %job_type,
        memoized = outcome.memoized,
        "Job submitted"
    );
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "job_id": outcome.job.job_id,
            "status": outcome.job.status,
            "memoized": outcome.memoized,
            "delegated_to": outcome.delegated_to,
        })),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RequestContext(ctx): RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let job = state
        .dispatcher
        .registry()
        .get_job_status(&ctx, job_id)
        .await?
        .ok_or(JobError::NotFound { id: job_id })?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    RequestContext(ctx): RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let jobs = state.dispatcher.registry().list_jobs(&ctx, limit).await?;
    Ok(Json(jobs))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RequestContext(ctx): RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    let cancelled = state.dispatcher.cancel(&ctx, job_id).await?;
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    RequestContext(ctx): RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = parse_job_id(&id)?;
    info!(job_id = %job_id, tenant = %ctx.tenant_id(), "WebSocket client connecting");
    let session = JobSocket::new(
        ctx,
        job_id,
        Arc::clone(state.dispatcher.registry()),
        &state.notify,
    );
    Ok(ws.on_upgrade(move |socket| handle_job_socket(socket, session)))
}
