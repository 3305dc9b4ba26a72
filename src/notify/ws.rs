//! WebSocket session for one job's notifications.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{ClientAction, JobEvent, ServerFrame};
use crate::config::NotifyConfig;
use crate::context::ContextCarrier;
use crate::error::{ErrorInfo, codes};
use crate::jobs::JobRegistry;

/// Everything a socket needs once the upgrade has been accepted.
pub struct JobSocket {
    pub ctx: ContextCarrier,
    pub job_id: Uuid,
    pub registry: Arc<JobRegistry>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl JobSocket {
    pub fn new(
        ctx: ContextCarrier,
        job_id: Uuid,
        registry: Arc<JobRegistry>,
        config: &NotifyConfig,
    ) -> Self {
        Self {
            ctx,
            job_id,
            registry,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }
}

/// Serialize and send one frame. Returns false once the client is gone.
async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize frame");
            true
        }
    }
}

/// Drive one connection until the job finishes, the client leaves, or the
/// heartbeat times out.
pub async fn handle_job_socket(mut socket: WebSocket, session: JobSocket) {
    let JobSocket {
        ctx,
        job_id,
        registry,
        heartbeat_interval,
        heartbeat_timeout,
    } = session;

    // Subscribe before the snapshot so no transition falls in between.
    let mut subscription = registry.hub().subscribe(job_id).await;
    let client_id = subscription.client_id;
    info!(job_id = %job_id, client_id = %client_id, tenant = %ctx.tenant_id(), "WebSocket client connected");

    if !send_frame(
        &mut socket,
        &ServerFrame::ConnectionEstablished { job_id, client_id },
    )
    .await
    {
        registry.hub().unsubscribe(job_id, client_id).await;
        return;
    }

    let snapshot = match registry.get_job_status(&ctx, job_id).await {
        Ok(Some(job)) => JobEvent::from_job(&job),
        Ok(None) => {
            let error = ErrorInfo::new(codes::NOT_FOUND, format!("Job {job_id} not found"), false);
            send_frame(&mut socket, &ServerFrame::JobError { job_id, error }).await;
            close(socket, &registry, job_id, client_id).await;
            return;
        }
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Status snapshot failed");
            send_frame(
                &mut socket,
                &ServerFrame::Error {
                    message: e.to_string(),
                },
            )
            .await;
            close(socket, &registry, job_id, client_id).await;
            return;
        }
    };

    if !send_frame(&mut socket, &snapshot.to_frame()).await || snapshot.is_terminal() {
        close(socket, &registry, job_id, client_id).await;
        return;
    }

    let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                match event {
                    Some(event) => {
                        if !send_frame(&mut socket, &event.to_frame()).await {
                            debug!(job_id = %job_id, "Client disconnected during send");
                            break;
                        }
                        if event.is_terminal() {
                            break;
                        }
                    }
                    None => {
                        // Dropped by the hub (overflow); the client re-syncs.
                        send_frame(&mut socket, &ServerFrame::Error {
                            message: "Subscription dropped, re-fetch job status".into(),
                        }).await;
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > heartbeat_timeout {
                    warn!(job_id = %job_id, client_id = %client_id, "Heartbeat timeout, dropping client");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            result = socket.recv() => {
                last_seen = Instant::now();
                match result {
                    Some(Ok(Message::Text(text))) => {
                        let keep_going = handle_client_message(&mut socket, &text, &ctx, job_id, &registry).await;
                        if !keep_going {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(job_id = %job_id, client_id = %client_id, "WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    close(socket, &registry, job_id, client_id).await;
}

/// Handle one text frame. Returns false when the connection should end.
async fn handle_client_message(
    socket: &mut WebSocket,
    text: &str,
    ctx: &ContextCarrier,
    job_id: Uuid,
    registry: &JobRegistry,
) -> bool {
    match serde_json::from_str::<ClientAction>(text) {
        Ok(ClientAction::Ping) => send_frame(socket, &ServerFrame::Pong).await,
        Ok(ClientAction::Status) => match registry.get_job_status(ctx, job_id).await {
            Ok(Some(job)) => send_frame(socket, &JobEvent::from_job(&job).to_frame()).await,
            Ok(None) => false,
            Err(e) => {
                send_frame(
                    socket,
                    &ServerFrame::Error {
                        message: e.to_string(),
                    },
                )
                .await
            }
        },
        Err(e) => {
            debug!(error = %e, text = text, "Unrecognized WS message from client");
            send_frame(
                socket,
                &ServerFrame::Error {
                    message: format!("Unrecognized message: {e}"),
                },
            )
            .await
        }
    }
}

async fn close(mut socket: WebSocket, registry: &JobRegistry, job_id: Uuid, client_id: Uuid) {
    registry.hub().unsubscribe(job_id, client_id).await;
    let _ = socket.send(Message::Close(None)).await;
    debug!(job_id = %job_id, client_id = %client_id, "WebSocket connection closed");
}
