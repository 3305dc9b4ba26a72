//! Integration tests for the job REST + WebSocket surface.
//!
//! Each test spins up an Axum server on a random port with a running
//! dispatcher, then drives it with reqwest and tokio-tungstenite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use job_orchestrator::api::{AppState, job_routes};
use job_orchestrator::cache::{CacheAside, InMemoryFastStore, TtlPolicy};
use job_orchestrator::config::{NotifyConfig, WorkerConfig};
use job_orchestrator::error::JobError;
use job_orchestrator::jobs::{JobRegistry, JobType};
use job_orchestrator::notify::NotificationHub;
use job_orchestrator::store::LibSqlBackend;
use job_orchestrator::worker::builtin::EmbeddingRequestHandler;
use job_orchestrator::worker::{
    Dispatcher, ExecutionContext, HandlerRegistry, HashingEmbedder, JobHandler,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Agent handler that runs until cancelled.
struct Stalling;

#[async_trait]
impl JobHandler for Stalling {
    fn job_type(&self) -> JobType {
        JobType::AgentExecution
    }

    async fn execute(
        &self,
        exec: &ExecutionContext,
        _params: &Value,
    ) -> job_orchestrator::error::Result<Value> {
        exec.report_progress(0.1).await;
        exec.cancelled().await;
        Err(JobError::Cancelled { id: exec.job_id }.into())
    }
}

/// Start an Axum server on a random port, return the base address.
async fn start_server() -> String {
    start_server_with(NotifyConfig::default()).await
}

async fn start_server_with(notify: NotifyConfig) -> String {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let cache = CacheAside::new(InMemoryFastStore::new(), TtlPolicy::default());
    let registry = Arc::new(JobRegistry::new(store, cache.clone(), NotificationHub::new(32)));
    let handlers = HandlerRegistry::new()
        .with(Arc::new(EmbeddingRequestHandler::new(
            Arc::new(HashingEmbedder::new(32)),
            cache,
        )))
        .with(Arc::new(Stalling));
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        Arc::new(handlers),
        WorkerConfig::default(),
        "orchestrator",
    ));
    dispatcher.start().await.unwrap();

    let app = job_routes(AppState {
        dispatcher,
        notify,
        service_name: "orchestrator".into(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

async fn submit(addr: &str, tenant: &str, job_type: &str, params: Value) -> Value {
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/jobs/{job_type}"))
        .header("x-tenant-id", tenant)
        .json(&serde_json::json!({ "params": params }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    response.json().await.unwrap()
}

async fn wait_for_status(addr: &str, tenant: &str, job_id: &str, status: &str) -> Value {
    let client = reqwest::Client::new();
    loop {
        let job: Value = client
            .get(format!("http://{addr}/jobs/{job_id}"))
            .header("x-tenant-id", tenant)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if job["status"] == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_job_socket(addr: &str, tenant: &str, job_id: &str) -> Socket {
    let mut request = format!("ws://{addr}/ws/jobs/{job_id}")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-tenant-id", tenant.parse().unwrap());
    let (ws, _resp) = connect_async(request).await.expect("WS connect failed");
    ws
}

/// Next text frame, skipping protocol pings.
async fn next_json(ws: &mut Socket) -> Value {
    loop {
        let msg = ws.next().await.expect("socket closed").unwrap();
        if matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            continue;
        }
        return parse_ws_json(&msg);
    }
}

// ── REST ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn embedding_job_completes_and_memoizes() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;

        let created = submit(&addr, "t1", "embedding_request", serde_json::json!({"text": "hello"})).await;
        assert_eq!(created["memoized"], false);
        let job_id = created["job_id"].as_str().unwrap();

        let job = wait_for_status(&addr, "t1", job_id, "completed").await;
        assert_eq!(job["result"]["dimensions"], 32);
        assert_eq!(job["result"]["embeddings"].as_array().unwrap().len(), 1);

        let again = submit(&addr, "t1", "embedding_request", serde_json::json!({"text": "hello"})).await;
        assert_eq!(again["memoized"], true);
        assert_eq!(again["status"], "completed");
        assert_ne!(again["job_id"], created["job_id"]);

        // Memoized results do not cross tenants.
        let other = submit(&addr, "t2", "embedding_request", serde_json::json!({"text": "hello"})).await;
        assert_eq!(other["memoized"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn missing_tenant_header_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/jobs/embedding_request"))
            .json(&serde_json::json!({"params": {"text": "x"}}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"]["code"], "validation_error");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn foreign_tenant_cannot_read_job() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let created = submit(&addr, "t1", "embedding_request", serde_json::json!({"text": "secret"})).await;
        let job_id = created["job_id"].as_str().unwrap();

        let response = reqwest::Client::new()
            .get(format!("http://{addr}/jobs/{job_id}"))
            .header("x-tenant-id", "t2")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    })
    .await
    .expect("test timed out");
}

// ── WebSocket ───────────────────────────────────────────────────────────

#[tokio::test]
async fn ws_streams_cancellation() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let created = submit(&addr, "t1", "agent_execution", serde_json::json!({"query": "q"})).await;
        let job_id = created["job_id"].as_str().unwrap().to_string();
        wait_for_status(&addr, "t1", &job_id, "processing").await;

        let mut ws = connect_job_socket(&addr, "t1", &job_id).await;
        let established = next_json(&mut ws).await;
        assert_eq!(established["type"], "connection_established");
        assert_eq!(established["job_id"], job_id.as_str());

        let snapshot = next_json(&mut ws).await;
        assert_eq!(snapshot["type"], "status_update");
        assert_eq!(snapshot["status"], "processing");

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/jobs/{job_id}/cancel"))
            .header("x-tenant-id", "t1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let frame = loop {
            let frame = next_json(&mut ws).await;
            if frame["type"] != "status_update" {
                break frame;
            }
        };
        assert_eq!(frame["type"], "job_error");
        assert_eq!(frame["error"]["code"], "cancelled");

        // Terminal event ends the stream.
        match ws.next().await {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_answers_ping_with_pong() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let created = submit(&addr, "t1", "agent_execution", serde_json::json!({"query": "q"})).await;
        let job_id = created["job_id"].as_str().unwrap().to_string();

        let mut ws = connect_job_socket(&addr, "t1", &job_id).await;
        assert_eq!(next_json(&mut ws).await["type"], "connection_established");
        assert_eq!(next_json(&mut ws).await["type"], "status_update");

        ws.send(Message::Text(r#"{"action":"ping"}"#.into())).await.unwrap();
        let pong = loop {
            let frame = next_json(&mut ws).await;
            if frame["type"] != "status_update" {
                break frame;
            }
        };
        assert_eq!(pong["type"], "pong");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_silent_client_is_dropped_after_heartbeat_timeout() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server_with(NotifyConfig {
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_millis(250),
            ..NotifyConfig::default()
        })
        .await;
        let created = submit(&addr, "t1", "agent_execution", serde_json::json!({"query": "q"})).await;
        let job_id = created["job_id"].as_str().unwrap().to_string();

        let mut ws = connect_job_socket(&addr, "t1", &job_id).await;
        assert_eq!(next_json(&mut ws).await["type"], "connection_established");

        // Not polling the stream means server pings go unanswered.
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Reading now would answer the pings; the stream must end regardless.
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .expect("server kept a silent client connected");
}

#[tokio::test]
async fn ws_for_foreign_job_reports_not_found() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let created = submit(&addr, "t1", "agent_execution", serde_json::json!({"query": "q"})).await;
        let job_id = created["job_id"].as_str().unwrap().to_string();

        let mut ws = connect_job_socket(&addr, "t2", &job_id).await;
        assert_eq!(next_json(&mut ws).await["type"], "connection_established");
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "job_error");
        assert_eq!(frame["error"]["code"], "not_found");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_for_finished_job_sends_result_and_closes() {
    timeout(TEST_TIMEOUT, async {
        let addr = start_server().await;
        let created = submit(&addr, "t1", "embedding_request", serde_json::json!({"text": "done"})).await;
        let job_id = created["job_id"].as_str().unwrap().to_string();
        wait_for_status(&addr, "t1", &job_id, "completed").await;

        let mut ws = connect_job_socket(&addr, "t1", &job_id).await;
        assert_eq!(next_json(&mut ws).await["type"], "connection_established");
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "job_completed");
        assert_eq!(frame["result"]["dimensions"], 32);

        match ws.next().await {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}
