//! Mock backend server that simulates an Ollama server
//!
//! Serves the endpoints the proxy talks to (liveness, chat/generate, pull,
//! tags) plus a webhook sink for usage events. Tests pre-configure
//! completion responses via SharedBackendState before each request.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::types::{BackendState, MockResponse, ReceivedRequest, SharedBackendState, WebhookEvent};

/// Model the mock pretends it cannot find
pub const MISSING_MODEL: &str = "missing-model";

/// Default models list returned by /api/tags
fn default_tags_response() -> &'static str {
    r#"{"models":[{"name":"llama3.2:latest","model":"llama3.2:latest","modified_at":"2024-05-01T10:00:00Z","size":2019393189,"digest":"a80c4f17acd5"},{"name":"phi3:mini","model":"phi3:mini","modified_at":"2024-05-01T10:00:00Z","size":2176178913,"digest":"4f2222927938"}]}"#
}

/// Default fallback response when no response is queued
fn default_completion_response() -> MockResponse {
    MockResponse::ndjson(vec![
        r#"{"model":"llama3.2","created_at":"2024-05-01T10:00:00Z","message":{"role":"assistant","content":"Default response (no mock queued)"},"done":false}"#.to_string(),
        r#"{"model":"llama3.2","created_at":"2024-05-01T10:00:01Z","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","total_duration":1000000,"prompt_eval_count":10,"eval_count":5,"eval_duration":500000}"#.to_string(),
    ])
}

async fn record_request(state: &SharedBackendState, request: Request<Body>) -> ReceivedRequest {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let headers = request
        .headers()
        .iter()
        .map(|(n, v)| (n.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();

    let body_bytes = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap_or_default();
    let body: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap_or(serde_json::Value::Null);

    let received = ReceivedRequest {
        method,
        path,
        query,
        headers,
        body,
    };
    state.lock().unwrap().received_requests.push(received.clone());
    received
}

/// Handle POST /api/chat and /api/generate - serves pre-configured mock responses
async fn handle_completion(State(state): State<SharedBackendState>, request: Request<Body>) -> Response {
    record_request(&state, request).await;

    let mock_response = state
        .lock()
        .unwrap()
        .response_queue
        .pop_front()
        .unwrap_or_else(default_completion_response);

    let mut frames: Vec<Result<String, std::io::Error>> = mock_response.chunks.into_iter().map(Ok).collect();
    if mock_response.fail_after {
        frames.push(Err(std::io::Error::other("mock backend crashed mid-stream")));
    }

    // Pace the crash so the head and earlier chunks reach the proxy first
    let paced = mock_response.fail_after;
    let stream = futures::stream::iter(frames).then(move |frame| async move {
        if paced && frame.is_err() {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        frame
    });

    Response::builder()
        .status(mock_response.status)
        .header("Content-Type", &mock_response.content_type)
        .body(Body::from_stream(stream))
        .unwrap()
}

/// Handle GET / (Ollama liveness)
async fn handle_root() -> impl IntoResponse {
    (StatusCode::OK, "Ollama is running")
}

/// Handle POST /api/pull - progress records, or an error record for MISSING_MODEL
async fn handle_pull(State(state): State<SharedBackendState>, body: axum::Json<serde_json::Value>) -> Response {
    let model = body.get("model").and_then(|m| m.as_str()).unwrap_or_default().to_string();
    state.lock().unwrap().pulls.push(model.clone());

    let body = if model == MISSING_MODEL {
        "{\"status\":\"pulling manifest\"}\n{\"error\":\"pull model manifest: file does not exist\"}\n".to_string()
    } else {
        [
            r#"{"status":"pulling manifest"}"#,
            r#"{"status":"pulling dde5","digest":"sha256:dde5","total":1000,"completed":250}"#,
            r#"{"status":"pulling dde5","digest":"sha256:dde5","total":1000,"completed":1000}"#,
            r#"{"status":"verifying sha256 digest"}"#,
            r#"{"status":"success"}"#,
        ]
        .join("\n")
            + "\n"
    };

    (StatusCode::OK, [("Content-Type", "application/x-ndjson")], body).into_response()
}

/// Handle GET /api/tags
async fn handle_tags() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "application/json")],
        default_tags_response(),
    )
}

/// Handle POST /webhook - records usage events from the proxy
async fn handle_webhook(State(state): State<SharedBackendState>, headers: HeaderMap, body: String) -> StatusCode {
    let event = WebhookEvent {
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body)),
    };
    state.lock().unwrap().webhook_events.push(event);
    StatusCode::NO_CONTENT
}

/// Anything else: record it and answer 404 like Ollama does
async fn handle_fallback(State(state): State<SharedBackendState>, request: Request<Body>) -> impl IntoResponse {
    record_request(&state, request).await;
    (StatusCode::NOT_FOUND, "404 page not found")
}

/// Start the mock backend server and return the shared state handle
pub async fn start(port: u16) -> anyhow::Result<SharedBackendState> {
    let state: SharedBackendState = std::sync::Arc::new(std::sync::Mutex::new(BackendState::default()));

    let app = Router::new()
        .route("/", get(handle_root))
        .route("/api/chat", post(handle_completion))
        .route("/api/generate", post(handle_completion))
        .route("/api/pull", post(handle_pull))
        .route("/api/tags", get(handle_tags))
        .route("/webhook", post(handle_webhook))
        .fallback(handle_fallback)
        .with_state(state.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind mock backend to {}: {}", addr, e))?;

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Mock backend server failed");
    });

    // Brief pause to let the server start accepting connections
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

    Ok(state)
}

/// Helper to configure the next response for /api/chat or /api/generate
pub fn queue_response(state: &SharedBackendState, response: MockResponse) {
    state.lock().unwrap().response_queue.push_back(response);
}

/// Helper to get all requests received since last clear
pub fn drain_requests(state: &SharedBackendState) -> Vec<ReceivedRequest> {
    let mut s = state.lock().unwrap();
    s.received_requests.drain(..).collect()
}

/// Snapshot of webhook events received since last clear
pub fn webhook_events(state: &SharedBackendState) -> Vec<WebhookEvent> {
    state.lock().unwrap().webhook_events.clone()
}

/// Snapshot of models pulled so far
pub fn pulled_models(state: &SharedBackendState) -> Vec<String> {
    state.lock().unwrap().pulls.clone()
}
