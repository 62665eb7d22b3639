//! Mock llama.cpp-style inference server
//!
//! Serves `/health`, `/v1/models` and `/completion` with scriptable
//! behaviour so readiness, retry and load tests run without a model.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bench_core::Result;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where the token count appears in completion responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `timings.predicted_n`, the llama.cpp server layout
    Timings,
    /// Top-level `tokens_predicted`
    TopLevel,
    /// `usage.completion_tokens`, the OpenAI-compatible layout
    Usage,
    /// No recognised token field at all
    Bare,
}

/// Scriptable behaviour of a [`MockServer`]
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Tokens reported per completion, `None` echoes the request's `n_predict`
    pub tokens: Option<u64>,

    /// Delay before every completion response
    pub latency: Duration,

    /// Status returned by `/health`
    pub health_status: u16,

    /// Status returned by `/v1/models`
    pub models_status: u16,

    /// Status returned by every completion, overriding success
    pub permanent_status: Option<u16>,

    /// Status returned by every completion after the first N succeed
    pub status_after: Option<(usize, u16)>,

    /// Server reports "Loading model" until this instant
    pub loading_until: Option<Instant>,

    pub shape: ResponseShape,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            tokens: None,
            latency: Duration::ZERO,
            health_status: 200,
            models_status: 200,
            permanent_status: None,
            status_after: None,
            loading_until: None,
            shape: ResponseShape::Timings,
        }
    }
}

impl MockBehavior {
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_permanent_status(mut self, status: u16) -> Self {
        self.permanent_status = Some(status);
        self
    }

    pub fn with_status_after(mut self, calls: usize, status: u16) -> Self {
        self.status_after = Some((calls, status));
        self
    }

    pub fn with_loading_for(mut self, duration: Duration) -> Self {
        self.loading_until = Some(Instant::now() + duration);
        self
    }

    pub fn with_shape(mut self, shape: ResponseShape) -> Self {
        self.shape = shape;
        self
    }

    fn is_loading(&self) -> bool {
        self.loading_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct MockState {
    behavior: RwLock<MockBehavior>,
    scripted_failures: Mutex<VecDeque<u16>>,
    completion_calls: AtomicUsize,
    health_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockState {
    fn behavior(&self) -> MockBehavior {
        self.behavior
            .read()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    fn next_failure(&self) -> Option<u16> {
        self.scripted_failures
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
    }
}

/// Decrements the in-flight gauge when a completion finishes
struct InFlight<'a>(&'a MockState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a MockState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A running mock server bound to a local port
#[derive(Debug)]
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    server_handle: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Start on an ephemeral port of 127.0.0.1
    pub async fn start(behavior: MockBehavior) -> Result<Self> {
        Self::start_on("127.0.0.1", 0, behavior).await
    }

    /// Start on a specific host and port
    pub async fn start_on(host: &str, port: u16, behavior: MockBehavior) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(MockState {
            behavior: RwLock::new(behavior),
            ..Default::default()
        });
        let app = create_app(state.clone());

        info!("Starting mock inference server on {}", addr);

        let server_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Mock inference server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            state,
            server_handle: Some(server_handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Queue statuses returned by the next completions, in order, before
    /// normal behaviour resumes
    pub fn push_failures(&self, statuses: &[u16]) {
        if let Ok(mut queue) = self.state.scripted_failures.lock() {
            queue.extend(statuses.iter().copied());
        }
    }

    /// Replace the behaviour of the running server
    pub fn set_behavior(&self, behavior: MockBehavior) {
        if let Ok(mut current) = self.state.behavior.write() {
            *current = behavior;
        }
    }

    /// Completion requests received so far
    pub fn completion_calls(&self) -> usize {
        self.state.completion_calls.load(Ordering::SeqCst)
    }

    pub fn health_calls(&self) -> usize {
        self.state.health_calls.load(Ordering::SeqCst)
    }

    /// Highest number of completions handled at once
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Stop serving; the port is released once the task is gone
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

fn create_app(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/models", get(models_handler))
        .route("/completion", post(completion_handler))
        .with_state(state)
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_body(status: u16, message: &str) -> Value {
    json!({
        "error": {
            "code": status,
            "message": message,
            "type": "unavailable_error",
        }
    })
}

async fn health_handler(State(state): State<Arc<MockState>>) -> Response {
    state.health_calls.fetch_add(1, Ordering::SeqCst);
    let behavior = state.behavior();

    if behavior.is_loading() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_body(503, "Loading model")),
        )
            .into_response();
    }

    (
        status_code(behavior.health_status),
        Json(json!({ "status": "ok" })),
    )
        .into_response()
}

async fn models_handler(State(state): State<Arc<MockState>>) -> Response {
    let behavior = state.behavior();
    if behavior.is_loading() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_body(503, "Loading model")),
        )
            .into_response();
    }

    (
        status_code(behavior.models_status),
        Json(json!({ "object": "list", "data": [{ "id": "mock-model" }] })),
    )
        .into_response()
}

async fn completion_handler(
    State(state): State<Arc<MockState>>,
    Json(request): Json<Value>,
) -> Response {
    let call = state.completion_calls.fetch_add(1, Ordering::SeqCst) + 1;
    let _guard = InFlight::enter(&state);
    let behavior = state.behavior();

    if !behavior.latency.is_zero() {
        tokio::time::sleep(behavior.latency).await;
    }

    if behavior.is_loading() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(error_body(503, "Loading model")),
        )
            .into_response();
    }

    let late_status = behavior
        .status_after
        .and_then(|(calls, status)| (call > calls).then_some(status));

    if let Some(status) = state
        .next_failure()
        .or(behavior.permanent_status)
        .or(late_status)
    {
        debug!(call, status, "Mock completion failing");
        let message = if status == 503 {
            "Loading model"
        } else {
            "scripted failure"
        };
        return (status_code(status), Json(error_body(status, message))).into_response();
    }

    let n_predict = request
        .get("n_predict")
        .and_then(Value::as_u64)
        .unwrap_or(16);
    let tokens = behavior.tokens.unwrap_or(n_predict);
    let predicted_ms = (behavior.latency.as_secs_f64() * 1000.0).max(1.0);

    let body = match behavior.shape {
        ResponseShape::Timings => json!({
            "content": "mock",
            "timings": {
                "predicted_n": tokens,
                "predicted_ms": predicted_ms,
                "predicted_per_second": tokens as f64 / (predicted_ms / 1000.0),
            }
        }),
        ResponseShape::TopLevel => json!({
            "content": "mock",
            "tokens_predicted": tokens,
        }),
        ResponseShape::Usage => json!({
            "content": "mock",
            "usage": { "completion_tokens": tokens },
        }),
        ResponseShape::Bare => json!({ "content": "mock" }),
    };

    (StatusCode::OK, Json(body)).into_response()
}
