// tests/common/mod.rs — In-process mock upstream for integration tests
//
// Plays the roles of both the GitHub token-exchange endpoint and a chat
// upstream (Copilot or OpenAI-compatible). Chat responses follow a script;
// when the script runs dry every request succeeds with a canned completion.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

#[derive(Clone)]
pub enum MockResponse {
    /// 200 with the given JSON body.
    Json(Value),
    /// Arbitrary status, optional Retry-After (seconds).
    Status {
        code: u16,
        retry_after: Option<u64>,
        body: String,
    },
    /// SSE stream of the given frames; optionally die mid-stream after them.
    Sse {
        frames: Vec<String>,
        then_error: bool,
    },
}

pub struct MockState {
    pub token_calls: AtomicUsize,
    pub chat_calls: AtomicUsize,
    pub models_calls: AtomicUsize,
    /// TTL stamped onto issued bearers (seconds from now).
    pub token_ttl: u64,
    /// Artificial latency on the token exchange (singleflight tests).
    pub token_delay: Duration,
    /// When set, the token exchange answers 500.
    pub token_fail: AtomicBool,
    /// Artificial latency before any chat response (timeout tests).
    pub chat_delay: Duration,
    pub chat_script: Mutex<VecDeque<MockResponse>>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            token_calls: AtomicUsize::new(0),
            chat_calls: AtomicUsize::new(0),
            models_calls: AtomicUsize::new(0),
            token_ttl: 1800,
            token_delay: Duration::ZERO,
            token_fail: AtomicBool::new(false),
            chat_delay: Duration::ZERO,
            chat_script: Mutex::new(VecDeque::new()),
        }
    }
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockUpstream {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn token_url(&self) -> String {
        format!("http://{}/token", self.addr)
    }

    pub fn script(&self, responses: Vec<MockResponse>) {
        let mut script = self.state.chat_script.lock().unwrap();
        script.clear();
        script.extend(responses);
    }

    pub fn token_calls(&self) -> usize {
        self.state.token_calls.load(Ordering::SeqCst)
    }

    pub fn chat_calls(&self) -> usize {
        self.state.chat_calls.load(Ordering::SeqCst)
    }

    pub fn models_calls(&self) -> usize {
        self.state.models_calls.load(Ordering::SeqCst)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

pub fn canned_completion() -> Value {
    json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "ok"},
            "finish_reason": "stop"
        }]
    })
}

async fn token_endpoint(State(state): State<Arc<MockState>>) -> Response {
    if !state.token_delay.is_zero() {
        tokio::time::sleep(state.token_delay).await;
    }
    let n = state.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if state.token_fail.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "exchange down").into_response();
    }
    Json(json!({
        "token": format!("bearer-{n}"),
        "expires_at": unix_now() + state.token_ttl,
    }))
    .into_response()
}

async fn chat_endpoint(State(state): State<Arc<MockState>>) -> Response {
    if !state.chat_delay.is_zero() {
        tokio::time::sleep(state.chat_delay).await;
    }
    state.chat_calls.fetch_add(1, Ordering::SeqCst);

    let next = state.chat_script.lock().unwrap().pop_front();
    match next.unwrap_or(MockResponse::Json(canned_completion())) {
        MockResponse::Json(body) => Json(body).into_response(),
        MockResponse::Status {
            code,
            retry_after,
            body,
        } => {
            let mut builder =
                Response::builder().status(StatusCode::from_u16(code).unwrap());
            if let Some(seconds) = retry_after {
                builder = builder.header(header::RETRY_AFTER, seconds.to_string());
            }
            builder.body(Body::from(body)).unwrap()
        }
        MockResponse::Sse { frames, then_error } => {
            let mut items: Vec<Result<Bytes, std::io::Error>> = frames
                .into_iter()
                .map(|frame| Ok(Bytes::from(frame)))
                .collect();
            if then_error {
                items.push(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock upstream died",
                )));
            }
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .body(Body::from_stream(futures::stream::iter(items)))
                .unwrap()
        }
    }
}

async fn models_endpoint(State(state): State<Arc<MockState>>) -> Json<Value> {
    state.models_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "object": "list",
        "data": [
            {"id": "gpt-4o", "object": "model", "owned_by": "mock"},
            {"id": "o3-mini", "object": "model", "owned_by": "mock"}
        ]
    }))
}

/// Bind a mock upstream on an ephemeral port and serve it in the background.
pub async fn spawn_upstream(state: MockState) -> MockUpstream {
    let state = Arc::new(state);
    let router = Router::new()
        .route("/token", get(token_endpoint))
        .route("/chat/completions", post(chat_endpoint))
        .route("/models", get(models_endpoint))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    MockUpstream { addr, state }
}

// ─── Config/context helpers ─────────────────────────────────────────────────

use copilot_fanout::infra::config::{
    AccountConfig, CopilotConfig, OpenAiCompatConfig, RateLimitConfig,
};
use copilot_fanout::provider::ChatContext;

fn windows(rate_limits: Vec<(u64, usize)>) -> Vec<RateLimitConfig> {
    rate_limits
        .into_iter()
        .map(|(duration, max_requests)| RateLimitConfig {
            duration,
            max_requests,
        })
        .collect()
}

pub fn copilot_config(
    upstream: &MockUpstream,
    priority: i32,
    accounts: &[&str],
    rate_limits: Vec<(u64, usize)>,
) -> CopilotConfig {
    CopilotConfig {
        name: Some("copilot".into()),
        enabled: true,
        priority,
        rate_limits: windows(rate_limits),
        accounts: accounts
            .iter()
            .map(|id| AccountConfig {
                id: id.to_string(),
                token: format!("ghu_{id}"),
                proxy: None,
                rate_limits: vec![],
            })
            .collect(),
        chat_base_url: upstream.base_url(),
        token_url: upstream.token_url(),
    }
}

pub fn compat_config(
    upstream: &MockUpstream,
    priority: i32,
    rate_limits: Vec<(u64, usize)>,
) -> OpenAiCompatConfig {
    OpenAiCompatConfig {
        name: Some("compat".into()),
        enabled: true,
        priority,
        rate_limits: windows(rate_limits),
        base_url: upstream.base_url(),
        api_key: "sk-test".into(),
        model_mapping: Default::default(),
    }
}

pub fn chat_ctx(stream: bool) -> ChatContext {
    ChatContext {
        endpoint: "/chat/completions".into(),
        model: "gpt-4o".into(),
        stream,
        accept: None,
        body: json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hello"}],
            "stream": stream
        }),
    }
}
