//! Shared fixtures: fake tool servers on ephemeral ports and runtime wiring.

#![allow(dead_code)]

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard::agent::ScriptedModel;
use switchboard::events::{SseDecoder, ToolEvent};
use switchboard::secrets::StaticSecretResolver;
use switchboard::signing::NoCredentials;
use switchboard::tools::LocalToolTable;
use switchboard::{Config, Runtime, RuntimeParts};
use tokio::net::TcpListener;

/// Serve `router` on 127.0.0.1 and return its base URL.
pub async fn spawn(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}

/// Counters observed by the fake tool servers.
#[derive(Debug, Default)]
pub struct Counters {
    pub requests: AtomicUsize,
    pub initialize: AtomicUsize,
    pub calls: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub closed: AtomicUsize,
    /// `x-tenant` header of every tool call, in arrival order.
    pub tenants: Mutex<Vec<Option<String>>>,
    /// When set, the persistent server answers the next call with 404 as if
    /// it had dropped the session.
    pub forget_session: AtomicBool,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn tenants(&self) -> Vec<Option<String>> {
        self.tenants.lock().unwrap().clone()
    }

    fn record_tenant(&self, headers: &HeaderMap) {
        let tenant = headers
            .get("x-tenant")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.tenants.lock().unwrap().push(tenant);
    }
}

#[derive(Clone)]
struct EphemeralState {
    counters: Arc<Counters>,
    status: StatusCode,
}

/// Request/response tool server. Answers `{"tool", "echo"}` with `status`.
pub async fn ephemeral_server(status: StatusCode) -> (String, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let state = EphemeralState {
        counters: Arc::clone(&counters),
        status,
    };
    let router = Router::new()
        .route("/tool", post(ephemeral_call))
        .with_state(state);
    (format!("{}/tool", spawn(router).await), counters)
}

async fn ephemeral_call(
    State(state): State<EphemeralState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.counters.requests.fetch_add(1, Ordering::SeqCst);
    state.counters.calls.fetch_add(1, Ordering::SeqCst);
    state.counters.record_tenant(&headers);
    if !state.status.is_success() {
        return (state.status, "unavailable").into_response();
    }
    let city = body["arguments"]["city"].as_str().unwrap_or("nowhere").to_string();
    Json(json!({"tool": body["name"], "city": city, "temperature": 3})).into_response()
}

#[derive(Clone)]
struct PersistentState {
    counters: Arc<Counters>,
    handshake_delay: Duration,
    call_delay: Duration,
}

/// Streamable-HTTP JSON-RPC tool server with a session header.
pub async fn persistent_server(
    handshake_delay: Duration,
    call_delay: Duration,
) -> (String, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let state = PersistentState {
        counters: Arc::clone(&counters),
        handshake_delay,
        call_delay,
    };
    let router = Router::new()
        .route("/mcp", any(persistent_rpc))
        .with_state(state);
    (format!("{}/mcp", spawn(router).await), counters)
}

async fn persistent_rpc(
    State(state): State<PersistentState>,
    method: axum::http::Method,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.counters.requests.fetch_add(1, Ordering::SeqCst);
    if method == axum::http::Method::DELETE {
        state.counters.closed.fetch_add(1, Ordering::SeqCst);
        return StatusCode::NO_CONTENT.into_response();
    }
    let message: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let id = message["id"].clone();
    match message["method"].as_str().unwrap_or_default() {
        "initialize" => {
            state.counters.initialize.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(state.handshake_delay).await;
            (
                [("mcp-session-id", "fake-session-1")],
                Json(json!({"jsonrpc": "2.0", "id": id,
                            "result": {"protocolVersion": "2025-03-26", "capabilities": {}}})),
            )
                .into_response()
        }
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        "notifications/cancelled" => {
            state.counters.cancelled.fetch_add(1, Ordering::SeqCst);
            StatusCode::ACCEPTED.into_response()
        }
        "tools/call" => {
            if headers.get("mcp-session-id").is_none() {
                return StatusCode::BAD_REQUEST.into_response();
            }
            if state.counters.forget_session.swap(false, Ordering::SeqCst) {
                return StatusCode::NOT_FOUND.into_response();
            }
            state.counters.calls.fetch_add(1, Ordering::SeqCst);
            state.counters.record_tenant(&headers);
            tokio::time::sleep(state.call_delay).await;
            let frame = format!(
                "data: {}\n\n",
                json!({"jsonrpc": "2.0", "id": id,
                       "result": {"content": [{"type": "text", "text": "ok"}]}})
            );
            ([("content-type", "text/event-stream")], frame).into_response()
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// Runtime over `config` with a scripted model and in-memory secrets.
pub fn runtime(config: Value, model: Arc<ScriptedModel>, secrets: StaticSecretResolver) -> Arc<Runtime> {
    let config: Config = serde_json::from_value(config).unwrap();
    Arc::new(
        Runtime::new(
            config,
            RuntimeParts {
                model,
                secrets: Arc::new(secrets),
                credentials: Arc::new(NoCredentials),
                local_tools: LocalToolTable::with_builtins(),
            },
        )
        .unwrap(),
    )
}

/// Read an SSE response body to the end, returning the decoded events and
/// whether the `[DONE]` sentinel arrived.
pub async fn read_events(response: reqwest::Response) -> (Vec<ToolEvent>, bool) {
    let mut decoder = SseDecoder::new();
    let mut events = Vec::new();
    let mut done = false;
    let mut response = response;
    while let Some(chunk) = response.chunk().await.unwrap() {
        for message in decoder.feed(&chunk) {
            if message.is_done() {
                done = true;
            } else if let Some(event) = message.tool_event().unwrap() {
                events.push(event);
            }
        }
    }
    (events, done)
}
