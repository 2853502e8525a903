//! Client-facing HTTP surface.
//!
//! Sessions travel in the `X-Session-ID` header: absent means "create", and
//! the resolved id is always echoed back so clients can persist it. Chat
//! responses are `text/event-stream` bodies of `data: <ToolEvent>` frames
//! closed by `data: [DONE]`.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures::{stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::events::sse::{self, done_frame, encode_event};
use crate::runtime::Runtime;
use crate::types::{Error, Result};

pub const SESSION_HEADER: &str = "x-session-id";
pub const SESSION_STATUS_HEADER: &str = "x-session-status";

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat", post(chat))
        .route("/v1/sessions/{id}/abort", post(abort))
        .route("/v1/sessions/{id}", delete(destroy))
        .route("/v1/tools", get(list_tools))
        .route("/v1/tools/{tool_id}", put(toggle_tool))
        .with_state(runtime)
}

/// Serve the API until `shutdown` resolves.
pub async fn serve(
    runtime: Arc<Runtime>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "http api listening");
    axum::serve(listener, router(runtime))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| Error::internal("header value not representable"))
}

async fn health(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    let (sessions, pool) = runtime.stats().await;
    Json(json!({"status": "ok", "sessions": sessions, "pool": pool}))
}

async fn chat(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response> {
    if request.message.trim().is_empty() {
        return Err(Error::validation("message must not be empty"));
    }
    let resolved = runtime.resolve_session(session_header(&headers)).await?;

    let mut response = match runtime.start_run(&resolved, &request.message) {
        Ok(events) => {
            let frames = events
                .map(|event| encode_event(&event))
                .chain(stream::once(async { Ok::<_, Error>(done_frame()) }));
            let mut response = Response::new(Body::from_stream(frames));
            let response_headers = response.headers_mut();
            response_headers.insert(CONTENT_TYPE, HeaderValue::from_static(sse::CONTENT_TYPE));
            response_headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            response
        }
        Err(e) => e.into_response(),
    };
    // echoed on errors too, once the session is known
    let response_headers = response.headers_mut();
    response_headers.insert(SESSION_HEADER, header_value(resolved.context.id().as_str())?);
    response_headers.insert(
        SESSION_STATUS_HEADER,
        HeaderValue::from_static(resolved.status.as_str()),
    );
    Ok(response)
}

async fn abort(State(runtime): State<Arc<Runtime>>, Path(id): Path<String>) -> Result<Response> {
    let aborted = runtime.abort(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"aborted": aborted}))).into_response())
}

async fn destroy(State(runtime): State<Arc<Runtime>>, Path(id): Path<String>) -> StatusCode {
    runtime.destroy(&id).await;
    StatusCode::NO_CONTENT
}

async fn list_tools(State(runtime): State<Arc<Runtime>>, headers: HeaderMap) -> Result<Response> {
    let tools = runtime.catalog(session_header(&headers)).await?;
    Ok(Json(json!({"tools": tools})).into_response())
}

async fn toggle_tool(
    State(runtime): State<Arc<Runtime>>,
    Path(tool_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ToggleRequest>,
) -> Result<Response> {
    let session_id = session_header(&headers)
        .ok_or_else(|| Error::validation("X-Session-ID header is required"))?;
    runtime.set_enabled(session_id, &tool_id, request.enabled).await?;
    Ok(Json(json!({"toolId": tool_id, "enabled": request.enabled})).into_response())
}
