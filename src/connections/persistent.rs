//! Session-oriented transport: streamable-HTTP JSON-RPC (MCP style).
//!
//! Establishment runs the `initialize` / `notifications/initialized`
//! handshake and captures the server's session id. Every call after that is
//! a `tools/call` request bound to the same session. Responses arrive either
//! as a JSON body or as an event stream carrying the JSON-RPC response.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::endpoint::{RequestProfile, ResolvedEndpoint};
use super::transport::{check_status, HttpSender, Transport};
use crate::events::sse::{SseDecoder, CONTENT_TYPE as EVENT_STREAM};
use crate::signing::OutboundRequest;
use crate::types::{Error, Result, ToolCallId};

pub const PROTOCOL_VERSION: &str = "2025-03-26";

const SESSION_HEADER: &str = "mcp-session-id";
const VERSION_HEADER: &str = "mcp-protocol-version";

#[derive(Debug)]
pub struct PersistentTransport {
    sender: Arc<HttpSender>,
    endpoint: ResolvedEndpoint,
    /// Headers and auth of the descriptor that opened the session; used for
    /// session-level traffic (handshake, cancel notices, close).
    profile: RequestProfile,
    session_id: Option<HeaderValue>,
    protocol_version: String,
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<ToolCallId, u64>>,
}

impl PersistentTransport {
    /// Run the handshake and return a ready session.
    pub async fn establish(sender: Arc<HttpSender>, endpoint: ResolvedEndpoint) -> Result<Self> {
        let profile = endpoint.profile();
        let mut transport = Self {
            sender,
            endpoint,
            profile,
            session_id: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
            next_id: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
        };

        let initialize = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "switchboard", "version": env!("CARGO_PKG_VERSION")},
            }
        });
        let response = transport.post(&initialize, &transport.profile).await?;
        let response = check_status(response).await?;
        transport.session_id = response.headers().get(SESSION_HEADER).cloned();
        let result = rpc_result(read_rpc_response(response, 0).await?)?;
        if let Some(version) = result.get("protocolVersion").and_then(Value::as_str) {
            transport.protocol_version = version.to_string();
        }

        let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        check_status(transport.post(&initialized, &transport.profile).await?).await?;

        info!(
            endpoint = %transport.endpoint.key,
            protocol = %transport.protocol_version,
            session = transport.session_id.is_some(),
            "persistent session established"
        );
        Ok(transport)
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|map| map.len()).unwrap_or_default()
    }

    fn request(
        &self,
        method: Method,
        body: Option<&Value>,
        profile: &RequestProfile,
    ) -> Result<OutboundRequest> {
        let url = self.endpoint.url.clone();
        let mut request = match body {
            Some(body) => OutboundRequest::json(method, url, body)?,
            None => OutboundRequest::new(method, url),
        };
        request.headers.extend(profile.headers.clone());
        request.headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        if let Some(session) = &self.session_id {
            request
                .headers
                .insert(HeaderName::from_static(SESSION_HEADER), session.clone());
        }
        if let Ok(version) = HeaderValue::from_str(&self.protocol_version) {
            request
                .headers
                .insert(HeaderName::from_static(VERSION_HEADER), version);
        }
        Ok(request)
    }

    async fn post(&self, body: &Value, profile: &RequestProfile) -> Result<Response> {
        let request = self.request(Method::POST, Some(body), profile)?;
        self.sender.send(&profile.auth, request).await
    }

    fn untrack(&self, call_id: &ToolCallId) -> Option<u64> {
        untrack(&self.in_flight, call_id)
    }
}

fn untrack(in_flight: &Mutex<HashMap<ToolCallId, u64>>, call_id: &ToolCallId) -> Option<u64> {
    in_flight.lock().ok().and_then(|mut map| map.remove(call_id))
}

/// Registration of an outstanding request id. Dropping it unregisters, so a
/// call future abandoned mid-flight leaves nothing behind.
struct InFlight<'a> {
    map: &'a Mutex<HashMap<ToolCallId, u64>>,
    call_id: &'a ToolCallId,
}

impl<'a> InFlight<'a> {
    fn register(
        map: &'a Mutex<HashMap<ToolCallId, u64>>,
        call_id: &'a ToolCallId,
        rpc_id: u64,
    ) -> Self {
        if let Ok(mut entries) = map.lock() {
            entries.insert(call_id.clone(), rpc_id);
        }
        Self { map, call_id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        untrack(self.map, self.call_id);
    }
}

#[async_trait]
impl Transport for PersistentTransport {
    async fn call(
        &self,
        call_id: &ToolCallId,
        payload: Value,
        profile: &RequestProfile,
    ) -> Result<Value> {
        let rpc_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": rpc_id,
            "method": "tools/call",
            "params": payload,
        });
        let _registered = InFlight::register(&self.in_flight, call_id, rpc_id);
        let response = self.post(&body, profile).await?;
        // Servers answer 404 once they have dropped the session.
        if response.status() == StatusCode::NOT_FOUND && self.session_id.is_some() {
            return Err(Error::session_expired("tool server no longer knows the session"));
        }
        let response = check_status(response).await?;
        rpc_result(read_rpc_response(response, rpc_id).await?)
    }

    async fn cancel(&self, call_id: &ToolCallId) {
        let Some(rpc_id) = self.untrack(call_id) else {
            return;
        };
        let notice = json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": {"requestId": rpc_id, "reason": "client cancelled"},
        });
        if let Err(e) = self.post(&notice, &self.profile).await {
            debug!(endpoint = %self.endpoint.key, error = %e, "cancel notification failed");
        }
    }

    async fn close(&self) {
        if self.session_id.is_none() {
            return;
        }
        let outcome = match self.request(Method::DELETE, None, &self.profile) {
            Ok(request) => self.sender.send(&self.profile.auth, request).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            debug!(endpoint = %self.endpoint.key, error = %e, "session close failed");
        }
    }
}

/// Pull the JSON-RPC response with `id` out of a JSON or SSE body.
async fn read_rpc_response(response: Response, id: u64) -> Result<Value> {
    let is_stream = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(EVENT_STREAM));
    if !is_stream {
        return Ok(response.json().await?);
    }

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        for message in decoder.feed(&chunk?) {
            if let Some(found) = matching_response(&message.data, id) {
                return Ok(found);
            }
        }
    }
    if let Some(found) = decoder.finish().and_then(|m| matching_response(&m.data, id)) {
        return Ok(found);
    }
    Err(Error::unreachable("event stream ended without a response"))
}

fn matching_response(data: &str, id: u64) -> Option<Value> {
    let value: Value = serde_json::from_str(data).ok()?;
    let is_response = value.get("result").is_some() || value.get("error").is_some();
    (is_response && value.get("id").and_then(Value::as_u64) == Some(id)).then_some(value)
}

fn rpc_result(message: Value) -> Result<Value> {
    if let Some(error) = message.get("error") {
        let text = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("tool server returned an error");
        return Err(Error::remote(text.to_string()));
    }
    message
        .get("result")
        .cloned()
        .ok_or_else(|| Error::remote("response carried neither result nor error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::endpoint::{EndpointClassifier, RemoteTarget, TransportKind};
    use crate::signing::{NoCredentials, RequestSigner};
    use crate::types::SigningConfig;
    use std::time::Duration;

    /// Session bound to a server that accepts connections and never answers.
    async fn stalled_session() -> PersistentTransport {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let target = RemoteTarget::new(url.clone(), TransportKind::Persistent);
        let endpoint = EndpointClassifier::new(&SigningConfig::default())
            .unwrap()
            .resolve(&url, &target)
            .unwrap();
        let signer = Arc::new(RequestSigner::new(Arc::new(NoCredentials), Duration::from_secs(300)));
        let profile = endpoint.profile();
        PersistentTransport {
            sender: Arc::new(HttpSender::new(reqwest::Client::new(), signer)),
            endpoint,
            profile,
            session_id: Some(HeaderValue::from_static("stalled")),
            protocol_version: PROTOCOL_VERSION.to_string(),
            next_id: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn abandoned_calls_leave_no_registration() {
        let transport = stalled_session().await;
        let profile = transport.profile.clone();
        let call_id = ToolCallId::new();
        let call = transport.call(&call_id, json!({"name": "slow"}), &profile);
        assert!(tokio::time::timeout(Duration::from_millis(100), call).await.is_err());
        assert_eq!(transport.in_flight(), 0);
        assert!(transport.untrack(&call_id).is_none());
    }

    #[test]
    fn matching_response_checks_id_and_shape() {
        assert!(matching_response(r#"{"jsonrpc":"2.0","id":3,"result":{}}"#, 3).is_some());
        assert!(matching_response(r#"{"jsonrpc":"2.0","id":4,"result":{}}"#, 3).is_none());
        assert!(matching_response(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#, 3)
            .is_none());
        assert!(matching_response("not json", 3).is_none());
    }

    #[test]
    fn rpc_errors_become_remote_errors() {
        let err = rpc_result(json!({"id": 1, "error": {"code": -32602, "message": "bad args"}}))
            .unwrap_err();
        assert_eq!(err.code(), "remote");
        assert_eq!(
            rpc_result(json!({"id": 1, "result": {"content": []}})).unwrap(),
            json!({"content": []})
        );
    }
}
