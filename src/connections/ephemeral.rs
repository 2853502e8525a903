//! Request/response transport: one JSON POST per call.
//!
//! Reuse happens below this layer through the shared client's keep-alive.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;

use super::endpoint::{RequestProfile, ResolvedEndpoint};
use super::transport::{check_status, HttpSender, Transport};
use crate::signing::OutboundRequest;
use crate::types::{Result, ToolCallId};

#[derive(Debug)]
pub struct EphemeralTransport {
    sender: Arc<HttpSender>,
    endpoint: ResolvedEndpoint,
}

impl EphemeralTransport {
    pub fn new(sender: Arc<HttpSender>, endpoint: ResolvedEndpoint) -> Self {
        Self { sender, endpoint }
    }
}

#[async_trait]
impl Transport for EphemeralTransport {
    async fn call(
        &self,
        call_id: &ToolCallId,
        payload: Value,
        profile: &RequestProfile,
    ) -> Result<Value> {
        let mut request = OutboundRequest::json(Method::POST, self.endpoint.url.clone(), &payload)?;
        request.headers.extend(profile.headers.clone());
        tracing::trace!(endpoint = %self.endpoint.key, call_id = %call_id, "ephemeral call");

        let response = self.sender.send(&profile.auth, request).await?;
        let body = check_status(response).await?.bytes().await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }
}
