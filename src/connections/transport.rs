//! Transport seams and the signing HTTP sender shared by both transports.

use async_trait::async_trait;
use reqwest::header::CONNECTION;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::endpoint::{AuthRequirement, RequestProfile, ResolvedEndpoint};
use crate::signing::{OutboundRequest, RequestSigner};
use crate::types::{Error, Result, ToolCallId};

/// A live channel to one tool server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Execute one tool call. `payload` is `{"name": .., "arguments": ..}`;
    /// `profile` carries the calling descriptor's headers and auth mode.
    async fn call(
        &self,
        call_id: &ToolCallId,
        payload: Value,
        profile: &RequestProfile,
    ) -> Result<Value>;

    /// Best-effort notice that an in-flight call was abandoned.
    async fn cancel(&self, _call_id: &ToolCallId) {}

    /// Release server-side state. Errors are swallowed.
    async fn close(&self) {}
}

/// Establishes transports for resolved endpoints.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    async fn connect(&self, endpoint: &ResolvedEndpoint) -> Result<Arc<dyn Transport>>;
}

/// reqwest client plus signer. Applies the endpoint's auth requirement to
/// every request and retries once with fresh credentials on 401/403.
#[derive(Debug)]
pub struct HttpSender {
    client: reqwest::Client,
    signer: Arc<RequestSigner>,
}

impl HttpSender {
    pub fn new(client: reqwest::Client, signer: Arc<RequestSigner>) -> Self {
        Self { client, signer }
    }

    pub fn with_timeouts(
        connect_timeout: Duration,
        request_timeout: Duration,
        signer: Arc<RequestSigner>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self::new(client, signer))
    }

    /// Send `request`. Protected endpoints are never contacted unsigned.
    ///
    /// Returns the raw response for any status other than 401/403; callers
    /// decide what the remaining statuses mean via [`check_status`].
    pub async fn send(&self, auth: &AuthRequirement, request: OutboundRequest) -> Result<Response> {
        let mut request = request;
        request.headers.remove(CONNECTION);

        let signed = self.prepare(auth, &mut request).await?;
        let response = self.execute(request.clone()).await?;
        if !signed || !is_auth_rejection(response.status()) {
            return Ok(response);
        }

        debug!(url = %request.url, status = %response.status(), "signature rejected, re-signing");
        self.signer.invalidate().await;
        self.prepare(auth, &mut request).await?;
        let response = self.execute(request).await?;
        if is_auth_rejection(response.status()) {
            return Err(Error::unauthenticated(format!(
                "endpoint rejected credentials ({})",
                response.status()
            )));
        }
        Ok(response)
    }

    /// Returns whether the request ended up signed.
    async fn prepare(&self, auth: &AuthRequirement, request: &mut OutboundRequest) -> Result<bool> {
        match auth {
            AuthRequirement::Required(scope) => {
                self.signer.sign(request, scope).await?;
                Ok(true)
            }
            AuthRequirement::Preferred(scope) => match self.signer.sign(request, scope).await {
                Ok(_) => Ok(true),
                Err(e) => {
                    warn!(url = %request.url, error = %e, "signing unavailable, sending unsigned");
                    Ok(false)
                }
            },
            AuthRequirement::None => Ok(false),
        }
    }

    async fn execute(&self, request: OutboundRequest) -> Result<Response> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;
        Ok(response)
    }
}

fn is_auth_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Map a non-success status to the error taxonomy.
pub async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail: String = body.chars().take(200).collect();
    Err(match status {
        s if is_auth_rejection(s) => Error::unauthenticated(format!("{}: {}", s, detail)),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            Error::timeout(format!("{}: {}", status, detail))
        }
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            Error::unreachable(format!("{}: {}", s, detail))
        }
        s => Error::remote(format!("{}: {}", s, detail)),
    })
}

