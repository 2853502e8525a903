//! Request signing for protected tool-server endpoints.
//!
//! The signer turns an [`OutboundRequest`] plus a [`CredentialScope`] into a
//! signed request (SigV4). Credentials are cached and refreshed when they get
//! close to expiry or after the remote rejects a signature.

pub mod credentials;
pub mod sigv4;

pub use credentials::{
    CredentialProvider, Credentials, EnvCredentialProvider, NoCredentials,
    StaticCredentialProvider,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONNECTION};
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

use crate::types::{Error, Result};

/// Refresh cached credentials this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 60;

/// An HTTP request before it hits the wire.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn json(method: Method, url: Url, body: &serde_json::Value) -> Result<Self> {
        let mut req = Self::new(method, url);
        req.body = Bytes::from(serde_json::to_vec(body)?);
        req.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(req)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Region and service the signature is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialScope {
    pub region: String,
    pub service: String,
}

impl CredentialScope {
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }
}

/// Validity window of a produced signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureWindow {
    pub signed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SignatureWindow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// SigV4 request signer with a credential cache.
#[derive(Debug)]
pub struct RequestSigner {
    provider: Arc<dyn CredentialProvider>,
    cached: Mutex<Option<Credentials>>,
    ttl: Duration,
}

impl RequestSigner {
    pub fn new(provider: Arc<dyn CredentialProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
            ttl,
        }
    }

    /// Sign `request` in place with current credentials.
    ///
    /// Fails with `AuthUnavailable` when no credentials can be obtained.
    pub async fn sign(
        &self,
        request: &mut OutboundRequest,
        scope: &CredentialScope,
    ) -> Result<SignatureWindow> {
        let creds = self.current_credentials().await?;
        self.sign_at(request, scope, &creds, Utc::now())
    }

    /// Drop cached credentials so the next `sign` fetches fresh ones.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn current_credentials(&self) -> Result<Credentials> {
        let mut cached = self.cached.lock().await;
        let margin = chrono::Duration::seconds(REFRESH_MARGIN_SECS);
        if let Some(creds) = cached.as_ref() {
            if !creds.expires_within(Utc::now(), margin) {
                return Ok(creds.clone());
            }
        }
        let fresh = self.provider.credentials().await.map_err(|e| match e {
            Error::AuthUnavailable(_) => e,
            other => Error::auth_unavailable(other.to_string()),
        })?;
        if fresh.expires_within(Utc::now(), chrono::Duration::zero()) {
            return Err(Error::unauthenticated("credential provider returned expired credentials"));
        }
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    /// Deterministic signing at a fixed instant.
    pub fn sign_at(
        &self,
        request: &mut OutboundRequest,
        scope: &CredentialScope,
        creds: &Credentials,
        now: DateTime<Utc>,
    ) -> Result<SignatureWindow> {
        // Proxies rewrite `connection`; it must never be part of the signature.
        request.headers.remove(CONNECTION);
        request.headers.remove(AUTHORIZATION);

        let amz_date = now.format(sigv4::AMZ_DATE_FORMAT).to_string();
        let payload_hash = sigv4::sha256_hex(&request.body);
        insert(&mut request.headers, "x-amz-date", &amz_date)?;
        insert(&mut request.headers, "x-amz-content-sha256", &payload_hash)?;
        if let Some(token) = &creds.session_token {
            insert(&mut request.headers, "x-amz-security-token", token)?;
        }

        let canonical = sigv4::canonical_headers(&request.url, &request.headers)?;
        let (canonical_request, signed_headers) = sigv4::canonical_request(
            request.method.as_str(),
            &request.url,
            &canonical,
            &payload_hash,
        );
        let credential_scope = sigv4::credential_scope(now, &scope.region, &scope.service);
        let string_to_sign = sigv4::string_to_sign(now, &credential_scope, &canonical_request);
        let key = sigv4::derive_signing_key(
            &creds.secret_access_key,
            &now.format(sigv4::SCOPE_DATE_FORMAT).to_string(),
            &scope.region,
            &scope.service,
        )?;
        let signature = sigv4::signature(&key, &string_to_sign)?;

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            sigv4::ALGORITHM,
            creds.access_key_id,
            credential_scope,
            signed_headers,
            signature
        );
        let value = HeaderValue::from_str(&authorization)
            .map_err(|e| Error::internal(format!("authorization header: {}", e)))?;
        request.headers.insert(AUTHORIZATION, value);

        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| Error::internal(format!("signature ttl: {}", e)))?;
        Ok(SignatureWindow {
            signed_at: now,
            expires_at: now + ttl,
        })
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| Error::validation(format!("invalid value for header {}", name)))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}
