//! Short-lived signing credentials and their providers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

use crate::types::{Error, Result};

/// Access key pair plus optional session token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expires_at: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// True once `now + margin` reaches the expiry.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at.is_some_and(|at| now + margin >= at)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of signing credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    async fn credentials(&self) -> Result<Credentials>;
}

/// Reads `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialProvider;

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn credentials(&self) -> Result<Credentials> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::auth_unavailable("AWS_ACCESS_KEY_ID is not set"))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| Error::auth_unavailable("AWS_SECRET_ACCESS_KEY is not set"))?;
        let mut creds = Credentials::new(access_key_id, secret_access_key);
        if let Ok(token) = std::env::var("AWS_SESSION_TOKEN") {
            creds = creds.with_session_token(token);
        }
        Ok(creds)
    }
}

/// Fixed credentials, for embedders that fetch them elsewhere.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    creds: Credentials,
}

impl StaticCredentialProvider {
    pub fn new(creds: Credentials) -> Self {
        Self { creds }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credentials(&self) -> Result<Credentials> {
        Ok(self.creds.clone())
    }
}

/// Provider used when no signing infrastructure is configured.
#[derive(Debug, Clone, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn credentials(&self) -> Result<Credentials> {
        Err(Error::auth_unavailable("no credential provider configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let creds = Credentials::new("AKID", "super-secret").with_session_token("tok");
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("AKID"));
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("tok\""));
    }

    #[test]
    fn expiry_margin() {
        let now = Utc::now();
        let creds = Credentials::new("a", "b").with_expiry(now + chrono::Duration::seconds(30));
        assert!(creds.expires_within(now, chrono::Duration::seconds(60)));
        assert!(!creds.expires_within(now, chrono::Duration::seconds(10)));
        assert!(!Credentials::new("a", "b").expires_within(now, chrono::Duration::days(365)));
    }
}
