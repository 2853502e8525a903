//! Application error types.
//!
//! All errors use `thiserror` and carry a stable machine code (see
//! [`Error::code`]) that is safe to hand to clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error enum for the orchestration core.
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown tool, session or agent profile.
    #[error("not found: {0}")]
    NotFound(String),

    /// Tool is turned off for the session.
    #[error("tool disabled: {0}")]
    Disabled(String),

    /// Local handler, agent profile or endpoint reference could not be located.
    #[error("unresolvable binding: {0}")]
    UnresolvableBinding(String),

    /// Signing infrastructure (credentials) unavailable for a protected endpoint.
    #[error("authentication unavailable: {0}")]
    AuthUnavailable(String),

    /// Remote rejected the request signature or credentials.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Remote endpoint down, refusing connections, or cooling down after eviction.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Persistent tool server dropped our session; reconnect without cooldown.
    #[error("remote session expired: {0}")]
    SessionExpired(String),

    /// Cooperative abort.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// Malformed input or invalid tool arguments.
    #[error("validation error: {0}")]
    Validation(String),

    /// A run is already active for the session.
    #[error("busy: {0}")]
    Busy(String),

    /// Tool server answered with an application-level error.
    #[error("remote error: {0}")]
    Remote(String),

    /// A run used up its model turns without a final answer.
    #[error("iteration limit reached: {0}")]
    IterationLimit(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client errors (boxed to reduce Result size).
    #[error("http error: {0}")]
    Http(#[from] Box<reqwest::Error>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable snake_case code used in `error` events and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Disabled(_) => "disabled",
            Error::UnresolvableBinding(_) => "unresolvable_binding",
            Error::AuthUnavailable(_) => "auth_unavailable",
            Error::Unauthenticated(_) => "unauthenticated",
            Error::Unreachable(_) | Error::SessionExpired(_) => "unreachable",
            Error::Cancelled(_) => "cancelled",
            Error::Timeout(_) => "timeout",
            Error::Validation(_) => "validation",
            Error::Busy(_) => "busy",
            Error::Remote(_) => "remote",
            Error::IterationLimit(_) => "max_iterations",
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => "internal",
            Error::Http(_) => "unreachable",
        }
    }

    /// Transient remote failures: evict and retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Unreachable(_) | Error::SessionExpired(_) | Error::Timeout(_) | Error::Http(_)
        )
    }

    /// Message safe to show to clients. Internal failures are collapsed so
    /// that paths and library details never leave the process.
    pub fn public_message(&self) -> String {
        match self {
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => {
                "internal error".to_string()
            }
            Error::Http(_) => "remote endpoint unreachable".to_string(),
            other => other.to_string(),
        }
    }

    /// HTTP status for the client-facing API.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Disabled(_) => StatusCode::FORBIDDEN,
            Error::UnresolvableBinding(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::AuthUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::Unreachable(_)
            | Error::SessionExpired(_)
            | Error::Http(_)
            | Error::Remote(_) => StatusCode::BAD_GATEWAY,
            Error::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Busy(_) => StatusCode::CONFLICT,
            Error::IterationLimit(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

// Convenience constructors
impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn disabled(msg: impl Into<String>) -> Self {
        Self::Disabled(msg.into())
    }

    pub fn unresolvable(msg: impl Into<String>) -> Self {
        Self::UnresolvableBinding(msg.into())
    }

    pub fn auth_unavailable(msg: impl Into<String>) -> Self {
        Self::AuthUnavailable(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn session_expired(msg: impl Into<String>) -> Self {
        Self::SessionExpired(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn iteration_limit(msg: impl Into<String>) -> Self {
        Self::IterationLimit(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// The request url is stripped: resolved endpoints can be secrets.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            Error::timeout(err.to_string())
        } else if err.is_connect() {
            Error::unreachable(err.to_string())
        } else {
            Error::Http(Box::new(err))
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        });
        (self.status_code(), axum::Json(body)).into_response()
    }
}
