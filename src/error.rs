//! Error types and conversions
//!
//! One taxonomy for the whole gateway. Every variant maps to an HTTP status
//! and a stable machine-readable kind; the dialect layer turns the pair into
//! the envelope shape the caller expects.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("credentials revoked")]
    CredentialsRevoked,

    #[error("credentials expired")]
    CredentialsExpired,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("no route for model '{0}'")]
    NoRoute(String),

    #[error("model not found upstream: {0}")]
    ModelNotFoundUpstream(String),

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream rejected gateway credentials: {0}")]
    CredentialsInvalidUpstream(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable error kind, used in error envelopes and traces.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::InvalidCredentials => "invalid_credentials",
            GatewayError::CredentialsRevoked => "credentials_revoked",
            GatewayError::CredentialsExpired => "credentials_expired",
            GatewayError::InvalidToken(_) => "invalid_token",
            GatewayError::TokenExpired => "token_expired",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::NoRoute(_) => "no_route",
            GatewayError::ModelNotFoundUpstream(_) => "model_not_found_upstream",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::CredentialsInvalidUpstream(_) => "credentials_invalid_upstream",
            GatewayError::UpstreamError(_) => "upstream_error",
            GatewayError::UpstreamProtocolError(_) => "upstream_protocol_error",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::UnsupportedCapability(_) => "unsupported_capability",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Storage(_) | GatewayError::Cache(_) | GatewayError::Internal(_) => {
                "internal_error"
            }
        }
    }

    /// HTTP status the error surfaces with.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::InvalidCredentials
            | GatewayError::CredentialsRevoked
            | GatewayError::CredentialsExpired
            | GatewayError::InvalidToken(_)
            | GatewayError::TokenExpired => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NoRoute(_) | GatewayError::ModelNotFoundUpstream(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CredentialsInvalidUpstream(_)
            | GatewayError::UpstreamError(_)
            | GatewayError::UpstreamProtocolError(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UnsupportedCapability(_) => StatusCode::NOT_IMPLEMENTED,
            GatewayError::Cancelled
            | GatewayError::Storage(_)
            | GatewayError::Cache(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the router may try another candidate after this failure.
    ///
    /// Retriable: network errors, upstream 5xx, 429, timeouts. Protocol
    /// errors are not retriable; the response body already arrived broken
    /// and a sibling candidate will not fix the caller's request.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. }
                | GatewayError::UpstreamError(_)
                | GatewayError::Timeout(_)
        )
    }

    /// Upstream-requested delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn unsupported(capability: &str) -> Self {
        GatewayError::UnsupportedCapability(capability.to_string())
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(err: rusqlite::Error) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(format!("serialization error: {}", err))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else {
            // Connection-level failures; retriable like any network error.
            GatewayError::UpstreamError(err.to_string())
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::InvalidCredentials.status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::NoRoute("gpt-4".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::RateLimited { retry_after: None }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::UpstreamProtocolError("bad json".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::CredentialsInvalidUpstream("openai".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Timeout("deadline".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::unsupported("embeddings").status(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_retriability() {
        assert!(GatewayError::UpstreamError("503".into()).is_retriable());
        assert!(GatewayError::Timeout("t".into()).is_retriable());
        assert!(GatewayError::RateLimited { retry_after: None }.is_retriable());
        assert!(!GatewayError::UpstreamProtocolError("x".into()).is_retriable());
        assert!(!GatewayError::CredentialsInvalidUpstream("x".into()).is_retriable());
        assert!(!GatewayError::InvalidRequest("x".into()).is_retriable());
        assert!(!GatewayError::Cancelled.is_retriable());
        assert!(!GatewayError::ModelNotFoundUpstream("m".into()).is_retriable());
    }

    #[test]
    fn test_retry_after_passthrough() {
        let err = GatewayError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(GatewayError::Timeout("t".into()).retry_after(), None);
    }

    #[test]
    fn test_internal_kinds_collapse() {
        assert_eq!(GatewayError::Storage("db".into()).kind(), "internal_error");
        assert_eq!(GatewayError::Cache("redis".into()).kind(), "internal_error");
    }
}
