//! Provider adapters
//!
//! One adapter per upstream family. An adapter is a request transformer,
//! an HTTP executor with its own connection pool, and a response
//! transformer back to the normalized types; the dialect layer turns the
//! normalized result into whatever shape the caller asked in.

pub mod anthropic;
pub mod gemini;
pub mod generic;
pub mod mock;
pub mod openai;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::streaming::ChunkStream;
use crate::types::{
    ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, ImageRequest, ImageResponse,
    ModelInfo, TranscriptionRequest, TranscriptionResponse,
};

pub use registry::ProviderRegistry;

/// Upstream wire family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenAi,
    Anthropic,
    Gemini,
    Generic,
    Mock,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::OpenAi => "openai",
            ProviderType::Anthropic => "anthropic",
            ProviderType::Gemini => "gemini",
            ProviderType::Generic => "generic",
            ProviderType::Mock => "mock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderType::OpenAi),
            "anthropic" => Some(ProviderType::Anthropic),
            "gemini" => Some(ProviderType::Gemini),
            "generic" => Some(ProviderType::Generic),
            "mock" => Some(ProviderType::Mock),
            _ => None,
        }
    }
}

/// Provider health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub last_checked: DateTime<Utc>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ProviderHealth {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            last_checked: Utc::now(),
            error_message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            last_checked: Utc::now(),
            error_message: Some(message.into()),
        }
    }
}

/// Capability contract every adapter implements. Operations an upstream
/// cannot perform keep the default `unsupported_capability` body.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Instance name the router selects by (e.g. "openai", "openai-eu").
    fn name(&self) -> &str;

    fn provider_type(&self) -> ProviderType;

    async fn complete(&self, request: &ChatRequest, timeout: Duration)
        -> GatewayResult<ChatResponse>;

    async fn stream(&self, request: &ChatRequest, timeout: Duration) -> GatewayResult<ChunkStream>;

    async fn embed(
        &self,
        _request: &EmbeddingsRequest,
        _timeout: Duration,
    ) -> GatewayResult<EmbeddingsResponse> {
        Err(GatewayError::unsupported("embeddings"))
    }

    async fn list_models(&self) -> GatewayResult<Vec<ModelInfo>>;

    async fn transcribe(
        &self,
        _request: &TranscriptionRequest,
        _timeout: Duration,
    ) -> GatewayResult<TranscriptionResponse> {
        Err(GatewayError::unsupported("audio transcription"))
    }

    async fn generate_image(
        &self,
        _request: &ImageRequest,
        _timeout: Duration,
    ) -> GatewayResult<ImageResponse> {
        Err(GatewayError::unsupported("image generation"))
    }

    async fn health_check(&self) -> ProviderHealth;
}

/// Shared HTTP client factory; each adapter owns one client and therefore
/// its own connection pool.
pub(crate) fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("default reqwest client construction cannot fail")
}

/// Parse a `retry-after` header value (seconds form only; HTTP dates are
/// not worth the dependency here).
pub(crate) fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Map a non-success upstream response to the gateway taxonomy.
///
/// The returned error carries the upstream body detail but never the
/// upstream URL or any credential material.
pub(crate) async fn error_from_response(
    provider: &str,
    response: reqwest::Response,
) -> GatewayError {
    let status = response.status();
    let retry_after = parse_retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    let detail = truncate_detail(&body);

    match status.as_u16() {
        // The fixed message keeps whatever the upstream echoed about the
        // credential out of the envelope.
        401 | 403 => GatewayError::CredentialsInvalidUpstream(format!(
            "{} rejected the gateway's upstream credentials",
            provider
        )),
        404 => GatewayError::ModelNotFoundUpstream(format!("{}: {}", provider, detail)),
        429 => GatewayError::RateLimited { retry_after },
        408 | 504 => GatewayError::Timeout(format!("{} upstream timeout: {}", provider, detail)),
        s if s >= 500 => {
            GatewayError::UpstreamError(format!("{} returned {}: {}", provider, status, detail))
        }
        // Remaining 4xx: the transformed request was rejected; retrying a
        // sibling candidate with the same payload will not help.
        _ => GatewayError::UpstreamProtocolError(format!(
            "{} returned unexpected status {}: {}",
            provider, status, detail
        )),
    }
}

fn truncate_detail(body: &str) -> String {
    const MAX: usize = 300;
    let trimmed = body.trim();
    if trimmed.len() <= MAX {
        trimmed.to_string()
    } else {
        let mut cut = MAX;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &trimmed[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    async fn response_with(status: u16, body: &str) -> reqwest::Response {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&server)
            .await;
        reqwest::get(server.uri()).await.unwrap()
    }

    #[tokio::test]
    async fn test_error_mapping_auth() {
        let err = error_from_response("openai", response_with(401, "bad key").await).await;
        assert_eq!(err.kind(), "credentials_invalid_upstream");
        assert!(!err.is_retriable());
        // The body detail must not surface credential material the
        // adapter sent; the message is fixed.
        assert!(!err.to_string().contains("bad key"));

        let err = error_from_response("openai", response_with(403, "forbidden key").await).await;
        assert_eq!(err.kind(), "credentials_invalid_upstream");
        assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_error_mapping_not_found() {
        let err = error_from_response("openai", response_with(404, "no model").await).await;
        assert_eq!(err.kind(), "model_not_found_upstream");
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_error_mapping_rate_limit_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;
        let response = reqwest::get(server.uri()).await.unwrap();
        let err = error_from_response("openai", response).await;
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_error_mapping_server_errors_retriable() {
        let err = error_from_response("openai", response_with(503, "overloaded").await).await;
        assert_eq!(err.kind(), "upstream_error");
        assert!(err.is_retriable());

        let err = error_from_response("openai", response_with(504, "slow").await).await;
        assert_eq!(err.kind(), "timeout");
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_error_mapping_other_4xx_not_retriable() {
        let err = error_from_response("openai", response_with(422, "bad field").await).await;
        assert!(!err.is_retriable());
        assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_truncate_detail() {
        let long = "x".repeat(1000);
        let detail = truncate_detail(&long);
        assert!(detail.len() <= 304);
        assert!(detail.ends_with("..."));
    }
}
