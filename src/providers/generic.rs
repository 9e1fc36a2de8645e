//! Generic OpenAI-compatible adapter
//!
//! Most self-hosted and aggregator upstreams speak the chat-completions
//! dialect; this adapter points the OpenAI wire logic at an arbitrary
//! base URL and reports its own provider type.

use std::time::Duration;

use async_trait::async_trait;

use super::openai::OpenAiAdapter;
use super::{ProviderAdapter, ProviderHealth, ProviderType};
use crate::error::GatewayResult;
use crate::streaming::ChunkStream;
use crate::types::{
    ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, ImageRequest, ImageResponse,
    ModelInfo, TranscriptionRequest, TranscriptionResponse,
};

pub struct GenericAdapter {
    inner: OpenAiAdapter,
}

impl GenericAdapter {
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            inner: OpenAiAdapter::with_base_url(name, api_key, base_url),
        }
    }
}

#[async_trait]
impl ProviderAdapter for GenericAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Generic
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> GatewayResult<ChatResponse> {
        self.inner.complete(request, timeout).await
    }

    async fn stream(&self, request: &ChatRequest, timeout: Duration) -> GatewayResult<ChunkStream> {
        self.inner.stream(request, timeout).await
    }

    async fn embed(
        &self,
        request: &EmbeddingsRequest,
        timeout: Duration,
    ) -> GatewayResult<EmbeddingsResponse> {
        self.inner.embed(request, timeout).await
    }

    async fn list_models(&self) -> GatewayResult<Vec<ModelInfo>> {
        self.inner.list_models().await
    }

    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
        timeout: Duration,
    ) -> GatewayResult<TranscriptionResponse> {
        self.inner.transcribe(request, timeout).await
    }

    async fn generate_image(
        &self,
        request: &ImageRequest,
        timeout: Duration,
    ) -> GatewayResult<ImageResponse> {
        self.inner.generate_image(request, timeout).await
    }

    async fn health_check(&self) -> ProviderHealth {
        self.inner.health_check().await
    }
}
