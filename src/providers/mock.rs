//! Mock adapter
//!
//! Deterministic in-process adapter for tests and local smoke runs. It is
//! registered under the reserved name `mock` but never synthesized into
//! default routes; only an explicit route entry selects it.

use std::time::Duration;

use async_trait::async_trait;

use super::{ProviderAdapter, ProviderHealth, ProviderType};
use crate::error::GatewayResult;
use crate::streaming::ChunkStream;
use crate::types::{
    ChatRequest, ChatResponse, FinishReason, ModelInfo, Role, StreamChunk, TokenUsage,
};

pub const MOCK_PROVIDER_NAME: &str = "mock";

pub struct MockAdapter {
    reply: String,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            reply: "mock response".to_string(),
        }
    }

    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        MOCK_PROVIDER_NAME
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Mock
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        _timeout: Duration,
    ) -> GatewayResult<ChatResponse> {
        let prompt_tokens = request.estimate_prompt_tokens();
        let completion_tokens = (self.reply.len() / 4).max(1) as u32;
        Ok(ChatResponse {
            id: format!("mock-{}", uuid::Uuid::new_v4()),
            model: request.model.clone(),
            content: self.reply.clone(),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Stop,
            usage: TokenUsage::new(prompt_tokens, completion_tokens),
        })
    }

    async fn stream(&self, request: &ChatRequest, _timeout: Duration) -> GatewayResult<ChunkStream> {
        let prompt_tokens = request.estimate_prompt_tokens();
        let words: Vec<String> = self.reply.split(' ').map(|w| format!("{} ", w)).collect();
        let total = words.len() as u32;
        let mut chunks: Vec<GatewayResult<StreamChunk>> = words
            .into_iter()
            .enumerate()
            .map(|(i, word)| {
                Ok(StreamChunk {
                    index: i as u32,
                    role: if i == 0 { Some(Role::Assistant) } else { None },
                    text_delta: word,
                    tool_call_delta: None,
                    finish_reason: None,
                    usage: None,
                })
            })
            .collect();
        chunks.push(Ok(StreamChunk::terminal(
            total,
            FinishReason::Stop,
            Some(TokenUsage::new(prompt_tokens, total)),
        )));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn list_models(&self) -> GatewayResult<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            id: "mock-model".into(),
            provider: MOCK_PROVIDER_NAME.into(),
            created: None,
        }])
    }

    async fn health_check(&self) -> ProviderHealth {
        ProviderHealth::healthy(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use futures::StreamExt;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "mock-model".into(),
            system: None,
            messages: vec![Message::text(Role::User, "hi")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: Vec::new(),
            stream: false,
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_complete() {
        let adapter = MockAdapter::with_reply("hello there");
        let response = adapter
            .complete(&request(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.content, "hello there");
        assert_eq!(
            response.usage.total_tokens,
            response.usage.prompt_tokens + response.usage.completion_tokens
        );
    }

    #[tokio::test]
    async fn test_mock_stream_terminates() {
        let adapter = MockAdapter::with_reply("a b c");
        let chunks: Vec<StreamChunk> = adapter
            .stream(&request(), Duration::from_secs(1))
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 4);
        assert!(chunks.last().unwrap().is_terminal());
    }
}
