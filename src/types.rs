//! Normalized internal request/response types
//!
//! Every dialect endpoint parses into these shapes and every provider
//! adapter consumes and produces them. Upstream JSON structures are never
//! used as the internal representation; the per-dialect codecs own the
//! wire shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire dialect a request or response is shaped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    OpenAi,
    Anthropic,
    Gemini,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::Anthropic => "anthropic",
            Dialect::Gemini => "gemini",
        }
    }
}

/// Message role at the normalized layer.
///
/// Adapters translate to each upstream's naming (OpenAI keeps all four,
/// Anthropic drops `system` into a top-level field, Gemini maps
/// `assistant` to `model` and folds tool exchanges into parts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" | "model" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// One conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool calls issued by the assistant (assistant role only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Id of the tool call this message answers (tool role only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Tool name (tool role only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }
}

/// Tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the tool parameters.
    pub parameters: Value,
}

/// A completed tool call in an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string, as produced by the model.
    pub arguments: String,
}

/// Normalized chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model name as the caller sent it; routing maps this to an upstream model.
    pub model: String,
    /// System prompt, already lifted out of the message list.
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
    pub stream: bool,
    pub tools: Vec<ToolDefinition>,
}

impl ChatRequest {
    /// Validate the fields every dialect requires.
    pub fn validate(&self) -> crate::error::GatewayResult<()> {
        use crate::error::GatewayError;

        if self.model.is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".into()));
        }
        if self.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages cannot be empty".into(),
            ));
        }
        if let Some(temp) = self.temperature {
            if !(0.0..=2.0).contains(&temp) {
                return Err(GatewayError::InvalidRequest(
                    "temperature must be between 0 and 2".into(),
                ));
            }
        }
        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(GatewayError::InvalidRequest(
                    "top_p must be between 0 and 1".into(),
                ));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(GatewayError::InvalidRequest(
                "max_tokens must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Rough prompt size estimate (~4 chars per token) used when an
    /// upstream stream ends without reporting usage.
    pub fn estimate_prompt_tokens(&self) -> u32 {
        let mut chars = self.system.as_deref().map(str::len).unwrap_or(0);
        chars += self.messages.iter().map(|m| m.content.len()).sum::<usize>();
        ((chars / 4).max(1)) as u32
    }
}

/// Token usage reported by an upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Normalized chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Upstream response id when it supplied one, else a generated one.
    pub id: String,
    /// Model name that actually served the request.
    pub model: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
}

/// Normalized finish reason, in OpenAI naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "error",
        }
    }
}

/// One element of a streamed response at the normalized layer.
///
/// Chunks are produced by adapter stream readers, travel through the
/// bounded pump and are re-encoded into the caller's dialect. The last
/// chunk of a well-formed stream carries `finish_reason` (and usage when
/// the upstream reported it); nothing is emitted after it.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub index: u32,
    /// Only present on the first chunk of a message.
    pub role: Option<Role>,
    pub text_delta: String,
    pub tool_call_delta: Option<ToolCallDelta>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    pub fn text(index: u32, delta: impl Into<String>) -> Self {
        Self {
            index,
            text_delta: delta.into(),
            ..Default::default()
        }
    }

    pub fn terminal(index: u32, finish_reason: FinishReason, usage: Option<TokenUsage>) -> Self {
        Self {
            index,
            finish_reason: Some(finish_reason),
            usage,
            ..Default::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Incremental tool-call fragment within a streamed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arguments_delta: String,
}

/// Normalized embeddings request.
#[derive(Debug, Clone)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: Vec<String>,
}

/// Normalized embeddings response.
#[derive(Debug, Clone)]
pub struct EmbeddingsResponse {
    pub model: String,
    pub embeddings: Vec<Vec<f32>>,
    pub usage: TokenUsage,
}

/// Normalized image generation request.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub model: Option<String>,
    pub prompt: String,
    pub n: u32,
    pub size: Option<String>,
}

/// One generated image, either hosted or inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
}

/// Normalized image generation response.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub images: Vec<GeneratedImage>,
}

/// Normalized audio transcription request.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub model: String,
    pub file_name: String,
    pub audio: Vec<u8>,
    pub language: Option<String>,
}

/// Normalized audio transcription response.
#[derive(Debug, Clone)]
pub struct TranscriptionResponse {
    pub text: String,
}

/// Model listing entry, aggregated across adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}
