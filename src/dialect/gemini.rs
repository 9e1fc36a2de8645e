//! Gemini generateContent dialect
//!
//! Parses `/v1beta/models/{model}:generateContent` bodies and re-encodes
//! responses and stream frames in Gemini shape. Streaming framing follows
//! what the caller asked for: SSE frames with `?alt=sse`, otherwise the
//! incrementally streamed JSON array the bare endpoint returns.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{sse_frame, ChunkEncoder};
use crate::error::{GatewayError, GatewayResult};
use crate::types::{
    ChatRequest, ChatResponse, FinishReason, Message, Role, StreamChunk, ToolDefinition,
};

#[derive(Debug, Deserialize)]
pub struct WireGenerateRequest {
    #[serde(default)]
    pub contents: Vec<WireContent>,
    #[serde(rename = "systemInstruction", default)]
    pub system_instruction: Option<WireContent>,
    #[serde(rename = "generationConfig", default)]
    pub generation_config: Option<WireGenerationConfig>,
    #[serde(default)]
    pub tools: Vec<WireToolGroup>,
}

#[derive(Debug, Deserialize)]
pub struct WireContent {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
pub struct WirePart {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireGenerationConfig {
    pub temperature: Option<f32>,
    #[serde(rename = "topP")]
    pub top_p: Option<f32>,
    #[serde(rename = "maxOutputTokens")]
    pub max_output_tokens: Option<u32>,
    #[serde(rename = "stopSequences", default)]
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireToolGroup {
    #[serde(rename = "functionDeclarations", default)]
    pub function_declarations: Vec<WireFunctionDeclaration>,
}

#[derive(Debug, Deserialize)]
pub struct WireFunctionDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

/// Parse a Gemini-shaped body. The model comes from the URL, streaming
/// from the URL action, so both are parameters here.
pub fn parse_request(model: &str, stream: bool, body: Value) -> GatewayResult<ChatRequest> {
    let wire: WireGenerateRequest = serde_json::from_value(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("malformed request body: {}", e)))?;

    let mut messages = Vec::new();
    for content in wire.contents {
        let role = match content.role.as_deref() {
            Some("user") | None => Role::User,
            Some("model") => Role::Assistant,
            Some(other) => {
                return Err(GatewayError::InvalidRequest(format!(
                    "unknown role '{}'",
                    other
                )));
            }
        };
        let text: String = content
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        messages.push(Message::text(role, text));
    }

    let system = wire.system_instruction.map(|content| {
        content
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("\n")
    });

    let config = wire.generation_config;
    let request = ChatRequest {
        model: model.to_string(),
        system,
        messages,
        temperature: config.as_ref().and_then(|c| c.temperature),
        top_p: config.as_ref().and_then(|c| c.top_p),
        max_tokens: config.as_ref().and_then(|c| c.max_output_tokens),
        stop: config.map(|c| c.stop_sequences).unwrap_or_default(),
        stream,
        tools: wire
            .tools
            .into_iter()
            .flat_map(|group| group.function_declarations)
            .map(|decl| ToolDefinition {
                name: decl.name,
                description: decl.description,
                parameters: decl.parameters,
            })
            .collect(),
    };
    request.validate()?;
    Ok(request)
}

fn finish_reason(finish: FinishReason) -> &'static str {
    match finish {
        FinishReason::Length => "MAX_TOKENS",
        FinishReason::ContentFilter => "SAFETY",
        FinishReason::Error => "OTHER",
        _ => "STOP",
    }
}

fn candidate_frame(model: &str, chunk: &StreamChunk) -> Value {
    let mut candidate = json!({
        "content": {
            "role": "model",
            "parts": if chunk.text_delta.is_empty() {
                json!([])
            } else {
                json!([{"text": chunk.text_delta}])
            },
        },
        "index": 0,
    });
    if let Some(finish) = chunk.finish_reason {
        candidate["finishReason"] = json!(finish_reason(finish));
    }

    let mut frame = json!({
        "candidates": [candidate],
        "modelVersion": model,
    });
    if let Some(usage) = chunk.usage {
        frame["usageMetadata"] = json!({
            "promptTokenCount": usage.prompt_tokens,
            "candidatesTokenCount": usage.completion_tokens,
            "totalTokenCount": usage.total_tokens,
        });
    }
    frame
}

pub fn encode_response(response: &ChatResponse) -> Value {
    let mut parts = Vec::new();
    if !response.content.is_empty() || response.tool_calls.is_empty() {
        parts.push(json!({"text": response.content}));
    }
    for call in &response.tool_calls {
        let args: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));
        parts.push(json!({"functionCall": {"name": call.name, "args": args}}));
    }

    json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": finish_reason(response.finish_reason),
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": response.usage.prompt_tokens,
            "candidatesTokenCount": response.usage.completion_tokens,
            "totalTokenCount": response.usage.total_tokens,
        },
        "modelVersion": response.model,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeminiFraming {
    /// `?alt=sse`: one `data:` frame per chunk.
    Sse,
    /// Bare endpoint: an incrementally streamed JSON array.
    JsonArray,
}

pub struct GeminiChunkEncoder {
    model: String,
    framing: GeminiFraming,
    emitted_any: bool,
}

impl GeminiChunkEncoder {
    pub fn sse(model: &str) -> Self {
        Self {
            model: model.to_string(),
            framing: GeminiFraming::Sse,
            emitted_any: false,
        }
    }

    pub fn json_array(model: &str) -> Self {
        Self {
            model: model.to_string(),
            framing: GeminiFraming::JsonArray,
            emitted_any: false,
        }
    }
}

impl ChunkEncoder for GeminiChunkEncoder {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<String> {
        // Frames with neither text nor a terminal marker carry nothing a
        // Gemini client can use.
        if chunk.text_delta.is_empty() && chunk.finish_reason.is_none() {
            return Vec::new();
        }
        let frame = candidate_frame(&self.model, chunk);
        let encoded = match self.framing {
            GeminiFraming::Sse => sse_frame(&frame),
            GeminiFraming::JsonArray => {
                if self.emitted_any {
                    format!(",\n{}", frame)
                } else {
                    format!("[{}", frame)
                }
            }
        };
        self.emitted_any = true;
        vec![encoded]
    }

    fn finish(&mut self) -> Vec<String> {
        match self.framing {
            GeminiFraming::Sse => Vec::new(),
            GeminiFraming::JsonArray => {
                if self.emitted_any {
                    vec!["]".to_string()]
                } else {
                    vec!["[]".to_string()]
                }
            }
        }
    }

    fn content_type(&self) -> &'static str {
        match self.framing {
            GeminiFraming::Sse => "text/event-stream",
            GeminiFraming::JsonArray => "application/json",
        }
    }
}

fn google_status(err: &GatewayError) -> &'static str {
    match err.kind() {
        "invalid_request" => "INVALID_ARGUMENT",
        "invalid_credentials" | "credentials_revoked" | "credentials_expired" | "invalid_token"
        | "token_expired" => "UNAUTHENTICATED",
        "forbidden" => "PERMISSION_DENIED",
        "no_route" | "model_not_found_upstream" => "NOT_FOUND",
        "rate_limited" => "RESOURCE_EXHAUSTED",
        "timeout" => "DEADLINE_EXCEEDED",
        "unsupported_capability" => "UNIMPLEMENTED",
        "upstream_error" | "upstream_protocol_error" | "credentials_invalid_upstream" => {
            "UNAVAILABLE"
        }
        _ => "INTERNAL",
    }
}

pub fn error_body(err: &GatewayError) -> Value {
    json!({
        "error": {
            "code": err.status().as_u16(),
            "message": err.to_string(),
            "status": google_status(err),
        },
    })
}
