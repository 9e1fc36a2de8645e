//! OpenAI chat-completions dialect
//!
//! Parses `/v1/chat/completions` bodies into the normalized request and
//! re-encodes responses, chunks and errors in the shape OpenAI SDK
//! clients expect.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{sse_frame, ChunkEncoder};
use crate::error::{GatewayError, GatewayResult};
use crate::types::{
    ChatRequest, ChatResponse, Message, Role, StreamChunk, ToolCall, ToolDefinition,
};

/// Incoming chat-completions body (the honored subset).
#[derive(Debug, Deserialize)]
pub struct WireChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<WireStop>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<WireTool>,
}

#[derive(Debug, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<WireContent>,
    #[serde(default)]
    pub tool_calls: Vec<WireToolCall>,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
}

/// Content is either a plain string or multimodal parts; only the text
/// parts are honored.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Deserialize)]
pub struct WirePart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl WireContent {
    fn into_text(self) -> String {
        match self {
            WireContent::Text(text) => text,
            WireContent::Parts(parts) => parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WireStop {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct WireTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: WireFunctionDef,
}

#[derive(Debug, Deserialize)]
pub struct WireFunctionDef {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    pub function: WireFunctionCall,
}

#[derive(Debug, Deserialize)]
pub struct WireFunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Parse an OpenAI-shaped body into the normalized request. Leading
/// system messages are lifted into `system`.
pub fn parse_request(body: Value) -> GatewayResult<ChatRequest> {
    let wire: WireChatRequest = serde_json::from_value(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("malformed request body: {}", e)))?;

    let mut system_parts = Vec::new();
    let mut messages = Vec::new();
    for message in wire.messages {
        let role = Role::parse(&message.role).ok_or_else(|| {
            GatewayError::InvalidRequest(format!("unknown role '{}'", message.role))
        })?;
        let content = message.content.map(WireContent::into_text).unwrap_or_default();
        if role == Role::System {
            system_parts.push(content);
            continue;
        }
        messages.push(Message {
            role,
            content,
            tool_calls: message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect(),
            tool_call_id: message.tool_call_id,
            name: message.name,
        });
    }

    let request = ChatRequest {
        model: wire.model,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        },
        messages,
        temperature: wire.temperature,
        top_p: wire.top_p,
        max_tokens: wire.max_tokens,
        stop: match wire.stop {
            Some(WireStop::Single(stop)) => vec![stop],
            Some(WireStop::Multiple(stops)) => stops,
            None => Vec::new(),
        },
        stream: wire.stream,
        tools: wire
            .tools
            .into_iter()
            .filter(|t| t.tool_type == "function")
            .map(|t| ToolDefinition {
                name: t.function.name,
                description: t.function.description,
                parameters: t.function.parameters,
            })
            .collect(),
    };
    request.validate()?;
    Ok(request)
}

pub fn encode_response(response: &ChatResponse) -> Value {
    let mut message = json!({
        "role": "assistant",
        "content": response.content,
    });
    if !response.tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(
            response
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.arguments},
                    })
                })
                .collect(),
        );
    }

    json!({
        "id": response.id,
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": response.finish_reason.as_str(),
        }],
        "usage": {
            "prompt_tokens": response.usage.prompt_tokens,
            "completion_tokens": response.usage.completion_tokens,
            "total_tokens": response.usage.total_tokens,
        },
    })
}

pub struct OpenAiChunkEncoder {
    id: String,
    model: String,
    created: i64,
}

impl OpenAiChunkEncoder {
    pub fn new(id: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            model: model.to_string(),
            created: Utc::now().timestamp(),
        }
    }
}

impl ChunkEncoder for OpenAiChunkEncoder {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<String> {
        let mut delta = json!({});
        if let Some(role) = chunk.role {
            delta["role"] = json!(role.as_str());
        }
        if !chunk.text_delta.is_empty() {
            delta["content"] = json!(chunk.text_delta);
        }
        if let Some(tool) = &chunk.tool_call_delta {
            let mut function = json!({});
            if let Some(name) = &tool.name {
                function["name"] = json!(name);
            }
            if !tool.arguments_delta.is_empty() {
                function["arguments"] = json!(tool.arguments_delta);
            }
            let mut call = json!({
                "index": tool.index,
                "type": "function",
                "function": function,
            });
            if let Some(id) = &tool.id {
                call["id"] = json!(id);
            }
            delta["tool_calls"] = json!([call]);
        }

        let mut frame = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": chunk.finish_reason.map(|f| f.as_str()),
            }],
        });
        if let Some(usage) = chunk.usage {
            frame["usage"] = json!({
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_tokens": usage.total_tokens,
            });
        }
        vec![sse_frame(&frame)]
    }

    fn finish(&mut self) -> Vec<String> {
        vec!["data: [DONE]\n\n".to_string()]
    }
}

pub fn error_body(err: &GatewayError) -> Value {
    let error_type = match err.kind() {
        "invalid_request" => "invalid_request_error",
        "invalid_credentials" | "credentials_revoked" | "credentials_expired" | "invalid_token"
        | "token_expired" => "authentication_error",
        "forbidden" => "permission_error",
        "no_route" | "model_not_found_upstream" => "not_found_error",
        "rate_limited" => "rate_limit_error",
        _ => "api_error",
    };
    json!({
        "error": {
            "type": error_type,
            "message": err.to_string(),
            "code": err.kind(),
        },
    })
}
