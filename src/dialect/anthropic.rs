//! Anthropic Messages dialect
//!
//! Parses `/v1/messages` bodies and re-encodes responses and chunks as
//! the typed-event stream Anthropic SDK clients expect.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{sse_event_frame, ChunkEncoder};
use crate::error::{GatewayError, GatewayResult};
use crate::types::{
    ChatRequest, ChatResponse, FinishReason, Message, Role, StreamChunk, ToolCall, ToolDefinition,
};

#[derive(Debug, Deserialize)]
pub struct WireMessagesRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub system: Option<WireSystem>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<WireTool>,
}

/// System is either a string or a list of text blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WireSystem {
    Text(String),
    Blocks(Vec<WireTextBlock>),
}

#[derive(Debug, Deserialize)]
pub struct WireTextBlock {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: WireMessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum WireMessageContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct WireTool {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

pub fn parse_request(body: Value) -> GatewayResult<ChatRequest> {
    let wire: WireMessagesRequest = serde_json::from_value(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("malformed request body: {}", e)))?;

    let system = wire.system.map(|s| match s {
        WireSystem::Text(text) => text,
        WireSystem::Blocks(blocks) => blocks
            .into_iter()
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n"),
    });

    let mut messages = Vec::new();
    for message in wire.messages {
        let role = match message.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(GatewayError::InvalidRequest(format!(
                    "unknown role '{}'",
                    other
                )));
            }
        };
        match message.content {
            WireMessageContent::Text(content) => {
                messages.push(Message::text(role, content));
            }
            WireMessageContent::Blocks(blocks) => {
                let mut content = String::new();
                let mut tool_calls = Vec::new();
                for block in blocks {
                    match block {
                        WireBlock::Text { text } => content.push_str(&text),
                        WireBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                            id,
                            name,
                            arguments: input.to_string(),
                        }),
                        WireBlock::ToolResult {
                            tool_use_id,
                            content,
                        } => {
                            // A tool result arrives inside a user message;
                            // it becomes its own tool-role turn.
                            let rendered = match &content {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            messages.push(Message {
                                role: Role::Tool,
                                content: rendered,
                                tool_calls: Vec::new(),
                                tool_call_id: Some(tool_use_id),
                                name: None,
                            });
                        }
                        WireBlock::Other => {}
                    }
                }
                if !content.is_empty() || !tool_calls.is_empty() {
                    messages.push(Message {
                        role,
                        content,
                        tool_calls,
                        tool_call_id: None,
                        name: None,
                    });
                }
            }
        }
    }

    let request = ChatRequest {
        model: wire.model,
        system,
        messages,
        temperature: wire.temperature,
        top_p: wire.top_p,
        max_tokens: wire.max_tokens,
        stop: wire.stop_sequences,
        stream: wire.stream,
        tools: wire
            .tools
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name,
                description: t.description,
                parameters: t.input_schema,
            })
            .collect(),
    };
    request.validate()?;
    Ok(request)
}

fn stop_reason(finish: FinishReason) -> &'static str {
    match finish {
        FinishReason::Length => "max_tokens",
        FinishReason::ToolCalls => "tool_use",
        // The Messages dialect has no error stop reason; the stream path
        // reports errors via an error event instead.
        _ => "end_turn",
    }
}

pub fn encode_response(response: &ChatResponse) -> Value {
    let mut content = Vec::new();
    if !response.content.is_empty() || response.tool_calls.is_empty() {
        content.push(json!({"type": "text", "text": response.content}));
    }
    for call in &response.tool_calls {
        let input: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": input,
        }));
    }

    json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": content,
        "stop_reason": stop_reason(response.finish_reason),
        "stop_sequence": null,
        "usage": {
            "input_tokens": response.usage.prompt_tokens,
            "output_tokens": response.usage.completion_tokens,
        },
    })
}

/// Re-encodes normalized chunks as the typed event sequence:
/// message_start, content_block_start, content_block_delta*,
/// content_block_stop, message_delta, message_stop.
pub struct AnthropicChunkEncoder {
    id: String,
    model: String,
    started: bool,
    block_open: bool,
    output_tokens: u32,
}

impl AnthropicChunkEncoder {
    pub fn new(id: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            model: model.to_string(),
            started: false,
            block_open: false,
            output_tokens: 0,
        }
    }

    fn message_start(&self) -> String {
        sse_event_frame(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            }),
        )
    }
}

impl ChunkEncoder for AnthropicChunkEncoder {
    fn encode(&mut self, chunk: &StreamChunk) -> Vec<String> {
        let mut frames = Vec::new();
        if !self.started {
            self.started = true;
            frames.push(self.message_start());
        }

        if let Some(usage) = chunk.usage {
            self.output_tokens = usage.completion_tokens;
        }

        if !chunk.text_delta.is_empty() {
            if !self.block_open {
                self.block_open = true;
                frames.push(sse_event_frame(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": 0,
                        "content_block": {"type": "text", "text": ""},
                    }),
                ));
            }
            frames.push(sse_event_frame(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": chunk.text_delta},
                }),
            ));
        }

        if let Some(finish) = chunk.finish_reason {
            if self.block_open {
                self.block_open = false;
                frames.push(sse_event_frame(
                    "content_block_stop",
                    &json!({"type": "content_block_stop", "index": 0}),
                ));
            }
            frames.push(sse_event_frame(
                "message_delta",
                &json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": stop_reason(finish), "stop_sequence": null},
                    "usage": {"output_tokens": self.output_tokens},
                }),
            ));
            frames.push(sse_event_frame(
                "message_stop",
                &json!({"type": "message_stop"}),
            ));
        }
        frames
    }

    fn finish(&mut self) -> Vec<String> {
        // message_stop already went out with the terminal chunk.
        Vec::new()
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
        "upstream_error" | "timeout" => "overloaded_error",
        _ => "api_error",
    };
    json!({
        "type": "error",
        "error": {
            "type": error_type,
            "message": err.to_string(),
        },
    })
}
