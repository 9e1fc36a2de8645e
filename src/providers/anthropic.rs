//! Anthropic provider adapter
//!
//! Speaks the Messages API upstream: the system prompt is a top-level
//! parameter, conversations alternate user/assistant, and streaming uses
//! typed SSE events rather than a bare data stream.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{build_client, error_from_response, ProviderAdapter, ProviderHealth, ProviderType};
use crate::error::{GatewayError, GatewayResult};
use crate::streaming::{sse_events, ChunkStream};
use crate::types::{
    ChatRequest, ChatResponse, FinishReason, ModelInfo, Role, StreamChunk, TokenUsage, ToolCall,
    ToolCallDelta,
};

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default generation budget when the caller did not set one; the
/// Messages API requires max_tokens.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_base_url(name, api_key, ANTHROPIC_API_BASE)
    }

    pub fn with_base_url(
        name: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            client: build_client(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn send_messages(
        &self,
        request: &ChatRequest,
        stream: bool,
        timeout: Option<Duration>,
    ) -> GatewayResult<reqwest::Response> {
        let body = encode_messages_request(request, stream);
        let mut builder = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(&self.name, response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> GatewayResult<ChatResponse> {
        let response = self.send_messages(request, false, Some(timeout)).await?;
        let wire: WireMessageResponse = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocolError(format!(
                "{}: bad messages response: {}",
                self.name, e
            ))
        })?;
        Ok(decode_message_response(wire))
    }

    async fn stream(&self, request: &ChatRequest, _timeout: Duration) -> GatewayResult<ChunkStream> {
        let response = self.send_messages(request, true, None).await?;
        Ok(decode_message_stream(response, self.name.clone()))
    }

    async fn list_models(&self) -> GatewayResult<Vec<ModelInfo>> {
        // No public models endpoint worth depending on; a static family
        // list keeps `/v1/models` aggregation useful.
        Ok([
            "claude-3-opus-20240229",
            "claude-3-sonnet-20240229",
            "claude-3-haiku-20240307",
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
        ]
        .iter()
        .map(|id| ModelInfo {
            id: id.to_string(),
            provider: self.name.clone(),
            created: None,
        })
        .collect())
    }

    async fn health_check(&self) -> ProviderHealth {
        let start = Instant::now();
        match self
            .client
            .get(format!("{}/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                ProviderHealth::healthy(start.elapsed().as_millis() as u64)
            }
            Ok(response) => ProviderHealth::unhealthy(format!("status {}", response.status())),
            Err(e) => ProviderHealth::unhealthy(e.to_string()),
        }
    }
}

/// Build the Messages API body. System prompt moves to the top-level
/// `system` field; tool exchanges become content blocks.
pub(crate) fn encode_messages_request(request: &ChatRequest, stream: bool) -> Value {
    let mut messages = Vec::new();
    for message in &request.messages {
        match message.role {
            // A stray system message inside the list still ends up top-level
            // via `request.system`; nothing to emit here.
            Role::System => continue,
            Role::User => {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": message.content,
                }));
            }
            Role::Assistant => {
                if message.tool_calls.is_empty() {
                    messages.push(serde_json::json!({
                        "role": "assistant",
                        "content": message.content,
                    }));
                } else {
                    let mut blocks = Vec::new();
                    if !message.content.is_empty() {
                        blocks.push(serde_json::json!({"type": "text", "text": message.content}));
                    }
                    for call in &message.tool_calls {
                        let input: Value =
                            serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
                        blocks.push(serde_json::json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": input,
                        }));
                    }
                    messages.push(serde_json::json!({"role": "assistant", "content": blocks}));
                }
            }
            Role::Tool => {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id,
                        "content": message.content,
                    }],
                }));
            }
        }
    }

    let mut body = serde_json::json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "stream": stream,
    });
    if let Some(system) = &request.system {
        body["system"] = Value::String(system.clone());
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = serde_json::json!(top_p);
    }
    if !request.stop.is_empty() {
        body["stop_sequences"] = serde_json::json!(request.stop);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect(),
        );
    }
    body
}

pub(crate) fn parse_stop_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

fn decode_message_response(wire: WireMessageResponse) -> ChatResponse {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in wire.content {
        match block {
            WireContentBlock::Text { text } => content.push_str(&text),
            WireContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: input.to_string(),
            }),
            WireContentBlock::Other => {}
        }
    }

    ChatResponse {
        id: wire.id,
        model: wire.model,
        content,
        tool_calls,
        finish_reason: parse_stop_reason(wire.stop_reason.as_deref()),
        usage: TokenUsage::new(wire.usage.input_tokens, wire.usage.output_tokens),
    }
}

/// Decode the typed event stream: `message_start` carries input tokens,
/// `content_block_delta` carries the text, `message_delta` carries the
/// stop reason and output tokens, `message_stop` ends the message.
pub(crate) fn decode_message_stream(response: reqwest::Response, provider: String) -> ChunkStream {
    let stream = async_stream::try_stream! {
        let mut events = Box::pin(sse_events(response));
        let mut index: u32 = 0;
        let mut first = true;
        let mut input_tokens: u32 = 0;
        let mut output_tokens: u32 = 0;
        let mut finish = FinishReason::Stop;

        while let Some(event) = events.next().await {
            let event = event?;
            let wire: WireStreamEvent = serde_json::from_str(&event.data).map_err(|e| {
                GatewayError::UpstreamProtocolError(format!(
                    "{}: bad stream event: {}", provider, e
                ))
            })?;

            match wire.event_type.as_str() {
                "message_start" => {
                    if let Some(message) = wire.message {
                        input_tokens = message.usage.input_tokens;
                    }
                }
                "content_block_delta" => {
                    let Some(delta) = wire.delta else { continue };
                    if let Some(text) = delta.text {
                        let chunk = StreamChunk {
                            index,
                            role: if first { Some(Role::Assistant) } else { None },
                            text_delta: text,
                            tool_call_delta: None,
                            finish_reason: None,
                            usage: None,
                        };
                        first = false;
                        index += 1;
                        yield chunk;
                    } else if let Some(partial_json) = delta.partial_json {
                        let chunk = StreamChunk {
                            index,
                            role: if first { Some(Role::Assistant) } else { None },
                            text_delta: String::new(),
                            tool_call_delta: Some(ToolCallDelta {
                                index: wire.index.unwrap_or(0),
                                id: None,
                                name: None,
                                arguments_delta: partial_json,
                            }),
                            finish_reason: None,
                            usage: None,
                        };
                        first = false;
                        index += 1;
                        yield chunk;
                    }
                }
                "content_block_start" => {
                    // Tool-use blocks announce their id/name here.
                    if let Some(block) = wire.content_block {
                        if let WireContentBlock::ToolUse { id, name, .. } = block {
                            let chunk = StreamChunk {
                                index,
                                role: if first { Some(Role::Assistant) } else { None },
                                text_delta: String::new(),
                                tool_call_delta: Some(ToolCallDelta {
                                    index: wire.index.unwrap_or(0),
                                    id: Some(id),
                                    name: Some(name),
                                    arguments_delta: String::new(),
                                }),
                                finish_reason: None,
                                usage: None,
                            };
                            first = false;
                            index += 1;
                            yield chunk;
                        }
                    }
                }
                "message_delta" => {
                    if let Some(delta) = wire.delta {
                        if let Some(reason) = delta.stop_reason {
                            finish = parse_stop_reason(Some(&reason));
                        }
                    }
                    if let Some(usage) = wire.usage {
                        output_tokens = usage.output_tokens;
                    }
                }
                "message_stop" => {
                    break;
                }
                // ping, content_block_stop and future event types.
                _ => {}
            }
        }

        yield StreamChunk::terminal(
            index,
            finish,
            Some(TokenUsage::new(input_tokens, output_tokens)),
        );
    };
    Box::pin(stream)
}

// Upstream wire structures.

#[derive(Debug, Deserialize)]
struct WireMessageResponse {
    id: String,
    model: String,
    content: Vec<WireContentBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    message: Option<WireStartMessage>,
    #[serde(default)]
    content_block: Option<WireContentBlock>,
    #[serde(default)]
    delta: Option<WireStreamDelta>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStartMessage {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireStreamDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "claude-3-haiku".into(),
            system: Some("You are terse.".into()),
            messages: vec![Message::text(Role::User, "hi")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: Vec::new(),
            stream: false,
            tools: Vec::new(),
        }
    }

    #[test]
    fn test_encode_promotes_system_to_top_level() {
        let body = encode_messages_request(&request(), false);
        assert_eq!(body["system"], "You are terse.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_encode_tool_result_becomes_user_block() {
        let mut req = request();
        req.messages.push(Message {
            role: Role::Tool,
            content: "{\"temp\": 21}".into(),
            tool_calls: Vec::new(),
            tool_call_id: Some("toolu_1".into()),
            name: Some("get_weather".into()),
        });
        let body = encode_messages_request(&req, false);
        let last = &body["messages"][1];
        assert_eq!(last["role"], "user");
        assert_eq!(last["content"][0]["type"], "tool_result");
        assert_eq!(last["content"][0]["tool_use_id"], "toolu_1");
    }

    #[tokio::test]
    async fn test_complete_decodes_anthropic_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_01",
                "model": "claude-3-haiku-20240307",
                "content": [{"type": "text", "text": "hello"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 3, "output_tokens": 1}
            })))
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter::with_base_url("anthropic", "sk-ant-test", server.uri());
        let response = adapter
            .complete(&request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage, TokenUsage::new(3, 1));
    }

    #[tokio::test]
    async fn test_stream_decodes_typed_events() {
        let server = MockServer::start().await;
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":3}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hel\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter::with_base_url("anthropic", "sk-ant-test", server.uri());
        let chunks: Vec<StreamChunk> = adapter
            .stream(&request(), Duration::from_secs(5))
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text_delta, "hel");
        assert_eq!(chunks[1].text_delta, "lo");
        let last = chunks.last().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.usage, Some(TokenUsage::new(3, 2)));
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(parse_stop_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(parse_stop_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(parse_stop_reason(Some("tool_use")), FinishReason::ToolCalls);
        assert_eq!(parse_stop_reason(Some("stop_sequence")), FinishReason::Stop);
        assert_eq!(parse_stop_reason(None), FinishReason::Stop);
    }
}
