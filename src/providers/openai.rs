//! OpenAI provider adapter
//!
//! Speaks the chat-completions wire format upstream. This adapter carries
//! the widest capability set: chat, streaming, embeddings, image
//! generation, audio transcription and model listing.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    build_client, error_from_response, ProviderAdapter, ProviderHealth, ProviderType,
};
use crate::error::{GatewayError, GatewayResult};
use crate::streaming::{sse_events, ChunkStream};
use crate::types::{
    ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, FinishReason,
    GeneratedImage, ImageRequest, ImageResponse, ModelInfo, Role, StreamChunk, TokenUsage,
    ToolCall, ToolCallDelta, TranscriptionRequest, TranscriptionResponse,
};

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiAdapter {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_base_url(name, api_key, OPENAI_API_BASE)
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

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.bearer_auth(&self.api_key)
    }

    async fn send_chat(
        &self,
        request: &ChatRequest,
        stream: bool,
        timeout: Option<Duration>,
    ) -> GatewayResult<reqwest::Response> {
        let body = encode_chat_request(request, stream);
        let mut builder = self
            .authed(self.client.post(format!("{}/chat/completions", self.base_url)))
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
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::OpenAi
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> GatewayResult<ChatResponse> {
        let response = self.send_chat(request, false, Some(timeout)).await?;
        let wire: WireChatResponse = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocolError(format!("{}: bad chat response: {}", self.name, e))
        })?;
        decode_chat_response(wire, &self.name)
    }

    async fn stream(&self, request: &ChatRequest, _timeout: Duration) -> GatewayResult<ChunkStream> {
        // No whole-request timeout on streams; it would cut long
        // generations off mid-flight. Cancellation handles disconnects.
        let response = self.send_chat(request, true, None).await?;
        Ok(decode_chat_stream(response, self.name.clone()))
    }

    async fn embed(
        &self,
        request: &EmbeddingsRequest,
        timeout: Duration,
    ) -> GatewayResult<EmbeddingsResponse> {
        let body = serde_json::json!({
            "model": request.model,
            "input": request.input,
        });
        let response = self
            .authed(self.client.post(format!("{}/embeddings", self.base_url)))
            .json(&body)
            .timeout(timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(&self.name, response).await);
        }
        let wire: WireEmbeddingsResponse = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocolError(format!(
                "{}: bad embeddings response: {}",
                self.name, e
            ))
        })?;

        let mut data = wire.data;
        data.sort_by_key(|d| d.index);
        Ok(EmbeddingsResponse {
            model: wire.model,
            embeddings: data.into_iter().map(|d| d.embedding).collect(),
            usage: TokenUsage::new(wire.usage.prompt_tokens, 0),
        })
    }

    async fn list_models(&self) -> GatewayResult<Vec<ModelInfo>> {
        let response = self
            .authed(self.client.get(format!("{}/models", self.base_url)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(&self.name, response).await);
        }
        let wire: WireModelsResponse = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocolError(format!("{}: bad models response: {}", self.name, e))
        })?;
        Ok(wire
            .data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                provider: self.name.clone(),
                created: m.created,
            })
            .collect())
    }

    async fn transcribe(
        &self,
        request: &TranscriptionRequest,
        timeout: Duration,
    ) -> GatewayResult<TranscriptionResponse> {
        let file = reqwest::multipart::Part::bytes(request.audio.clone())
            .file_name(request.file_name.clone());
        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", request.model.clone());
        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .authed(self.client.post(format!("{}/audio/transcriptions", self.base_url)))
            .multipart(form)
            .timeout(timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(&self.name, response).await);
        }
        let wire: WireTranscription = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocolError(format!(
                "{}: bad transcription response: {}",
                self.name, e
            ))
        })?;
        Ok(TranscriptionResponse { text: wire.text })
    }

    async fn generate_image(
        &self,
        request: &ImageRequest,
        timeout: Duration,
    ) -> GatewayResult<ImageResponse> {
        let mut body = serde_json::json!({
            "prompt": request.prompt,
            "n": request.n,
        });
        if let Some(model) = &request.model {
            body["model"] = Value::String(model.clone());
        }
        if let Some(size) = &request.size {
            body["size"] = Value::String(size.clone());
        }

        let response = self
            .authed(self.client.post(format!("{}/images/generations", self.base_url)))
            .json(&body)
            .timeout(timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(&self.name, response).await);
        }
        let wire: WireImagesResponse = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocolError(format!("{}: bad images response: {}", self.name, e))
        })?;
        Ok(ImageResponse { images: wire.data })
    }

    async fn health_check(&self) -> ProviderHealth {
        let start = Instant::now();
        match self
            .authed(self.client.get(format!("{}/models", self.base_url)))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                ProviderHealth::healthy(start.elapsed().as_millis() as u64)
            }
            Ok(response) => {
                ProviderHealth::unhealthy(format!("status {}", response.status()))
            }
            Err(e) => ProviderHealth::unhealthy(e.to_string()),
        }
    }
}

/// Build the chat-completions request body from a normalized request.
/// The system prompt goes back into the message list, which is where
/// this wire format keeps it.
pub(crate) fn encode_chat_request(request: &ChatRequest, stream: bool) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(serde_json::json!({"role": "system", "content": system}));
    }
    for message in &request.messages {
        let mut wire = serde_json::json!({
            "role": message.role.as_str(),
            "content": message.content,
        });
        if !message.tool_calls.is_empty() {
            wire["tool_calls"] = Value::Array(
                message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        serde_json::json!({
                            "id": call.id,
                            "type": "function",
                            "function": {"name": call.name, "arguments": call.arguments},
                        })
                    })
                    .collect(),
            );
        }
        if let Some(id) = &message.tool_call_id {
            wire["tool_call_id"] = Value::String(id.clone());
        }
        if let Some(name) = &message.name {
            wire["name"] = Value::String(name.clone());
        }
        messages.push(wire);
    }

    let mut body = serde_json::json!({
        "model": request.model,
        "messages": messages,
        "stream": stream,
    });
    if let Some(temperature) = request.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = serde_json::json!(top_p);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if !request.stop.is_empty() {
        body["stop"] = serde_json::json!(request.stop);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect(),
        );
    }
    body
}

pub(crate) fn parse_finish_reason(raw: Option<&str>) -> FinishReason {
    match raw {
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn decode_chat_response(wire: WireChatResponse, provider: &str) -> GatewayResult<ChatResponse> {
    let choice = wire.choices.into_iter().next().ok_or_else(|| {
        GatewayError::UpstreamProtocolError(format!("{}: response has no choices", provider))
    })?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: call.function.arguments,
        })
        .collect();

    let usage = wire.usage.unwrap_or_default();
    Ok(ChatResponse {
        id: wire.id,
        model: wire.model,
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
        usage: TokenUsage::new(usage.prompt_tokens, usage.completion_tokens),
    })
}

/// Decode a chat-completions SSE stream into normalized chunks.
///
/// `finish_reason` and usage can arrive in separate frames; both are held
/// until the `[DONE]` terminator so the normalized stream ends with a
/// single terminal chunk.
pub(crate) fn decode_chat_stream(response: reqwest::Response, provider: String) -> ChunkStream {
    let stream = async_stream::try_stream! {
        let mut events = Box::pin(sse_events(response));
        let mut index: u32 = 0;
        let mut first = true;
        let mut pending_finish: Option<FinishReason> = None;
        let mut pending_usage: Option<TokenUsage> = None;

        while let Some(event) = events.next().await {
            let event = event?;
            if event.data == "[DONE]" {
                break;
            }
            let wire: WireChunk = serde_json::from_str(&event.data).map_err(|e| {
                GatewayError::UpstreamProtocolError(format!(
                    "{}: bad stream event: {}", provider, e
                ))
            })?;

            if let Some(usage) = wire.usage {
                pending_usage = Some(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
            }

            let Some(choice) = wire.choices.into_iter().next() else {
                continue;
            };
            if let Some(reason) = choice.finish_reason.as_deref() {
                pending_finish = Some(parse_finish_reason(Some(reason)));
            }

            let text = choice.delta.content.unwrap_or_default();
            let tool_delta = choice.delta.tool_calls.and_then(|mut calls| {
                if calls.is_empty() { None } else { Some(calls.remove(0)) }
            });
            if text.is_empty() && tool_delta.is_none() {
                continue;
            }

            let chunk = StreamChunk {
                index,
                role: if first { Some(Role::Assistant) } else { None },
                text_delta: text,
                tool_call_delta: tool_delta.map(|delta| ToolCallDelta {
                    index: delta.index,
                    id: delta.id,
                    name: delta.function.as_ref().and_then(|f| f.name.clone()),
                    arguments_delta: delta
                        .function
                        .and_then(|f| f.arguments)
                        .unwrap_or_default(),
                }),
                finish_reason: None,
                usage: None,
            };
            first = false;
            index += 1;
            yield chunk;
        }

        yield StreamChunk::terminal(
            index,
            pending_finish.unwrap_or(FinishReason::Stop),
            pending_usage,
        );
    };
    Box::pin(stream)
}

// Upstream wire structures.

#[derive(Debug, Deserialize)]
pub(crate) struct WireChatResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<WireChoice>,
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChoice {
    pub message: WireMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMessage {
    #[allow(dead_code)]
    pub role: Option<String>,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireToolCall {
    pub id: String,
    pub function: WireFunction,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChunk {
    #[serde(default)]
    pub choices: Vec<WireChunkChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChunkChoice {
    pub delta: WireDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireToolCallDelta {
    #[serde(default)]
    pub index: u32,
    pub id: Option<String>,
    pub function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireFunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingsResponse {
    data: Vec<WireEmbedding>,
    model: String,
    usage: WireEmbeddingUsage,
}

#[derive(Debug, Deserialize)]
struct WireEmbedding {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingUsage {
    #[serde(default)]
    prompt_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireModelsResponse {
    data: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
    created: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireTranscription {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireImagesResponse {
    data: Vec<GeneratedImage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".into(),
            system: Some("Be brief.".into()),
            messages: vec![Message::text(Role::User, "hi")],
            temperature: Some(0.7),
            top_p: None,
            max_tokens: Some(64),
            stop: vec!["END".into()],
            stream: false,
            tools: Vec::new(),
        }
    }

    #[test]
    fn test_encode_reinserts_system_message() {
        let body = encode_chat_request(&request(), false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "Be brief.");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["stop"][0], "END");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_encode_skips_absent_fields() {
        let mut req = request();
        req.system = None;
        req.temperature = None;
        req.max_tokens = None;
        req.stop.clear();
        let body = encode_chat_request(&req, true);
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("stop").is_none());
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn test_complete_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-4o"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "model": "gpt-4o",
                "choices": [{
                    "message": {"role": "assistant", "content": "hello"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::with_base_url("openai", "sk-test", server.uri());
        let response = adapter
            .complete(&request(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.total_tokens, 4);
    }

    #[tokio::test]
    async fn test_stream_decodes_chunks_and_terminator() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::with_base_url("openai", "sk-test", server.uri());
        let chunks: Vec<StreamChunk> = adapter
            .stream(&request(), Duration::from_secs(10))
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text_delta, "hel");
        assert_eq!(chunks[0].role, Some(Role::Assistant));
        assert_eq!(chunks[1].text_delta, "lo");
        assert!(chunks[2].is_terminal());
        assert_eq!(chunks[2].usage, Some(TokenUsage::new(3, 2)));
    }

    #[tokio::test]
    async fn test_complete_maps_upstream_503() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::with_base_url("openai", "sk-test", server.uri());
        let err = adapter
            .complete(&request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "upstream_error");
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_embed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"embedding": [0.5, 0.25], "index": 1},
                    {"embedding": [0.1, 0.2], "index": 0}
                ],
                "model": "text-embedding-3-small",
                "usage": {"prompt_tokens": 8, "total_tokens": 8}
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::with_base_url("openai", "sk-test", server.uri());
        let response = adapter
            .embed(
                &EmbeddingsRequest {
                    model: "text-embedding-3-small".into(),
                    input: vec!["a".into(), "b".into()],
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        // Results come back in input order regardless of wire order.
        assert_eq!(response.embeddings[0], vec![0.1, 0.2]);
        assert_eq!(response.usage.prompt_tokens, 8);
    }

    #[tokio::test]
    async fn test_list_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"id": "gpt-4o", "created": 1715367049}, {"id": "gpt-4o-mini"}]
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::with_base_url("openai", "sk-test", server.uri());
        let models = adapter.list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].id, "gpt-4o");
        assert_eq!(models[0].provider, "openai");
    }
}
