//! Google Gemini provider adapter
//!
//! Speaks the generateContent wire format upstream: `contents[]` with
//! user/model roles, parts arrays, and a separate systemInstruction.
//! Streaming requests ask for `alt=sse` so the response arrives as SSE
//! frames instead of an incrementally streamed JSON array.

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

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiAdapter {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiAdapter {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_base_url(name, api_key, GEMINI_API_BASE)
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

    fn model_path(model: &str) -> String {
        if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        }
    }

    async fn send_generate(
        &self,
        request: &ChatRequest,
        stream: bool,
        timeout: Option<Duration>,
    ) -> GatewayResult<reqwest::Response> {
        let action = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!(
            "{}/{}:{}",
            self.base_url,
            Self::model_path(&request.model),
            action
        );
        let body = encode_generate_request(request);
        // The key travels in a header, never in the URL, so request logs
        // and referrers cannot leak it.
        let mut builder = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
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
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Gemini
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> GatewayResult<ChatResponse> {
        let response = self.send_generate(request, false, Some(timeout)).await?;
        let wire: WireGenerateResponse = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocolError(format!(
                "{}: bad generateContent response: {}",
                self.name, e
            ))
        })?;
        decode_generate_response(wire, &request.model, &self.name)
    }

    async fn stream(&self, request: &ChatRequest, _timeout: Duration) -> GatewayResult<ChunkStream> {
        let response = self.send_generate(request, true, None).await?;
        Ok(decode_generate_stream(response, self.name.clone()))
    }

    async fn list_models(&self) -> GatewayResult<Vec<ModelInfo>> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(&self.name, response).await);
        }
        let wire: WireModelsResponse = response.json().await.map_err(|e| {
            GatewayError::UpstreamProtocolError(format!("{}: bad models response: {}", self.name, e))
        })?;
        Ok(wire
            .models
            .into_iter()
            .filter(|m| {
                m.supported_generation_methods
                    .iter()
                    .any(|method| method == "generateContent")
            })
            .map(|m| ModelInfo {
                id: m.name.strip_prefix("models/").unwrap_or(&m.name).to_string(),
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
            .header("x-goog-api-key", &self.api_key)
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

/// Build the generateContent body. Assistant turns become `model` role,
/// tool calls become functionCall parts, tool results functionResponse
/// parts under the user role.
pub(crate) fn encode_generate_request(request: &ChatRequest) -> Value {
    let mut contents = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => continue,
            Role::User => contents.push(serde_json::json!({
                "role": "user",
                "parts": [{"text": message.content}],
            })),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(serde_json::json!({"text": message.content}));
                }
                for call in &message.tool_calls {
                    let args: Value = serde_json::from_str(&call.arguments)
                        .unwrap_or_else(|_| serde_json::json!({}));
                    parts.push(serde_json::json!({
                        "functionCall": {"name": call.name, "args": args},
                    }));
                }
                contents.push(serde_json::json!({"role": "model", "parts": parts}));
            }
            Role::Tool => {
                let name = message.name.clone().unwrap_or_else(|| "tool".to_string());
                let response: Value = serde_json::from_str(&message.content)
                    .unwrap_or_else(|_| serde_json::json!({"result": message.content}));
                contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {"name": name, "response": response},
                    }],
                }));
            }
        }
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(temperature) = request.temperature {
        generation_config.insert("temperature".into(), serde_json::json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation_config.insert("topP".into(), serde_json::json!(top_p));
    }
    if let Some(max_tokens) = request.max_tokens {
        generation_config.insert("maxOutputTokens".into(), serde_json::json!(max_tokens));
    }
    if !request.stop.is_empty() {
        generation_config.insert("stopSequences".into(), serde_json::json!(request.stop));
    }

    let mut body = serde_json::json!({"contents": contents});
    if !generation_config.is_empty() {
        body["generationConfig"] = Value::Object(generation_config);
    }
    if let Some(system) = &request.system {
        body["systemInstruction"] = serde_json::json!({"parts": [{"text": system}]});
    }
    if !request.tools.is_empty() {
        body["tools"] = serde_json::json!([{
            "functionDeclarations": request.tools.iter().map(|tool| {
                serde_json::json!({
                    "name": tool.name,
                    "description": tool.description.clone().unwrap_or_default(),
                    "parameters": tool.parameters,
                })
            }).collect::<Vec<_>>(),
        }]);
    }
    body
}

pub(crate) fn parse_gemini_finish(raw: Option<&str>, has_tool_calls: bool) -> FinishReason {
    if has_tool_calls {
        return FinishReason::ToolCalls;
    }
    match raw {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn decode_generate_response(
    wire: WireGenerateResponse,
    model: &str,
    provider: &str,
) -> GatewayResult<ChatResponse> {
    let candidate = wire.candidates.into_iter().next().ok_or_else(|| {
        GatewayError::UpstreamProtocolError(format!("{}: response has no candidates", provider))
    })?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for (i, part) in candidate.content.parts.into_iter().enumerate() {
        if let Some(text) = part.text {
            content.push_str(&text);
        }
        if let Some(call) = part.function_call {
            tool_calls.push(ToolCall {
                id: format!("call_{}_{}", provider, i),
                name: call.name,
                arguments: call.args.to_string(),
            });
        }
    }

    let usage = wire.usage_metadata.unwrap_or_default();
    let finish = parse_gemini_finish(candidate.finish_reason.as_deref(), !tool_calls.is_empty());
    Ok(ChatResponse {
        id: format!("gen-{}", uuid::Uuid::new_v4()),
        model: model.to_string(),
        content,
        tool_calls,
        finish_reason: finish,
        usage: TokenUsage::new(usage.prompt_token_count, usage.candidates_token_count),
    })
}

/// Decode the `alt=sse` stream: each frame is a generateContent response
/// fragment; the last one carries finishReason and usageMetadata.
pub(crate) fn decode_generate_stream(response: reqwest::Response, provider: String) -> ChunkStream {
    let stream = async_stream::try_stream! {
        let mut events = Box::pin(sse_events(response));
        let mut index: u32 = 0;
        let mut first = true;
        let mut finish: Option<FinishReason> = None;
        let mut usage: Option<TokenUsage> = None;

        while let Some(event) = events.next().await {
            let event = event?;
            let wire: WireGenerateResponse = serde_json::from_str(&event.data).map_err(|e| {
                GatewayError::UpstreamProtocolError(format!(
                    "{}: bad stream frame: {}", provider, e
                ))
            })?;

            if let Some(meta) = wire.usage_metadata {
                usage = Some(TokenUsage::new(
                    meta.prompt_token_count,
                    meta.candidates_token_count,
                ));
            }

            let Some(candidate) = wire.candidates.into_iter().next() else {
                continue;
            };

            let mut had_tool_call = false;
            for part in candidate.content.parts {
                if let Some(text) = part.text {
                    if !text.is_empty() {
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
                    }
                }
                if let Some(call) = part.function_call {
                    had_tool_call = true;
                    let chunk = StreamChunk {
                        index,
                        role: if first { Some(Role::Assistant) } else { None },
                        text_delta: String::new(),
                        tool_call_delta: Some(ToolCallDelta {
                            index: 0,
                            id: None,
                            name: Some(call.name),
                            arguments_delta: call.args.to_string(),
                        }),
                        finish_reason: None,
                        usage: None,
                    };
                    first = false;
                    index += 1;
                    yield chunk;
                }
            }

            if let Some(reason) = candidate.finish_reason.as_deref() {
                finish = Some(parse_gemini_finish(Some(reason), had_tool_call));
            }
        }

        yield StreamChunk::terminal(index, finish.unwrap_or(FinishReason::Stop), usage);
    };
    Box::pin(stream)
}

// Upstream wire structures.

#[derive(Debug, Deserialize)]
struct WireGenerateResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<WireUsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    #[serde(default)]
    content: WireContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct WireModelsResponse {
    #[serde(default)]
    models: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    name: String,
    #[serde(rename = "supportedGenerationMethods", default)]
    supported_generation_methods: Vec<String>,
}
