//! Gateway coordinator
//!
//! Composes the per-request pipeline: route, attempt candidates under the
//! retry budget with trace events around every attempt, hand the result
//! back in normalized form, and guarantee exactly one usage record per
//! request whatever the outcome.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::error::{GatewayError, GatewayResult};
use crate::providers::{ProviderAdapter, ProviderRegistry};
use crate::router::{Candidate, Router};
use crate::streaming::pump;
use crate::trace::{stage, TraceStore};
use crate::types::{
    ChatRequest, ChatResponse, Dialect, EmbeddingsRequest, EmbeddingsResponse, FinishReason,
    ImageRequest, ImageResponse, ModelInfo, StreamChunk, TokenUsage, TranscriptionRequest,
    TranscriptionResponse,
};
use crate::usage::{ResponseStatus, UsageRecord, UsageSink};

/// Default whole-request budget when the server timeouts leave it open.
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Everything request-scoped the pipeline needs.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub trace_id: String,
    pub principal: Principal,
    pub dialect: Dialect,
    pub started: Instant,
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_sub(self.started.elapsed())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Result of a streaming chat call: the chunks plus the identifiers the
/// dialect encoder needs. Usage recording happens as the stream drains
/// (or is dropped).
pub struct ChatStreamOutcome {
    pub id: String,
    pub candidate: Candidate,
    pub chunks: Pin<Box<dyn Stream<Item = StreamChunk> + Send>>,
}

pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    router: Arc<Router>,
    usage: Arc<UsageSink>,
    traces: Arc<TraceStore>,
}

impl Gateway {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        router: Arc<Router>,
        usage: Arc<UsageSink>,
        traces: Arc<TraceStore>,
    ) -> Self {
        Self {
            registry,
            router,
            usage,
            traces,
        }
    }

    pub fn traces(&self) -> &TraceStore {
        &self.traces
    }

    /// Non-streaming chat. Records usage on every terminal outcome.
    pub async fn chat(
        &self,
        ctx: &RequestContext,
        request: ChatRequest,
    ) -> GatewayResult<ChatResponse> {
        self.check_model_access(ctx, &request.model)?;
        let incoming_model = request.model.clone();

        let attempt = {
            let request = request.clone();
            move |adapter: Arc<dyn ProviderAdapter>, candidate: Candidate, timeout: Duration| {
                let mut upstream_request = request.clone();
                upstream_request.model = candidate.upstream_model.clone();
                Box::pin(async move { adapter.complete(&upstream_request, timeout).await })
                    as BoxFuture<'static, GatewayResult<ChatResponse>>
            }
        };

        match self.execute_with_retry(ctx, &incoming_model, attempt).await {
            Ok((response, candidate)) => {
                self.record_usage(
                    ctx,
                    &incoming_model,
                    Some(&candidate),
                    response.usage,
                    ResponseStatus::Success,
                );
                Ok(response)
            }
            Err(err) => {
                self.record_failure(ctx, &incoming_model, &err);
                Err(err)
            }
        }
    }

    /// Streaming chat. The returned stream owns usage recording: the
    /// record is written when the terminal chunk passes (or the client
    /// hangs up and the stream is dropped).
    pub async fn chat_stream(
        &self,
        ctx: &RequestContext,
        request: ChatRequest,
    ) -> GatewayResult<ChatStreamOutcome> {
        self.check_model_access(ctx, &request.model)?;
        let incoming_model = request.model.clone();
        let estimated_prompt_tokens = request.estimate_prompt_tokens();

        let attempt = {
            let request = request.clone();
            move |adapter: Arc<dyn ProviderAdapter>, candidate: Candidate, timeout: Duration| {
                let mut upstream_request = request.clone();
                upstream_request.model = candidate.upstream_model.clone();
                upstream_request.stream = true;
                Box::pin(async move { adapter.stream(&upstream_request, timeout).await })
                    as BoxFuture<'static, _>
            }
        };

        let (upstream, candidate) = match self
            .execute_with_retry(ctx, &incoming_model, attempt)
            .await
        {
            Ok(ok) => ok,
            Err(err) => {
                self.record_failure(ctx, &incoming_model, &err);
                return Err(err);
            }
        };

        let id = format!("gen-{}", Uuid::new_v4());
        let pumped = pump(upstream, ctx.cancel.clone());

        let finalizer = Arc::new(StreamFinalizer::new(
            self.usage.clone(),
            self.traces.clone(),
            ctx.clone(),
            incoming_model,
            candidate.clone(),
            estimated_prompt_tokens,
        ));

        let monitor = finalizer.clone();
        let traces = self.traces.clone();
        let monitor_ctx = ctx.clone();
        let chunks = async_stream::stream! {
            let mut pumped = pumped;
            let mut first = true;
            while let Some(chunk) = pumped.next().await {
                if first {
                    first = false;
                    traces.append(
                        &monitor_ctx.trace_id,
                        &monitor_ctx.request_id,
                        stage::STREAM_CHUNK,
                        json!({"ttfb_ms": monitor_ctx.elapsed_ms()}),
                    );
                }
                monitor.observe(&chunk);
                yield chunk;
            }
            monitor.complete();
        };

        Ok(ChatStreamOutcome {
            id,
            candidate,
            chunks: Box::pin(chunks),
        })
    }

    pub async fn embeddings(
        &self,
        ctx: &RequestContext,
        request: EmbeddingsRequest,
    ) -> GatewayResult<EmbeddingsResponse> {
        self.check_model_access(ctx, &request.model)?;
        let incoming_model = request.model.clone();

        let attempt = {
            let request = request.clone();
            move |adapter: Arc<dyn ProviderAdapter>, candidate: Candidate, timeout: Duration| {
                let mut upstream_request = request.clone();
                upstream_request.model = candidate.upstream_model.clone();
                Box::pin(async move { adapter.embed(&upstream_request, timeout).await })
                    as BoxFuture<'static, GatewayResult<EmbeddingsResponse>>
            }
        };

        match self.execute_with_retry(ctx, &incoming_model, attempt).await {
            Ok((response, candidate)) => {
                self.record_usage(
                    ctx,
                    &incoming_model,
                    Some(&candidate),
                    response.usage,
                    ResponseStatus::Success,
                );
                Ok(response)
            }
            Err(err) => {
                self.record_failure(ctx, &incoming_model, &err);
                Err(err)
            }
        }
    }

    pub async fn transcribe(
        &self,
        ctx: &RequestContext,
        request: TranscriptionRequest,
    ) -> GatewayResult<TranscriptionResponse> {
        let incoming_model = request.model.clone();
        let attempt = {
            let request = request.clone();
            move |adapter: Arc<dyn ProviderAdapter>, candidate: Candidate, timeout: Duration| {
                let mut upstream_request = request.clone();
                upstream_request.model = candidate.upstream_model.clone();
                Box::pin(async move { adapter.transcribe(&upstream_request, timeout).await })
                    as BoxFuture<'static, _>
            }
        };

        match self.execute_with_retry(ctx, &incoming_model, attempt).await {
            Ok((response, candidate)) => {
                self.record_usage(
                    ctx,
                    &incoming_model,
                    Some(&candidate),
                    TokenUsage::default(),
                    ResponseStatus::Success,
                );
                Ok(response)
            }
            Err(err) => {
                self.record_failure(ctx, &incoming_model, &err);
                Err(err)
            }
        }
    }

    pub async fn generate_image(
        &self,
        ctx: &RequestContext,
        request: ImageRequest,
    ) -> GatewayResult<ImageResponse> {
        // Image models default to the provider the route names; an absent
        // model routes like "dall-e-3" so deployments can alias it.
        let incoming_model = request
            .model
            .clone()
            .unwrap_or_else(|| "dall-e-3".to_string());

        let attempt = {
            let request = request.clone();
            move |adapter: Arc<dyn ProviderAdapter>, candidate: Candidate, timeout: Duration| {
                let mut upstream_request = request.clone();
                upstream_request.model = Some(candidate.upstream_model.clone());
                Box::pin(async move { adapter.generate_image(&upstream_request, timeout).await })
                    as BoxFuture<'static, _>
            }
        };

        match self.execute_with_retry(ctx, &incoming_model, attempt).await {
            Ok((response, candidate)) => {
                self.record_usage(
                    ctx,
                    &incoming_model,
                    Some(&candidate),
                    TokenUsage::default(),
                    ResponseStatus::Success,
                );
                Ok(response)
            }
            Err(err) => {
                self.record_failure(ctx, &incoming_model, &err);
                Err(err)
            }
        }
    }

    pub async fn list_models(&self) -> Vec<ModelInfo> {
        self.registry.list_all_models().await
    }

    fn check_model_access(&self, ctx: &RequestContext, model: &str) -> GatewayResult<()> {
        if !ctx.principal.may_use_model(model) {
            return Err(GatewayError::Forbidden(format!(
                "model '{}' is not allowed for this API key",
                model
            )));
        }
        Ok(())
    }

    /// The candidate/retry loop shared by every routed operation.
    async fn execute_with_retry<T, F>(
        &self,
        ctx: &RequestContext,
        incoming_model: &str,
        mut attempt: F,
    ) -> GatewayResult<(T, Candidate)>
    where
        F: FnMut(Arc<dyn ProviderAdapter>, Candidate, Duration) -> BoxFuture<'static, GatewayResult<T>>,
    {
        let plan = self.router.plan(incoming_model)?;
        self.traces.append(
            &ctx.trace_id,
            &ctx.request_id,
            stage::ROUTE_SELECTED,
            json!({
                "model": incoming_model,
                "candidates": plan.iter().map(|c| c.provider.as_str()).collect::<Vec<_>>(),
            }),
        );

        let mut budget = self.router.retry_budget();
        let mut last_err: Option<GatewayError> = None;

        for (attempt_no, candidate) in plan.into_iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            let remaining = ctx.remaining();
            if remaining.is_zero() {
                return Err(last_err
                    .unwrap_or_else(|| GatewayError::Timeout("request deadline exhausted".into())));
            }

            let Some(adapter) = self.registry.get(&candidate.provider) else {
                warn!(provider = %candidate.provider, "route names unregistered provider");
                last_err = Some(GatewayError::Internal(format!(
                    "provider '{}' is not registered",
                    candidate.provider
                )));
                continue;
            };

            self.traces.append(
                &ctx.trace_id,
                &ctx.request_id,
                stage::ATTEMPT_START,
                json!({
                    "attempt": attempt_no,
                    "provider": candidate.provider,
                    "upstream_model": candidate.upstream_model,
                }),
            );

            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => Err(GatewayError::Cancelled),
                result = attempt(adapter, candidate.clone(), remaining) => result,
            };

            match result {
                Ok(value) => {
                    self.traces.append(
                        &ctx.trace_id,
                        &ctx.request_id,
                        stage::ATTEMPT_END,
                        json!({"attempt": attempt_no, "outcome": "success"}),
                    );
                    return Ok((value, candidate));
                }
                Err(err) => {
                    self.traces.append(
                        &ctx.trace_id,
                        &ctx.request_id,
                        stage::ATTEMPT_END,
                        json!({"attempt": attempt_no, "outcome": err.kind()}),
                    );

                    if !err.is_retriable() {
                        return Err(err);
                    }
                    if budget == 0 {
                        return Err(err);
                    }
                    budget -= 1;
                    debug!(provider = %candidate.provider, error = %err, budget,
                        "attempt failed, trying next candidate");

                    match Router::retry_delay(&err, ctx.remaining()) {
                        Ok(Some(wait)) => {
                            tokio::select! {
                                _ = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
                                _ = tokio::time::sleep(wait) => {}
                            }
                        }
                        Ok(None) => {}
                        // retry-after exceeds the remaining deadline.
                        Err(surface) => return Err(surface),
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| GatewayError::NoRoute(incoming_model.to_string())))
    }

    fn record_usage(
        &self,
        ctx: &RequestContext,
        incoming_model: &str,
        candidate: Option<&Candidate>,
        usage: TokenUsage,
        status: ResponseStatus,
    ) {
        record_usage_inner(
            &self.usage,
            &self.traces,
            ctx,
            incoming_model,
            candidate,
            usage,
            status,
        );
    }

    fn record_failure(&self, ctx: &RequestContext, incoming_model: &str, err: &GatewayError) {
        let status = match err {
            GatewayError::Timeout(_) => ResponseStatus::Timeout,
            GatewayError::Cancelled => ResponseStatus::Cancelled,
            _ => ResponseStatus::Error,
        };
        self.record_usage(ctx, incoming_model, None, TokenUsage::default(), status);
    }
}

fn record_usage_inner(
    usage_sink: &UsageSink,
    traces: &TraceStore,
    ctx: &RequestContext,
    incoming_model: &str,
    candidate: Option<&Candidate>,
    usage: TokenUsage,
    status: ResponseStatus,
) {
    traces.append(
        &ctx.trace_id,
        &ctx.request_id,
        stage::FINALIZE,
        json!({
            "status": status.as_str(),
            "total_tokens": usage.total_tokens,
            "duration_ms": ctx.elapsed_ms(),
        }),
    );

    let record = UsageRecord {
        id: Uuid::new_v4().to_string(),
        workspace_id: ctx.principal.workspace_id.clone(),
        request_id: ctx.request_id.clone(),
        trace_id: ctx.trace_id.clone(),
        api_key_id: ctx.principal.actor_id.clone(),
        provider_id: candidate.map(|c| c.provider.clone()).unwrap_or_default(),
        incoming_model: incoming_model.to_string(),
        selected_model: candidate
            .map(|c| c.upstream_model.clone())
            .unwrap_or_default(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cost_usd: None,
        duration_ms: ctx.elapsed_ms(),
        response_status: status,
        created_at: Utc::now(),
    };
    let events = traces.get(&ctx.trace_id);
    usage_sink.submit(record, events);
}

/// Accumulates stream statistics and guarantees a usage record exactly
/// once: on clean completion, on mid-stream error, and on client
/// disconnect (via Drop).
struct StreamFinalizer {
    usage_sink: Arc<UsageSink>,
    traces: Arc<TraceStore>,
    ctx: RequestContext,
    incoming_model: String,
    candidate: Candidate,
    estimated_prompt_tokens: u32,
    state: Mutex<StreamState>,
}

#[derive(Default)]
struct StreamState {
    text_chars: usize,
    usage: Option<TokenUsage>,
    finish: Option<FinishReason>,
    submitted: bool,
}

impl StreamFinalizer {
    fn new(
        usage_sink: Arc<UsageSink>,
        traces: Arc<TraceStore>,
        ctx: RequestContext,
        incoming_model: String,
        candidate: Candidate,
        estimated_prompt_tokens: u32,
    ) -> Self {
        Self {
            usage_sink,
            traces,
            ctx,
            incoming_model,
            candidate,
            estimated_prompt_tokens,
            state: Mutex::new(StreamState::default()),
        }
    }

    fn observe(&self, chunk: &StreamChunk) {
        let mut state = self.state.lock();
        state.text_chars += chunk.text_delta.len();
        if let Some(usage) = chunk.usage {
            state.usage = Some(usage);
        }
        if let Some(finish) = chunk.finish_reason {
            state.finish = Some(finish);
        }
    }

    fn complete(&self) {
        self.submit(None);
    }

    fn submit(&self, override_status: Option<ResponseStatus>) {
        let mut state = self.state.lock();
        if state.submitted {
            return;
        }
        state.submitted = true;

        let usage = state.usage.unwrap_or_else(|| {
            // Upstream never reported usage; estimate like the access logs
            // always have (~4 chars per token).
            TokenUsage::new(
                self.estimated_prompt_tokens,
                ((state.text_chars / 4).max(1)) as u32,
            )
        });
        let status = override_status.unwrap_or(match state.finish {
            Some(FinishReason::Error) => ResponseStatus::Error,
            Some(_) => ResponseStatus::Success,
            None => ResponseStatus::Cancelled,
        });
        drop(state);

        record_usage_inner(
            &self.usage_sink,
            &self.traces,
            &self.ctx,
            &self.incoming_model,
            Some(&self.candidate),
            usage,
            status,
        );
    }
}

impl Drop for StreamFinalizer {
    fn drop(&mut self) {
        // Client disconnects drop the response stream without running it
        // to completion; the record still has to happen.
        self.submit(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::auth::{Principal, SCOPE_API};
    use crate::providers::mock::MockAdapter;
    use crate::router::RouteTable;
    use crate::trace::TraceStore;
    use crate::usage::UsageFilter;

    fn context() -> RequestContext {
        RequestContext {
            request_id: Uuid::new_v4().to_string(),
            trace_id: Uuid::new_v4().to_string(),
            principal: Principal {
                workspace_id: "ws-1".into(),
                actor_id: "key-1".into(),
                scopes: vec![SCOPE_API.into()],
                allowed_models: None,
            },
            dialect: Dialect::OpenAi,
            started: Instant::now(),
            deadline: Duration::from_secs(30),
            cancel: CancellationToken::new(),
        }
    }

    fn gateway_with_mock_route(model: &str) -> Gateway {
        let registry = Arc::new(
            ProviderRegistry::builder()
                .register(Arc::new(MockAdapter::with_reply("hello from mock")))
                .build()
                .unwrap(),
        );
        let mut routes = HashMap::new();
        routes.insert(
            model.to_string(),
            vec![Candidate {
                provider: "mock".into(),
                upstream_model: "mock-model".into(),
                weight: 100,
            }],
        );
        Gateway::new(
            registry,
            Arc::new(Router::with_seed(RouteTable::new(routes), 2, 1)),
            UsageSink::new(false),
            Arc::new(TraceStore::default()),
        )
    }

    fn chat_request(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.into(),
            system: None,
            messages: vec![crate::types::Message::text(crate::types::Role::User, "hi")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: Vec::new(),
            stream: false,
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_chat_records_one_usage_record() {
        let gateway = gateway_with_mock_route("gpt-4o");
        let ctx = context();
        let response = gateway.chat(&ctx, chat_request("gpt-4o")).await.unwrap();
        assert_eq!(response.content, "hello from mock");

        let records = gateway.usage.query(&UsageFilter::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].response_status, ResponseStatus::Success);
        assert_eq!(records[0].incoming_model, "gpt-4o");
        assert_eq!(records[0].selected_model, "mock-model");
        assert_eq!(
            records[0].total_tokens,
            records[0].prompt_tokens + records[0].completion_tokens
        );
    }

    #[tokio::test]
    async fn test_chat_emits_attempt_pair() {
        let gateway = gateway_with_mock_route("gpt-4o");
        let ctx = context();
        gateway.chat(&ctx, chat_request("gpt-4o")).await.unwrap();

        let events = gateway.traces.get(&ctx.trace_id);
        let starts = events.iter().filter(|e| e.stage == stage::ATTEMPT_START).count();
        let ends = events.iter().filter(|e| e.stage == stage::ATTEMPT_END).count();
        assert_eq!(starts, 1);
        assert_eq!(ends, 1);
    }

    #[tokio::test]
    async fn test_no_route_records_error_usage() {
        let gateway = gateway_with_mock_route("gpt-4o");
        let ctx = context();
        let err = gateway.chat(&ctx, chat_request("unrouted")).await.unwrap_err();
        assert_eq!(err.kind(), "no_route");

        let records = gateway.usage.query(&UsageFilter::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].response_status, ResponseStatus::Error);
    }

    #[tokio::test]
    async fn test_model_allow_list_enforced() {
        let gateway = gateway_with_mock_route("gpt-4o");
        let mut ctx = context();
        ctx.principal.allowed_models = Some(vec!["other-model".into()]);
        let err = gateway.chat(&ctx, chat_request("gpt-4o")).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[tokio::test]
    async fn test_chat_stream_records_usage_on_completion() {
        let gateway = gateway_with_mock_route("gpt-4o");
        let ctx = context();
        let mut request = chat_request("gpt-4o");
        request.stream = true;

        let outcome = gateway.chat_stream(&ctx, request).await.unwrap();
        let chunks: Vec<StreamChunk> = outcome.chunks.collect().await;
        assert!(chunks.last().unwrap().is_terminal());

        let records = gateway.usage.query(&UsageFilter::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].response_status, ResponseStatus::Success);
        assert!(records[0].total_tokens > 0);
    }

    #[tokio::test]
    async fn test_chat_stream_dropped_records_cancelled() {
        let gateway = gateway_with_mock_route("gpt-4o");
        let ctx = context();
        let mut request = chat_request("gpt-4o");
        request.stream = true;

        let outcome = gateway.chat_stream(&ctx, request).await.unwrap();
        // Client hangs up before reading anything.
        drop(outcome);
        // Give the spawned pump a moment to notice.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let records = gateway.usage.query(&UsageFilter::default());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].response_status, ResponseStatus::Cancelled);
    }
}
