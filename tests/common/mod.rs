//! Shared test harness: in-process app with stub upstreams.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router as AxumRouter;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use rad_gateway::auth::{ApiKeyAuthenticator, JwtAuthenticator};
use rad_gateway::cache::{AgentCardCache, ApiKeyInfoCache, NullCache};
use rad_gateway::config::GatewayConfig;
use rad_gateway::cost::{CostAggregator, CostCalculator};
use rad_gateway::gateway::Gateway;
use rad_gateway::providers::{ProviderAdapter, ProviderRegistry};
use rad_gateway::router::{Candidate, RouteTable, Router};
use rad_gateway::server::{build_app, AppState};
use rad_gateway::storage::Store;
use rad_gateway::trace::TraceStore;
use rad_gateway::usage::UsageSink;

pub const ADMIN_KEY: &str = "rad_admin_key_001";
pub const TEST_KEY: &str = "rad_test_key_002";
pub const JWT_SECRET: &[u8] = b"integration-test-secret";

pub struct Harness {
    pub state: AppState,
    pub app: AxumRouter,
}

pub struct HarnessOptions {
    pub adapters: Vec<Arc<dyn ProviderAdapter>>,
    pub routes: HashMap<String, Vec<Candidate>>,
    pub store: Option<Arc<dyn Store>>,
    pub config: GatewayConfig,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        let mut config = GatewayConfig::default();
        config.bootstrap_keys = vec![
            ("admin".to_string(), ADMIN_KEY.to_string()),
            ("test".to_string(), TEST_KEY.to_string()),
        ];
        Self {
            adapters: Vec::new(),
            routes: HashMap::new(),
            store: None,
            config,
        }
    }
}

pub fn route(provider: &str, upstream_model: &str, weight: u32) -> Candidate {
    Candidate {
        provider: provider.to_string(),
        upstream_model: upstream_model.to_string(),
        weight,
    }
}

pub fn harness(options: HarnessOptions) -> Harness {
    let mut builder = ProviderRegistry::builder();
    for adapter in options.adapters {
        builder = builder.register(adapter);
    }
    let registry = Arc::new(builder.build().expect("registry build"));

    let router = Arc::new(Router::with_seed(
        RouteTable::new(options.routes),
        options.config.retry_budget,
        7,
    ));

    let usage = UsageSink::new(options.store.is_some());
    let traces = Arc::new(TraceStore::default());
    let cache: Arc<NullCache> = Arc::new(NullCache);

    let gateway = Arc::new(Gateway::new(
        registry.clone(),
        router,
        usage.clone(),
        traces.clone(),
    ));
    let api_keys = Arc::new(ApiKeyAuthenticator::new(
        options.store.clone(),
        ApiKeyInfoCache::new(cache.clone()),
        &options.config.bootstrap_keys,
    ));
    let aggregator = options
        .store
        .as_ref()
        .map(|s| Arc::new(CostAggregator::new(s.clone(), Arc::new(CostCalculator::new()))));

    let state = AppState {
        gateway,
        registry,
        usage,
        traces,
        store: options.store,
        cache,
        agent_cards: AgentCardCache::new(Arc::new(NullCache)),
        api_keys,
        jwt: Arc::new(JwtAuthenticator::new(JWT_SECRET)),
        aggregator,
        config: Arc::new(options.config),
    };

    Harness {
        app: build_app(state.clone()),
        state,
    }
}

impl Harness {
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.expect("request")
    }

    pub async fn post_json(&self, path: &str, api_key: Option<&str>, body: Value) -> Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }
        self.request(builder.body(Body::from(body.to_string())).expect("request body"))
            .await
    }

    pub async fn get(&self, path: &str, bearer: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder().method("GET").uri(path);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.request(builder.body(Body::empty()).expect("request body"))
            .await
    }
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn body_string(response: Response<Body>) -> String {
    String::from_utf8(body_bytes(response).await).expect("utf8 body")
}

pub fn assert_status(response: &Response<Body>, expected: StatusCode) {
    assert_eq!(response.status(), expected, "unexpected status");
}

/// SSE `data:` payloads from a raw streaming body.
pub fn sse_data_lines(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|s| s.to_string())
        .collect()
}
