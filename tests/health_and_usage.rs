//! Health reporting, degraded-mode behavior and the cost pipeline.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use common::{assert_status, body_json, harness, route, HarnessOptions, ADMIN_KEY};
use rad_gateway::error::{GatewayError, GatewayResult};
use rad_gateway::providers::mock::MockAdapter;
use rad_gateway::storage::{
    ApiKeyRecord, ApiKeyStatus, ModelUsageRow, ProviderRecord, ProviderUsageRow, SqliteStore,
    Store, TimeBucket, TimeBucketRow, UsageSummary, User, Workspace, WorkspaceStatus,
};
use rad_gateway::trace::TraceEvent;
use rad_gateway::usage::{ResponseStatus, UsageFilter, UsageRecord};

/// A store whose backend is gone. Only `ping` behavior matters for the
/// health endpoint; everything else fails the same way a dead database
/// would.
struct BrokenStore;

macro_rules! broken {
    () => {
        Err(GatewayError::Storage("connection refused".into()))
    };
}

#[async_trait]
impl Store for BrokenStore {
    fn driver(&self) -> &'static str {
        "postgres"
    }
    async fn ping(&self) -> GatewayResult<()> {
        broken!()
    }
    async fn create_workspace(&self, _: &Workspace) -> GatewayResult<()> {
        broken!()
    }
    async fn workspace(&self, _: &str) -> GatewayResult<Option<Workspace>> {
        broken!()
    }
    async fn workspace_by_slug(&self, _: &str) -> GatewayResult<Option<Workspace>> {
        broken!()
    }
    async fn list_workspaces(&self) -> GatewayResult<Vec<Workspace>> {
        broken!()
    }
    async fn update_workspace_status(&self, _: &str, _: WorkspaceStatus) -> GatewayResult<()> {
        broken!()
    }
    async fn delete_workspace(&self, _: &str) -> GatewayResult<()> {
        broken!()
    }
    async fn create_user(&self, _: &User) -> GatewayResult<()> {
        broken!()
    }
    async fn user(&self, _: &str) -> GatewayResult<Option<User>> {
        broken!()
    }
    async fn user_by_email(&self, _: &str, _: &str) -> GatewayResult<Option<User>> {
        broken!()
    }
    async fn touch_last_login(&self, _: &str) -> GatewayResult<()> {
        broken!()
    }
    async fn insert_api_key(&self, _: &ApiKeyRecord) -> GatewayResult<()> {
        broken!()
    }
    async fn api_key_by_hash(&self, _: &str) -> GatewayResult<Option<ApiKeyRecord>> {
        broken!()
    }
    async fn list_api_keys(&self, _: &str) -> GatewayResult<Vec<ApiKeyRecord>> {
        broken!()
    }
    async fn update_api_key_status(&self, _: &str, _: ApiKeyStatus) -> GatewayResult<()> {
        broken!()
    }
    async fn upsert_provider(&self, _: &ProviderRecord) -> GatewayResult<()> {
        broken!()
    }
    async fn list_providers(&self, _: &str) -> GatewayResult<Vec<ProviderRecord>> {
        broken!()
    }
    async fn update_provider_health(&self, _: &str, _: &Value) -> GatewayResult<()> {
        broken!()
    }
    async fn insert_usage(&self, _: &[UsageRecord]) -> GatewayResult<()> {
        broken!()
    }
    async fn fetch_uncosted(&self, _: u32) -> GatewayResult<Vec<UsageRecord>> {
        broken!()
    }
    async fn fill_costs(&self, _: &[(String, f64)]) -> GatewayResult<usize> {
        broken!()
    }
    async fn query_usage(&self, _: &UsageFilter) -> GatewayResult<Vec<UsageRecord>> {
        broken!()
    }
    async fn usage_summary(&self, _: &UsageFilter) -> GatewayResult<UsageSummary> {
        broken!()
    }
    async fn usage_by_model(&self, _: &UsageFilter) -> GatewayResult<Vec<ModelUsageRow>> {
        broken!()
    }
    async fn usage_by_provider(&self, _: &UsageFilter) -> GatewayResult<Vec<ProviderUsageRow>> {
        broken!()
    }
    async fn usage_timeseries(
        &self,
        _: &UsageFilter,
        _: TimeBucket,
    ) -> GatewayResult<Vec<TimeBucketRow>> {
        broken!()
    }
    async fn insert_trace_events(&self, _: &[TraceEvent]) -> GatewayResult<()> {
        broken!()
    }
    async fn trace_events(&self, _: &str) -> GatewayResult<Vec<TraceEvent>> {
        broken!()
    }
}

#[tokio::test]
async fn health_without_database_reports_not_configured() {
    let harness = harness(HarnessOptions::default());
    let response = harness.get("/health", None).await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "not_configured");
}

#[tokio::test]
async fn health_with_working_database_reports_ok() {
    let mut options = HarnessOptions::default();
    options.store = Some(Arc::new(SqliteStore::open_in_memory().unwrap()));
    let harness = harness(options);

    let response = harness.get("/health", None).await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["database"], "ok");
    assert_eq!(body["driver"], "sqlite");
}

/// Database down means 503 + degraded, but `status` stays
/// "ok" and chat keeps working with usage captured in the ring.
#[tokio::test]
async fn degraded_database_keeps_gateway_operational() {
    let mut options = HarnessOptions::default();
    options.store = Some(Arc::new(BrokenStore));
    options.adapters.push(Arc::new(MockAdapter::new()));
    options
        .routes
        .insert("gpt-4o".into(), vec![route("mock", "mock-model", 1)]);
    let harness = harness(options);

    let response = harness.get("/health", None).await;
    assert_status(&response, StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "degraded");

    // A chat request still succeeds; the record lands in the ring even
    // though the durable layer is dead.
    let response = harness
        .post_json(
            "/v1/chat/completions",
            Some(ADMIN_KEY),
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_status(&response, StatusCode::OK);
    let records = harness.state.usage.query(&UsageFilter::default());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].response_status, ResponseStatus::Success);
}

/// The cost worker fills NULL costs once; a second pass
/// is a no-op.
#[tokio::test]
async fn cost_worker_fills_persisted_usage() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());

    let mut options = HarnessOptions::default();
    options.store = Some(store.clone());
    options.adapters.push(Arc::new(MockAdapter::new()));
    options
        .routes
        .insert("gpt-4o".into(), vec![route("mock", "gpt-4o", 1)]);
    let harness = harness(options);

    // Default workspace for the foreign key; the bootstrap keys live in
    // process memory, so the chat path does not need it, but usage rows do.
    store
        .create_workspace(&Workspace {
            id: "ws-bootstrap".into(),
            slug: "default".into(),
            status: WorkspaceStatus::Active,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    // Serve three requests, then flush the sink to the store.
    for _ in 0..3 {
        let response = harness
            .post_json(
                "/v1/chat/completions",
                Some(ADMIN_KEY),
                json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
            )
            .await;
        assert_status(&response, StatusCode::OK);
    }

    let cancel = CancellationToken::new();
    let writer = harness.state.usage.spawn_writer(
        store.clone(),
        50,
        Duration::from_millis(20),
        cancel.clone(),
    );
    tokio::time::sleep(Duration::from_millis(120)).await;
    cancel.cancel();
    writer.await.unwrap();

    let uncosted = store.fetch_uncosted(10).await.unwrap();
    assert_eq!(uncosted.len(), 3);

    let aggregator = harness.state.aggregator.as_ref().unwrap();
    assert_eq!(aggregator.process_batch(50).await.unwrap(), 3);

    // Every row equals what the calculator says for its tokens.
    let calculator = rad_gateway::cost::CostCalculator::new();
    let rows = store.query_usage(&UsageFilter::default()).await.unwrap();
    for row in &rows {
        let expected = calculator
            .calculate(&row.selected_model, row.prompt_tokens, row.completion_tokens)
            .total_cost;
        assert_eq!(row.cost_usd, Some(expected));
    }

    // Idempotent: nothing left to fill.
    assert_eq!(aggregator.process_batch(50).await.unwrap(), 0);
}
