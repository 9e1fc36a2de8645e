//! /v0/management/** handlers: usage, cost and trace queries (JWT-guarded)

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::server::middleware::{ApiError, ApiResult};
use crate::server::state::AppState;
use crate::storage::TimeBucket;
use crate::types::Dialect;
use crate::usage::UsageFilter;

fn parse_filter(params: &HashMap<String, String>) -> ApiResult<UsageFilter> {
    let parse_time = |name: &str| -> ApiResult<Option<DateTime<Utc>>> {
        match params.get(name) {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| {
                    ApiError::new(
                        Dialect::OpenAi,
                        GatewayError::InvalidRequest(format!("invalid {} '{}': {}", name, raw, e)),
                    )
                }),
        }
    };

    Ok(UsageFilter {
        workspace_id: params.get("workspace_id").cloned(),
        api_key_id: params.get("api_key_id").cloned(),
        provider: params.get("provider").cloned(),
        model: params.get("model").cloned(),
        since: parse_time("since")?,
        until: parse_time("until")?,
        limit: params.get("limit").and_then(|l| l.parse().ok()),
    })
}

fn require_aggregator(state: &AppState) -> ApiResult<&crate::cost::CostAggregator> {
    state
        .aggregator
        .as_deref()
        .ok_or_else(|| {
            ApiError::new(
                Dialect::OpenAi,
                GatewayError::unsupported("cost aggregation without a database"),
            )
        })
}

/// Recent usage from the in-memory ring; instant regardless of store
/// health.
pub async fn usage(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let filter = parse_filter(&params)?;
    let records = state.usage.query(&filter);
    Ok(Json(json!({
        "count": records.len(),
        "dropped": state.usage.dropped(),
        "records": records,
    })))
}

pub async fn usage_summary(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let filter = parse_filter(&params)?;
    let summary = require_aggregator(&state)?
        .summary(&filter)
        .await
        .map_err(|e| ApiError::new(Dialect::OpenAi, e))?;
    Ok(Json(json!(summary)))
}

pub async fn costs_by_model(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let filter = parse_filter(&params)?;
    let rows = require_aggregator(&state)?
        .by_model(&filter)
        .await
        .map_err(|e| ApiError::new(Dialect::OpenAi, e))?;
    Ok(Json(json!(rows)))
}

pub async fn costs_by_provider(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let filter = parse_filter(&params)?;
    let rows = require_aggregator(&state)?
        .by_provider(&filter)
        .await
        .map_err(|e| ApiError::new(Dialect::OpenAi, e))?;
    Ok(Json(json!(rows)))
}

pub async fn costs_timeseries(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let filter = parse_filter(&params)?;
    let bucket = params
        .get("bucket")
        .map(|b| {
            TimeBucket::parse(b).ok_or_else(|| {
                ApiError::new(
                    Dialect::OpenAi,
                    GatewayError::InvalidRequest(format!(
                        "invalid bucket '{}' (hourly|daily|weekly|monthly)",
                        b
                    )),
                )
            })
        })
        .transpose()?
        .unwrap_or(TimeBucket::Daily);
    let rows = require_aggregator(&state)?
        .timeseries(&filter, bucket)
        .await
        .map_err(|e| ApiError::new(Dialect::OpenAi, e))?;
    Ok(Json(json!(rows)))
}

/// Trace events for one trace id, from the in-memory ring.
pub async fn trace(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let events = state.traces.get(&trace_id);
    if events.is_empty() {
        return Err(ApiError::new(
            Dialect::OpenAi,
            GatewayError::InvalidRequest(format!("no events for trace '{}'", trace_id)),
        ));
    }
    Ok(Json(json!({"trace_id": trace_id, "events": events})))
}

pub async fn providers_health(State(state): State<AppState>) -> Json<Value> {
    let health: HashMap<String, Value> = state
        .registry
        .names()
        .into_iter()
        .map(|name| {
            let snapshot = state
                .registry
                .health_snapshot(&name)
                .map(|h| json!(h))
                .unwrap_or(Value::Null);
            (name, snapshot)
        })
        .collect();
    Json(json!(health))
}
