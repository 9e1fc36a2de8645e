//! GET /health
//!
//! The gateway stays operational without persistence: a failing database
//! ping reports `degraded` with a 503 so load balancers can shed, but
//! `status` stays "ok" because request serving still works.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tracing::warn;

use crate::server::state::AppState;

const DB_PING_BUDGET: Duration = Duration::from_secs(2);

pub async fn health(State(state): State<AppState>) -> Response {
    let (status, database, driver) = match &state.store {
        None => (StatusCode::OK, "not_configured", ""),
        Some(store) => {
            match tokio::time::timeout(DB_PING_BUDGET, store.ping()).await {
                Ok(Ok(())) => (StatusCode::OK, "ok", store.driver()),
                Ok(Err(e)) => {
                    warn!(error = %e, "health: database ping failed");
                    (StatusCode::SERVICE_UNAVAILABLE, "degraded", store.driver())
                }
                Err(_) => {
                    warn!("health: database ping exceeded {:?}", DB_PING_BUDGET);
                    (StatusCode::SERVICE_UNAVAILABLE, "degraded", store.driver())
                }
            }
        }
    };

    (
        status,
        Json(json!({
            "status": "ok",
            "database": database,
            "driver": driver,
        })),
    )
        .into_response()
}
