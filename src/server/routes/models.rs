//! GET /v1/models

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::server::state::AppState;

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let models = state.gateway.list_models().await;
    Json(json!({
        "object": "list",
        "data": models
            .into_iter()
            .map(|m| {
                json!({
                    "id": m.id,
                    "object": "model",
                    "created": m.created,
                    "owned_by": m.provider,
                })
            })
            .collect::<Vec<_>>(),
    }))
}
