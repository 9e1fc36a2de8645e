//! POST /v1/embeddings (OpenAI dialect)

use axum::extract::State;
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;
use serde_json::{json, Value};

use super::build_context;
use crate::auth::Principal;
use crate::error::GatewayError;
use crate::server::middleware::{ApiError, ApiResult, RequestMeta};
use crate::server::state::AppState;
use crate::types::{Dialect, EmbeddingsRequest};

#[derive(Debug, Deserialize)]
struct WireEmbeddingsRequest {
    #[serde(default)]
    model: String,
    input: WireInput,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireInput {
    Single(String),
    Multiple(Vec<String>),
}

pub async fn embeddings(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let dialect = Dialect::OpenAi;
    let wire: WireEmbeddingsRequest = serde_json::from_value(body).map_err(|e| {
        ApiError::new(
            dialect,
            GatewayError::InvalidRequest(format!("malformed request body: {}", e)),
        )
    })?;
    if wire.model.is_empty() {
        return Err(ApiError::new(
            dialect,
            GatewayError::InvalidRequest("model is required".into()),
        ));
    }
    let input = match wire.input {
        WireInput::Single(text) => vec![text],
        WireInput::Multiple(texts) => texts,
    };
    if input.is_empty() {
        return Err(ApiError::new(
            dialect,
            GatewayError::InvalidRequest("input cannot be empty".into()),
        ));
    }

    let ctx = build_context(&state, &meta, principal, dialect);
    let response = state
        .gateway
        .embeddings(
            &ctx,
            EmbeddingsRequest {
                model: wire.model,
                input,
            },
        )
        .await
        .map_err(|e| ApiError::new(dialect, e))?;

    Ok(Json(json!({
        "object": "list",
        "model": response.model,
        "data": response
            .embeddings
            .iter()
            .enumerate()
            .map(|(index, embedding)| {
                json!({"object": "embedding", "index": index, "embedding": embedding})
            })
            .collect::<Vec<_>>(),
        "usage": {
            "prompt_tokens": response.usage.prompt_tokens,
            "total_tokens": response.usage.prompt_tokens,
        },
    })))
}
