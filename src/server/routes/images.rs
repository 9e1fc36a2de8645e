//! POST /v1/images/generations (OpenAI dialect)

use axum::extract::State;
use axum::response::Json;
use axum::Extension;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::build_context;
use crate::auth::Principal;
use crate::error::GatewayError;
use crate::server::middleware::{ApiError, ApiResult, RequestMeta};
use crate::server::state::AppState;
use crate::types::{Dialect, ImageRequest};

#[derive(Debug, Deserialize)]
struct WireImageRequest {
    model: Option<String>,
    #[serde(default)]
    prompt: String,
    n: Option<u32>,
    size: Option<String>,
}

pub async fn images(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let dialect = Dialect::OpenAi;
    let wire: WireImageRequest = serde_json::from_value(body).map_err(|e| {
        ApiError::new(
            dialect,
            GatewayError::InvalidRequest(format!("malformed request body: {}", e)),
        )
    })?;
    if wire.prompt.is_empty() {
        return Err(ApiError::new(
            dialect,
            GatewayError::InvalidRequest("prompt is required".into()),
        ));
    }

    let ctx = build_context(&state, &meta, principal, dialect);
    let response = state
        .gateway
        .generate_image(
            &ctx,
            ImageRequest {
                model: wire.model,
                prompt: wire.prompt,
                n: wire.n.unwrap_or(1),
                size: wire.size,
            },
        )
        .await
        .map_err(|e| ApiError::new(dialect, e))?;

    Ok(Json(json!({
        "created": Utc::now().timestamp(),
        "data": response.images,
    })))
}
