//! POST /v1beta/models/{model}:{generateContent|streamGenerateContent}
//!
//! The model name and the action share one path segment, so the handler
//! splits them itself. Streaming framing follows the `alt` parameter:
//! SSE with `alt=sse`, otherwise the incrementally streamed JSON array.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use serde_json::Value;

use super::{build_context, stream_response};
use crate::auth::Principal;
use crate::dialect;
use crate::dialect::gemini::GeminiChunkEncoder;
use crate::error::GatewayError;
use crate::server::middleware::{ApiError, ApiResult, RequestMeta};
use crate::server::state::AppState;
use crate::types::Dialect;

pub async fn gemini_generate(
    State(state): State<AppState>,
    Path(model_call): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Extension(meta): Extension<RequestMeta>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let dialect = Dialect::Gemini;

    let (model, action) = model_call.split_once(':').ok_or_else(|| {
        ApiError::new(
            dialect,
            GatewayError::InvalidRequest(format!(
                "expected models/{{model}}:generateContent, got '{}'",
                model_call
            )),
        )
    })?;
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(ApiError::new(
                dialect,
                GatewayError::InvalidRequest(format!("unknown action '{}'", other)),
            ));
        }
    };

    let request = dialect::gemini::parse_request(model, stream, body)
        .map_err(|e| ApiError::new(dialect, e))?;
    let ctx = build_context(&state, &meta, principal, dialect);

    if stream {
        let sse = params.get("alt").map(|v| v == "sse").unwrap_or(false);
        let model = request.model.clone();
        let outcome = state
            .gateway
            .chat_stream(&ctx, request)
            .await
            .map_err(|e| ApiError::new(dialect, e))?;
        let encoder = if sse {
            Box::new(GeminiChunkEncoder::sse(&model))
        } else {
            Box::new(GeminiChunkEncoder::json_array(&model))
        };
        Ok(stream_response(outcome, encoder))
    } else {
        let response = state
            .gateway
            .chat(&ctx, request)
            .await
            .map_err(|e| ApiError::new(dialect, e))?;
        Ok(Json(dialect::gemini::encode_response(&response)).into_response())
    }
}
