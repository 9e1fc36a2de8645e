//! POST /v1/chat/completions (OpenAI dialect)

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use serde_json::Value;

use super::{build_context, stream_response};
use crate::auth::Principal;
use crate::dialect;
use crate::server::middleware::{ApiError, ApiResult, RequestMeta};
use crate::server::state::AppState;
use crate::types::Dialect;

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    let dialect = Dialect::OpenAi;
    let request =
        dialect::openai::parse_request(body).map_err(|e| ApiError::new(dialect, e))?;
    let ctx = build_context(&state, &meta, principal, dialect);

    if request.stream {
        let model = request.model.clone();
        let outcome = state
            .gateway
            .chat_stream(&ctx, request)
            .await
            .map_err(|e| ApiError::new(dialect, e))?;
        let encoder = dialect::encoder_for(dialect, &outcome.id, &model);
        Ok(stream_response(outcome, encoder))
    } else {
        let response = state
            .gateway
            .chat(&ctx, request)
            .await
            .map_err(|e| ApiError::new(dialect, e))?;
        Ok(Json(dialect::openai::encode_response(&response)).into_response())
    }
}
