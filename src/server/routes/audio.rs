//! POST /v1/audio/transcriptions (OpenAI dialect, multipart)

use axum::extract::{Multipart, State};
use axum::response::Json;
use axum::Extension;
use serde_json::{json, Value};

use super::build_context;
use crate::auth::Principal;
use crate::error::GatewayError;
use crate::server::middleware::{ApiError, ApiResult, RequestMeta};
use crate::server::state::AppState;
use crate::types::{Dialect, TranscriptionRequest};

pub async fn transcriptions(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Extension(principal): Extension<Principal>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let dialect = Dialect::OpenAi;
    let invalid = |message: String| ApiError::new(dialect, GatewayError::InvalidRequest(message));

    let mut audio: Option<(String, Vec<u8>)> = None;
    let mut model: Option<String> = None;
    let mut language: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("audio").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| invalid(format!("failed to read file field: {}", e)))?;
                audio = Some((file_name, bytes.to_vec()));
            }
            "model" => {
                model = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| invalid(format!("failed to read model field: {}", e)))?,
                );
            }
            "language" => {
                language = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| invalid(format!("failed to read language field: {}", e)))?,
                );
            }
            _ => {}
        }
    }

    let (file_name, audio) = audio.ok_or_else(|| invalid("file field is required".into()))?;
    let model = model.ok_or_else(|| invalid("model field is required".into()))?;

    let ctx = build_context(&state, &meta, principal, dialect);
    let response = state
        .gateway
        .transcribe(
            &ctx,
            TranscriptionRequest {
                model,
                file_name,
                audio,
                language,
            },
        )
        .await
        .map_err(|e| ApiError::new(dialect, e))?;

    Ok(Json(json!({"text": response.text})))
}
