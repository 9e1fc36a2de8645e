//! API key authentication middleware
//!
//! Guards the model-serving surface. The key may arrive as a bearer
//! token, `x-api-key`, `x-goog-api-key` or the `key` query parameter
//! (Gemini SDK compatibility). Errors are rendered in the dialect the
//! path implies so SDK clients can parse them.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::{ApiError, RequestMeta};
use crate::auth::extract_api_key;
use crate::server::state::AppState;
use crate::trace::stage;
use crate::types::Dialect;

/// Which error dialect a path speaks.
pub fn dialect_for_path(path: &str) -> Dialect {
    if path.starts_with("/v1/messages") {
        Dialect::Anthropic
    } else if path.starts_with("/v1beta/") {
        Dialect::Gemini
    } else {
        Dialect::OpenAi
    }
}

/// Pull a single query parameter without dragging in a form parser; API
/// keys are URL-safe by construction.
fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

pub async fn api_key_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let dialect = dialect_for_path(req.uri().path());

    let Some(secret) = extract_api_key(req.headers(), query_param(req.uri().query(), "key"))
    else {
        return ApiError::new(dialect, crate::error::GatewayError::InvalidCredentials)
            .into_response();
    };

    let principal = match state.api_keys.authenticate(&secret).await {
        Ok(principal) => principal,
        Err(err) => return ApiError::new(dialect, err).into_response(),
    };

    if let Some(meta) = req.extensions().get::<RequestMeta>().cloned() {
        state.traces.append(
            &meta.trace_id,
            &meta.request_id,
            stage::AUTH_OK,
            json!({"scheme": "api_key", "actor": principal.actor_id}),
        );
    }

    req.extensions_mut().insert(principal);
    next.run(req).await
}
