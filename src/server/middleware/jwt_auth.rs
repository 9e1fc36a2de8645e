//! JWT authentication middleware for the admin/management surface.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use super::{ApiError, RequestMeta};
use crate::auth::jwt::TokenType;
use crate::error::GatewayError;
use crate::server::state::AppState;
use crate::trace::stage;
use crate::types::Dialect;

pub async fn jwt_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return ApiError::new(
            Dialect::OpenAi,
            GatewayError::InvalidToken("missing bearer token".into()),
        )
        .into_response();
    };

    let claims = match state.jwt.verify(token, TokenType::Access) {
        Ok(claims) => claims,
        Err(err) => return ApiError::new(Dialect::OpenAi, err).into_response(),
    };

    let principal = claims.principal();
    if let Some(meta) = req.extensions().get::<RequestMeta>().cloned() {
        state.traces.append(
            &meta.trace_id,
            &meta.request_id,
            stage::AUTH_OK,
            json!({"scheme": "jwt", "actor": principal.actor_id}),
        );
    }

    req.extensions_mut().insert(principal);
    req.extensions_mut().insert(claims);
    next.run(req).await
}
