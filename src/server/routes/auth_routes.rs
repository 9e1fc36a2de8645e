//! Login / refresh / logout / me

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::jwt::Claims;
use crate::auth::password::verify_password;
use crate::error::GatewayError;
use crate::server::middleware::{ApiError, ApiResult};
use crate::server::state::AppState;
use crate::types::Dialect;

pub const DEFAULT_WORKSPACE_SLUG: &str = "default";

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    /// Workspace slug; omitted means the default workspace.
    pub workspace: Option<String>,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<Value>> {
    let dialect = Dialect::OpenAi;
    // Lookup failures all collapse to invalid_credentials; a login
    // endpoint must not reveal which part was wrong.
    let denied = || ApiError::new(dialect, GatewayError::InvalidCredentials);

    let store = state.store.as_ref().ok_or_else(denied)?;
    let slug = body.workspace.as_deref().unwrap_or(DEFAULT_WORKSPACE_SLUG);
    let workspace = store
        .workspace_by_slug(slug)
        .await
        .map_err(|e| ApiError::new(dialect, e))?
        .ok_or_else(denied)?;
    let user = store
        .user_by_email(&workspace.id, &body.email)
        .await
        .map_err(|e| ApiError::new(dialect, e))?
        .ok_or_else(denied)?;

    if !verify_password(&body.password, &user.password_hash) {
        return Err(denied());
    }

    store
        .touch_last_login(&user.id)
        .await
        .map_err(|e| ApiError::new(dialect, e))?;
    info!(user = %user.id, workspace = %workspace.id, "user logged in");

    let pair = state
        .jwt
        .login_pair(&user.id, &workspace.id)
        .map_err(|e| ApiError::new(dialect, e))?;
    Ok(Json(json!(pair)))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Json<Value>> {
    let pair = state
        .jwt
        .refresh(&body.refresh_token)
        .map_err(|e| ApiError::new(Dialect::OpenAi, e))?;
    Ok(Json(json!(pair)))
}

pub async fn logout() -> Response {
    // Tokens are stateless; logout is a client-side discard. The endpoint
    // exists so SDK logout flows have somewhere to land.
    StatusCode::NO_CONTENT.into_response()
}

pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Value>> {
    let dialect = Dialect::OpenAi;
    let store = state
        .store
        .as_ref()
        .ok_or_else(|| ApiError::new(dialect, GatewayError::unsupported("user storage")))?;
    let user = store
        .user(&claims.sub)
        .await
        .map_err(|e| ApiError::new(dialect, e))?
        .ok_or_else(|| {
            ApiError::new(dialect, GatewayError::InvalidToken("unknown user".into()))
        })?;

    Ok(Json(json!({
        "id": user.id,
        "email": user.email,
        "workspace_id": user.workspace_id,
        "last_login_at": user.last_login_at,
    })))
}
