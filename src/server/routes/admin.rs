//! /v0/admin/** handlers: workspace, API key and user administration (JWT-guarded)

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::auth::hash_key;
use crate::auth::password::hash_password;
use crate::error::GatewayError;
use crate::server::middleware::{ApiError, ApiResult};
use crate::server::state::AppState;
use crate::storage::{ApiKeyRecord, ApiKeyStatus, Store, User, Workspace, WorkspaceStatus};
use crate::types::Dialect;

fn require_store(state: &AppState) -> ApiResult<&dyn Store> {
    state.store.as_deref().ok_or_else(|| {
        ApiError::new(
            Dialect::OpenAi,
            GatewayError::unsupported("administration without a database"),
        )
    })
}

fn storage_err(e: GatewayError) -> ApiError {
    ApiError::new(Dialect::OpenAi, e)
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub slug: String,
}

pub async fn create_workspace(
    State(state): State<AppState>,
    Json(body): Json<CreateWorkspaceRequest>,
) -> ApiResult<Json<Value>> {
    if body.slug.is_empty() {
        return Err(ApiError::new(
            Dialect::OpenAi,
            GatewayError::InvalidRequest("slug is required".into()),
        ));
    }
    let store = require_store(&state)?;
    let workspace = Workspace {
        id: Uuid::new_v4().to_string(),
        slug: body.slug,
        status: WorkspaceStatus::Active,
        created_at: Utc::now(),
    };
    store.create_workspace(&workspace).await.map_err(storage_err)?;
    info!(workspace = %workspace.id, slug = %workspace.slug, "workspace created");
    Ok(Json(json!(workspace)))
}

pub async fn list_workspaces(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let store = require_store(&state)?;
    let workspaces = store.list_workspaces().await.map_err(storage_err)?;
    Ok(Json(json!(workspaces)))
}

pub async fn delete_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let store = require_store(&state)?;
    store.delete_workspace(&id).await.map_err(storage_err)?;
    info!(workspace = %id, "workspace deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub workspace_id: String,
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub allowed_models: Option<Vec<String>>,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Json(body): Json<CreateApiKeyRequest>,
) -> ApiResult<Json<Value>> {
    let store = require_store(&state)?;

    // The plaintext secret is returned exactly once; only its hash is
    // stored.
    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    let secret = format!("rad_{}", hex::encode(raw));

    let record = ApiKeyRecord {
        id: Uuid::new_v4().to_string(),
        workspace_id: body.workspace_id,
        name: body.name,
        key_hash: hash_key(&secret),
        status: ApiKeyStatus::Active,
        expires_at: body.expires_at,
        allowed_models: body.allowed_models,
        created_at: Utc::now(),
    };
    store.insert_api_key(&record).await.map_err(storage_err)?;
    info!(key = %record.id, workspace = %record.workspace_id, "api key created");

    Ok(Json(json!({"key": secret, "record": record})))
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let store = require_store(&state)?;
    let workspace_id = params.get("workspace_id").ok_or_else(|| {
        ApiError::new(
            Dialect::OpenAi,
            GatewayError::InvalidRequest("workspace_id is required".into()),
        )
    })?;
    let keys = store.list_api_keys(workspace_id).await.map_err(storage_err)?;
    Ok(Json(json!(keys)))
}

#[derive(Debug, Deserialize)]
pub struct RevokeApiKeyRequest {
    pub workspace_id: String,
    pub id: String,
}

pub async fn revoke_api_key(
    State(state): State<AppState>,
    Json(body): Json<RevokeApiKeyRequest>,
) -> ApiResult<Json<Value>> {
    let store = require_store(&state)?;
    let keys = store
        .list_api_keys(&body.workspace_id)
        .await
        .map_err(storage_err)?;
    let key = keys.into_iter().find(|k| k.id == body.id).ok_or_else(|| {
        ApiError::new(
            Dialect::OpenAi,
            GatewayError::InvalidRequest(format!("unknown api key '{}'", body.id)),
        )
    })?;

    store
        .update_api_key_status(&key.id, ApiKeyStatus::Revoked)
        .await
        .map_err(storage_err)?;
    // Without invalidation a revoked key keeps working until cache TTL.
    state.api_keys.invalidate(&key.key_hash).await;
    info!(key = %key.id, "api key revoked");
    Ok(Json(json!({"status": "revoked", "id": key.id})))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub workspace_id: String,
    pub email: String,
    pub password: String,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> ApiResult<Json<Value>> {
    if body.email.is_empty() || body.password.is_empty() {
        return Err(ApiError::new(
            Dialect::OpenAi,
            GatewayError::InvalidRequest("email and password are required".into()),
        ));
    }
    let store = require_store(&state)?;
    let user = User {
        id: Uuid::new_v4().to_string(),
        workspace_id: body.workspace_id,
        email: body.email,
        password_hash: hash_password(&body.password)
            .map_err(|e| ApiError::new(Dialect::OpenAi, e))?,
        last_login_at: None,
    };
    store.create_user(&user).await.map_err(storage_err)?;
    info!(user = %user.id, workspace = %user.workspace_id, "user created");
    Ok(Json(json!({
        "id": user.id,
        "email": user.email,
        "workspace_id": user.workspace_id,
    })))
}
