//! JWT auth flow plus the admin and management surfaces.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use common::{assert_status, body_json, harness, route, Harness, HarnessOptions, ADMIN_KEY};
use rad_gateway::auth::password::hash_password;
use rad_gateway::providers::mock::MockAdapter;
use rad_gateway::storage::{SqliteStore, Store, User, Workspace, WorkspaceStatus};

async fn harness_with_user() -> (Harness, Arc<dyn Store>) {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    store
        .create_workspace(&Workspace {
            id: "ws-default".into(),
            slug: "default".into(),
            status: WorkspaceStatus::Active,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    store
        .create_user(&User {
            id: Uuid::new_v4().to_string(),
            workspace_id: "ws-default".into(),
            email: "ops@example.com".into(),
            password_hash: hash_password("correct horse").unwrap(),
            last_login_at: None,
        })
        .await
        .unwrap();

    let mut options = HarnessOptions::default();
    options.store = Some(store.clone());
    options.adapters.push(Arc::new(MockAdapter::new()));
    options
        .routes
        .insert("gpt-4o".into(), vec![route("mock", "mock-model", 1)]);
    (harness(options), store)
}

async fn login(harness: &Harness) -> (String, String) {
    let response = harness
        .post_json(
            "/v1/auth/login",
            None,
            json!({"email": "ops@example.com", "password": "correct horse"}),
        )
        .await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    (
        body["access_token"].as_str().unwrap().to_string(),
        body["refresh_token"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn login_refresh_and_me() {
    let (harness, _store) = harness_with_user().await;
    let (access, refresh) = login(&harness).await;

    let response = harness.get("/v1/auth/me", Some(&access)).await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["email"], "ops@example.com");
    assert_eq!(body["workspace_id"], "ws-default");

    let response = harness
        .post_json("/v1/auth/refresh", None, json!({"refresh_token": refresh}))
        .await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["access_token"].as_str().is_some());
}

#[tokio::test]
async fn login_with_wrong_password_is_401() {
    let (harness, _store) = harness_with_user().await;
    let response = harness
        .post_json(
            "/v1/auth/login",
            None,
            json!({"email": "ops@example.com", "password": "wrong"}),
        )
        .await;
    assert_status(&response, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn management_requires_jwt_not_api_key() {
    let (harness, _store) = harness_with_user().await;

    let response = harness.get("/v0/management/usage", None).await;
    assert_status(&response, StatusCode::UNAUTHORIZED);

    // An API key is not a JWT.
    let response = harness.get("/v0/management/usage", Some(ADMIN_KEY)).await;
    assert_status(&response, StatusCode::UNAUTHORIZED);

    let (access, _) = login(&harness).await;
    let response = harness.get("/v0/management/usage", Some(&access)).await;
    assert_status(&response, StatusCode::OK);
}

#[tokio::test]
async fn admin_api_key_lifecycle() {
    let (harness, _store) = harness_with_user().await;
    let (access, _) = login(&harness).await;

    // Create a key in the default workspace.
    let response = harness
        .post_json(
            "/v0/admin/api-keys",
            Some(&access),
            json!({"workspace_id": "ws-default", "name": "ci-key"}),
        )
        .await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    let secret = body["key"].as_str().unwrap().to_string();
    let key_id = body["record"]["id"].as_str().unwrap().to_string();
    assert!(secret.starts_with("rad_"));

    // The fresh key serves traffic.
    let response = harness
        .post_json(
            "/v1/chat/completions",
            Some(&secret),
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_status(&response, StatusCode::OK);

    // Revoke and verify it stops authenticating.
    let response = harness
        .post_json(
            "/v0/admin/api-keys/revoke",
            Some(&access),
            json!({"workspace_id": "ws-default", "id": key_id}),
        )
        .await;
    assert_status(&response, StatusCode::OK);

    let response = harness
        .post_json(
            "/v1/chat/completions",
            Some(&secret),
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_status(&response, StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "credentials_revoked");
}

#[tokio::test]
async fn management_usage_and_traces_after_traffic() {
    let (harness, _store) = harness_with_user().await;
    let (access, _) = login(&harness).await;

    let response = harness
        .post_json(
            "/v1/chat/completions",
            Some(ADMIN_KEY),
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;
    assert_status(&response, StatusCode::OK);
    let trace_id = response.headers()["x-trace-id"].to_str().unwrap().to_string();

    let response = harness.get("/v0/management/usage?limit=10", Some(&access)).await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["records"][0]["incoming_model"], "gpt-4o");

    let response = harness
        .get(&format!("/v0/management/traces/{}", trace_id), Some(&access))
        .await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    let stages: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["stage"].as_str().unwrap())
        .collect();
    assert!(stages.contains(&"auth.ok"));
    assert!(stages.contains(&"attempt.start"));
    assert!(stages.contains(&"attempt.end"));
    assert!(stages.contains(&"finalize"));
}

#[tokio::test]
async fn workspace_admin_round_trip() {
    let (harness, _store) = harness_with_user().await;
    let (access, _) = login(&harness).await;

    let response = harness
        .post_json("/v0/admin/workspaces", Some(&access), json!({"slug": "acme"}))
        .await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    let workspace_id = body["id"].as_str().unwrap().to_string();

    let response = harness.get("/v0/admin/workspaces", Some(&access)).await;
    let body = body_json(response).await;
    let slugs: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["slug"].as_str().unwrap())
        .collect();
    assert!(slugs.contains(&"acme"));
    assert!(slugs.contains(&"default"));

    let request = axum::http::Request::builder()
        .method("DELETE")
        .uri(format!("/v0/admin/workspaces/{}", workspace_id))
        .header("authorization", format!("Bearer {}", access))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = harness.request(request).await;
    assert_status(&response, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn agent_card_is_public() {
    let (harness, _store) = harness_with_user().await;
    let response = harness.get("/.well-known/agent.json", None).await;
    assert_status(&response, StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["name"], "RAD Gateway");
    assert_eq!(body["capabilities"]["streaming"], true);
}

#[tokio::test]
async fn a2a_and_mcp_mounts_answer_501_behind_auth() {
    let (harness, _store) = harness_with_user().await;

    // Unauthenticated: the auth wall comes first.
    let response = harness.post_json("/a2a/tasks", None, json!({})).await;
    assert_status(&response, StatusCode::UNAUTHORIZED);

    let response = harness.post_json("/mcp/session", Some(ADMIN_KEY), json!({})).await;
    assert_status(&response, StatusCode::NOT_IMPLEMENTED);
}
