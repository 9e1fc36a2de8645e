//! Agent discovery surface
//!
//! `/.well-known/agent.json` serves the A2A agent card; the `/a2a` and
//! `/mcp` mounts share auth and storage with the core but their
//! protocols live outside it, so they answer 501 here.

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::error::GatewayError;
use crate::server::middleware::ApiError;
use crate::server::state::AppState;
use crate::types::Dialect;

const CARD_ID: &str = "rad-gateway";

pub async fn agent_card(State(state): State<AppState>) -> Response {
    if let Some(card) = state.agent_cards.get_by_id(CARD_ID).await {
        return Json(card).into_response();
    }

    let card = json!({
        "name": "RAD Gateway",
        "description": "Multi-tenant AI API gateway",
        "url": state.config.public_base_url,
        "version": env!("CARGO_PKG_VERSION"),
        "capabilities": {
            "streaming": true,
            "pushNotifications": false,
        },
        "defaultInputModes": ["text"],
        "defaultOutputModes": ["text"],
        "skills": [],
    });
    state
        .agent_cards
        .put(CARD_ID, "RAD Gateway", &[], &card)
        .await;
    Json(card).into_response()
}

pub async fn agent_stub() -> Response {
    ApiError::new(
        Dialect::OpenAi,
        GatewayError::unsupported("agent protocol endpoints"),
    )
    .into_response()
}
