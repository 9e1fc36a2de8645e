//! HTTP route handlers

pub mod admin;
pub mod agent;
pub mod audio;
pub mod auth_routes;
pub mod chat;
pub mod embeddings;
pub mod gemini;
pub mod health;
pub mod images;
pub mod management;
pub mod messages;
pub mod models;

use std::convert::Infallible;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue};
use axum::response::Response;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::auth::Principal;
use crate::dialect::ChunkEncoder;
use crate::gateway::{ChatStreamOutcome, RequestContext};
use crate::server::middleware::RequestMeta;
use crate::server::state::AppState;
use crate::types::Dialect;

pub use admin::*;
pub use agent::*;
pub use audio::*;
pub use auth_routes::*;
pub use chat::*;
pub use embeddings::*;
pub use gemini::*;
pub use health::*;
pub use images::*;
pub use management::*;
pub use messages::*;
pub use models::*;

/// Assemble the request context handlers hand to the gateway.
pub(crate) fn build_context(
    state: &AppState,
    meta: &RequestMeta,
    principal: Principal,
    dialect: Dialect,
) -> RequestContext {
    RequestContext {
        request_id: meta.request_id.clone(),
        trace_id: meta.trace_id.clone(),
        principal,
        dialect,
        started: Instant::now(),
        deadline: state.config.timeouts.write,
        cancel: CancellationToken::new(),
    }
}

/// Turn a gateway chunk stream into a wire response using the dialect's
/// encoder. The encoder decides the framing and content type.
pub(crate) fn stream_response(
    outcome: ChatStreamOutcome,
    mut encoder: Box<dyn ChunkEncoder>,
) -> Response {
    let content_type = encoder.content_type();
    let body_stream = async_stream::stream! {
        let mut chunks = outcome.chunks;
        while let Some(chunk) = chunks.next().await {
            for frame in encoder.encode(&chunk) {
                yield Ok::<Bytes, Infallible>(Bytes::from(frame));
            }
        }
        for frame in encoder.finish() {
            yield Ok(Bytes::from(frame));
        }
    };

    let mut response = Response::new(Body::from_stream(body_stream));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}
