//! HTTP front-door
//!
//! Three logical handler trees share one axum app: public (health, agent
//! discovery, login/refresh), API-key-guarded model serving (`/v1`,
//! `/v1beta`, `/a2a`, `/mcp`) and JWT-guarded admin/management (`/v0`).
//! Every request passes the context middleware that assigns correlation
//! ids and stamps security headers.

pub mod middleware;
pub mod routes;
pub mod state;

use std::time::Duration;

use axum::http::{HeaderValue, Method};
use axum::middleware as axum_middleware;
use axum::routing::{any, delete, get, post};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub use state::AppState;

/// Multipart audio uploads are the largest legitimate bodies.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

pub fn build_app(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(routes::health))
        .route("/.well-known/agent.json", get(routes::agent_card))
        .route("/v1/auth/login", post(routes::login))
        .route("/v1/auth/refresh", post(routes::refresh))
        .route("/v1/auth/logout", post(routes::logout))
        .layer(TimeoutLayer::new(state.config.timeouts.read));

    let api = Router::new()
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/v1/messages", post(routes::messages))
        .route("/v1/embeddings", post(routes::embeddings))
        .route("/v1/images/generations", post(routes::images))
        .route("/v1/audio/transcriptions", post(routes::transcriptions))
        .route("/v1/models", get(routes::list_models))
        .route("/v1beta/models/{model_call}", post(routes::gemini_generate))
        .route("/a2a/{*rest}", any(routes::agent_stub))
        .route("/mcp/{*rest}", any(routes::agent_stub))
        // Bounds the handler future only; streaming response bodies keep
        // flowing past it.
        .layer(TimeoutLayer::new(state.config.timeouts.read))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::api_key_auth,
        ));

    let admin = Router::new()
        .route("/v1/auth/me", get(routes::me))
        .route(
            "/v0/admin/workspaces",
            post(routes::create_workspace).get(routes::list_workspaces),
        )
        .route("/v0/admin/workspaces/{id}", delete(routes::delete_workspace))
        .route(
            "/v0/admin/api-keys",
            post(routes::create_api_key).get(routes::list_api_keys),
        )
        .route("/v0/admin/api-keys/revoke", post(routes::revoke_api_key))
        .route("/v0/admin/users", post(routes::create_user))
        .route("/v0/management/usage", get(routes::usage))
        .route("/v0/management/usage/summary", get(routes::usage_summary))
        .route("/v0/management/costs/by-model", get(routes::costs_by_model))
        .route(
            "/v0/management/costs/by-provider",
            get(routes::costs_by_provider),
        )
        .route(
            "/v0/management/costs/timeseries",
            get(routes::costs_timeseries),
        )
        .route("/v0/management/traces/{trace_id}", get(routes::trace))
        .route(
            "/v0/management/providers/health",
            get(routes::providers_health),
        )
        .layer(TimeoutLayer::new(state.config.timeouts.read))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::jwt_auth,
        ));

    Router::new()
        .merge(public)
        .merge(api)
        .merge(admin)
        .layer(axum_middleware::from_fn(middleware::request_context))
        .layer(cors_layer(&state))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = &state.config.cors_origins;
    if origins.is_empty() {
        // Dev default. Production profiles set RAD_CORS_ORIGINS.
        CorsLayer::new()
            .allow_origin(AnyOrigin)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(AnyOrigin)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "ignoring unparseable CORS origin");
                    None
                }
            })
            .collect();
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers(AnyOrigin)
    }
}

/// How long shutdown waits for in-flight connections to drain.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Bind and serve until the shutdown future resolves.
///
/// Connections are served through a hyper connection builder so the
/// connection-level budgets the tower layers cannot see are enforced:
/// `read_header` bounds the http1 header wait (including the gap between
/// keep-alive requests), `idle` drives the http2 keep-alive probes.
pub async fn serve(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = state.config.listen_addr;
    let timeouts = state.config.timeouts;
    let app = build_app(state);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {}: {}", addr, e))?;
    info!(addr = %addr, "gateway listening");

    let mut builder = ConnectionBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read_header);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(timeouts.idle / 2)
        .keep_alive_timeout(timeouts.idle);

    let graceful = GracefulShutdown::new();
    let mut shutdown = std::pin::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let service = TowerToHyperService::new(app.clone());
                let connection = builder.serve_connection_with_upgrades(io, service);
                let connection = graceful.watch(connection.into_owned());
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(error = %e, "connection closed with error");
                    }
                });
            }
        }
    }

    drop(listener);
    tokio::select! {
        _ = graceful.shutdown() => info!("gateway stopped"),
        _ = tokio::time::sleep(SHUTDOWN_DRAIN) => {
            warn!("shutdown drain timed out with connections still open");
        }
    }
    Ok(())
}
