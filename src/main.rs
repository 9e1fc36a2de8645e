//! rad-gateway binary
//!
//! Boots the full pipeline from environment configuration: store (with
//! fallback), cache (with null fallback), provider registry, route
//! table, background workers, then the HTTP front-door. Exits non-zero
//! on bind or configuration failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use rad_gateway::auth::password::hash_password;
use rad_gateway::auth::{hash_key, ApiKeyAuthenticator, JwtAuthenticator};
use rad_gateway::cache::{self, AgentCardCache, ApiKeyInfoCache};
use rad_gateway::config::GatewayConfig;
use rad_gateway::cost::{spawn_cost_worker, CostAggregator, CostCalculator};
use rad_gateway::cost::worker::DEFAULT_WORKER_INTERVAL;
use rad_gateway::gateway::Gateway;
use rad_gateway::providers::anthropic::AnthropicAdapter;
use rad_gateway::providers::gemini::GeminiAdapter;
use rad_gateway::providers::mock::MockAdapter;
use rad_gateway::providers::openai::OpenAiAdapter;
use rad_gateway::providers::ProviderRegistry;
use rad_gateway::router::{RouteTable, Router};
use rad_gateway::server::{self, AppState};
use rad_gateway::storage::{self, ApiKeyRecord, ApiKeyStatus, Store, User, Workspace, WorkspaceStatus};
use rad_gateway::trace::TraceStore;
use rad_gateway::usage::{UsageSink, DEFAULT_FLUSH_INTERVAL, DEFAULT_WRITE_BATCH};

const HEALTH_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Tracing may not be initialized yet when config parsing fails.
        eprintln!("rad-gateway: {:#}", e);
        error!(error = %format!("{:#}", e), "startup failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(GatewayConfig::from_env()?);
    init_tracing(&config.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "rad-gateway starting");

    let cancel = CancellationToken::new();

    // Persistence (optional) and cache (degrades to pass-through).
    let store: Option<Arc<dyn Store>> = match &config.db {
        Some(db) => Some(storage::connect(db).await.context("store startup failed")?),
        None => {
            warn!("no RAD_DB_DRIVER configured, running without persistence");
            None
        }
    };
    let cache_backend = cache::connect(config.redis.as_ref()).await;

    if let Some(store) = &store {
        bootstrap_store(store.as_ref(), &config).await?;
    }

    // Provider registry, built once and read-only afterwards. The mock
    // adapter is always present but only explicit routes select it.
    let mut builder = ProviderRegistry::builder();
    if let Some(key) = &config.provider_keys.openai {
        builder = builder.register(Arc::new(OpenAiAdapter::new("openai", key)));
    }
    if let Some(key) = &config.provider_keys.anthropic {
        builder = builder.register(Arc::new(AnthropicAdapter::new("anthropic", key)));
    }
    if let Some(key) = &config.provider_keys.gemini {
        builder = builder.register(Arc::new(GeminiAdapter::new("gemini", key)));
    }
    builder = builder.register(Arc::new(MockAdapter::new()));
    let registry = Arc::new(builder.build()?);

    let table = match &config.routes_file {
        Some(path) => RouteTable::from_json_file(path)?,
        None => {
            info!("no RAD_ROUTES_FILE set, using provider/model fallthrough routing");
            RouteTable::default()
        }
    };
    let router = Arc::new(Router::new(table, config.retry_budget));

    let usage = UsageSink::new(store.is_some());
    let traces = Arc::new(TraceStore::default());
    let calculator = Arc::new(CostCalculator::new());

    let aggregator = store
        .as_ref()
        .map(|s| Arc::new(CostAggregator::new(s.clone(), calculator.clone())));
    if let Some(store) = &store {
        usage.spawn_writer(
            store.clone(),
            DEFAULT_WRITE_BATCH,
            DEFAULT_FLUSH_INTERVAL,
            cancel.child_token(),
        );
    }
    if let Some(aggregator) = &aggregator {
        spawn_cost_worker(aggregator.clone(), DEFAULT_WORKER_INTERVAL, cancel.child_token());
    }
    registry.spawn_health_task(HEALTH_REFRESH_INTERVAL, cancel.child_token());

    let jwt_secret = config.jwt_secret.clone().unwrap_or_else(|| {
        warn!("RAD_JWT_SECRET not set, generating an ephemeral signing key; \
               tokens will not survive a restart");
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        hex::encode(raw)
    });

    let gateway = Arc::new(Gateway::new(
        registry.clone(),
        router,
        usage.clone(),
        traces.clone(),
    ));
    let api_keys = Arc::new(ApiKeyAuthenticator::new(
        store.clone(),
        ApiKeyInfoCache::new(cache_backend.clone()),
        &config.bootstrap_keys,
    ));
    let jwt = Arc::new(JwtAuthenticator::new(jwt_secret.as_bytes()));

    let state = AppState {
        gateway,
        registry,
        usage,
        traces,
        store,
        cache: cache_backend.clone(),
        agent_cards: AgentCardCache::new(cache_backend),
        api_keys,
        jwt,
        aggregator,
        config: config.clone(),
    };

    let shutdown_cancel = cancel.clone();
    server::serve(state, async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        shutdown_cancel.cancel();
    })
    .await
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rad_gateway={level},tower_http=warn")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
}

/// Ensure the default workspace exists and seed bootstrap keys plus the
/// optional admin user so a fresh database is immediately usable.
async fn bootstrap_store(store: &dyn Store, config: &GatewayConfig) -> anyhow::Result<()> {
    let workspace = match store.workspace_by_slug("default").await? {
        Some(workspace) => workspace,
        None => {
            let workspace = Workspace {
                id: Uuid::new_v4().to_string(),
                slug: "default".to_string(),
                status: WorkspaceStatus::Active,
                created_at: Utc::now(),
            };
            store.create_workspace(&workspace).await?;
            info!(workspace = %workspace.id, "created default workspace");
            workspace
        }
    };

    for (name, secret) in &config.bootstrap_keys {
        let hash = hash_key(secret);
        if store.api_key_by_hash(&hash).await?.is_none() {
            store
                .insert_api_key(&ApiKeyRecord {
                    id: Uuid::new_v4().to_string(),
                    workspace_id: workspace.id.clone(),
                    name: name.clone(),
                    key_hash: hash,
                    status: ApiKeyStatus::Active,
                    expires_at: None,
                    allowed_models: None,
                    created_at: Utc::now(),
                })
                .await?;
            info!(name = %name, "seeded bootstrap api key");
        }
    }

    if let Some((email, password)) = &config.admin_user {
        if store.user_by_email(&workspace.id, email).await?.is_none() {
            store
                .create_user(&User {
                    id: Uuid::new_v4().to_string(),
                    workspace_id: workspace.id.clone(),
                    email: email.clone(),
                    password_hash: hash_password(password)
                        .map_err(|e| anyhow::anyhow!("admin user seeding failed: {}", e))?,
                    last_login_at: None,
                })
                .await?;
            info!(email = %email, "seeded admin user");
        }
    }

    Ok(())
}
