//! Shared application state
//!
//! Built once at startup and cloned into every handler. Everything in
//! here is either immutable after startup or internally synchronized.

use std::sync::Arc;

use crate::auth::{ApiKeyAuthenticator, JwtAuthenticator};
use crate::cache::{AgentCardCache, Cache};
use crate::config::GatewayConfig;
use crate::cost::CostAggregator;
use crate::gateway::Gateway;
use crate::providers::ProviderRegistry;
use crate::storage::Store;
use crate::trace::TraceStore;
use crate::usage::UsageSink;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub registry: Arc<ProviderRegistry>,
    pub usage: Arc<UsageSink>,
    pub traces: Arc<TraceStore>,
    pub store: Option<Arc<dyn Store>>,
    pub cache: Arc<dyn Cache>,
    pub agent_cards: AgentCardCache,
    pub api_keys: Arc<ApiKeyAuthenticator>,
    pub jwt: Arc<JwtAuthenticator>,
    pub aggregator: Option<Arc<CostAggregator>>,
    pub config: Arc<GatewayConfig>,
}
