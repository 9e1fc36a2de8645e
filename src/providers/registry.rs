//! Provider registry
//!
//! Insertion-ordered name -> adapter map, built once at startup and
//! read-only afterwards; lookups take no lock. Health snapshots are the
//! only mutable state and live in their own concurrent map, refreshed by
//! a background task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ProviderAdapter, ProviderHealth};
use crate::error::{GatewayError, GatewayResult};
use crate::types::ModelInfo;

pub struct ProviderRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    by_name: HashMap<String, usize>,
    health: DashMap<String, ProviderHealth>,
}

/// Builder used during startup; `build` freezes the registry.
#[derive(Default)]
pub struct RegistryBuilder {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        info!(provider = adapter.name(), kind = adapter.provider_type().as_str(),
            "registering provider adapter");
        self.adapters.push(adapter);
        self
    }

    pub fn build(self) -> GatewayResult<ProviderRegistry> {
        let mut by_name = HashMap::new();
        for (i, adapter) in self.adapters.iter().enumerate() {
            if by_name.insert(adapter.name().to_string(), i).is_some() {
                return Err(GatewayError::Internal(format!(
                    "duplicate provider name '{}'",
                    adapter.name()
                )));
            }
        }
        Ok(ProviderRegistry {
            adapters: self.adapters,
            by_name,
            health: DashMap::new(),
        })
    }
}

impl ProviderRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.by_name
            .get(name)
            .map(|&i| Arc::clone(&self.adapters[i]))
    }

    /// Adapters in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ProviderAdapter>> {
        self.adapters.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Aggregate model listings across adapters. A provider that cannot
    /// list (down, unauthorized) contributes nothing rather than failing
    /// the whole listing.
    pub async fn list_all_models(&self) -> Vec<ModelInfo> {
        let mut models = Vec::new();
        for adapter in &self.adapters {
            match adapter.list_models().await {
                Ok(mut list) => models.append(&mut list),
                Err(e) => {
                    debug!(provider = adapter.name(), error = %e, "model listing failed");
                }
            }
        }
        models
    }

    pub fn health_snapshot(&self, name: &str) -> Option<ProviderHealth> {
        self.health.get(name).map(|h| h.clone())
    }

    /// Run one health check pass over every adapter.
    pub async fn refresh_health(&self) {
        for adapter in &self.adapters {
            let health = adapter.health_check().await;
            self.health.insert(adapter.name().to_string(), health);
        }
    }

    /// Periodic health refresh; the first pass runs immediately.
    pub fn spawn_health_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = timer.tick() => registry.refresh_health().await,
                }
            }
        })
    }
}
