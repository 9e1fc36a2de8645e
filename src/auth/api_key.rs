//! API key authentication
//!
//! Keys arrive in one of four carriers; whichever is present first wins.
//! Lookup is by sha256 hash, cache first with a short TTL, then the
//! store. Bootstrap keys from `RAD_API_KEYS` live in process memory so
//! the gateway authenticates even with no database configured.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::{Principal, SCOPE_API};
use crate::cache::ApiKeyInfoCache;
use crate::error::{GatewayError, GatewayResult};
use crate::storage::{ApiKeyRecord, ApiKeyStatus, Store};

pub const BOOTSTRAP_WORKSPACE_ID: &str = "ws-bootstrap";

/// Hex sha256 of an API key secret. This is the only form a secret takes
/// after the request boundary.
pub fn hash_key(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Extract the API key from the first carrier present: bearer header,
/// `x-api-key`, `x-goog-api-key`, then the `key` query parameter.
pub fn extract_api_key(headers: &HeaderMap, query_key: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    for header in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    query_key
        .filter(|k| !k.is_empty())
        .map(|k| k.to_string())
}

pub struct ApiKeyAuthenticator {
    store: Option<Arc<dyn Store>>,
    cache: ApiKeyInfoCache,
    /// Bootstrap keys by hash.
    bootstrap: HashMap<String, ApiKeyRecord>,
}

impl ApiKeyAuthenticator {
    pub fn new(
        store: Option<Arc<dyn Store>>,
        cache: ApiKeyInfoCache,
        bootstrap_keys: &[(String, String)],
    ) -> Self {
        let bootstrap = bootstrap_keys
            .iter()
            .map(|(name, secret)| {
                let hash = hash_key(secret);
                let record = ApiKeyRecord {
                    id: format!("bootstrap-{}", name),
                    workspace_id: BOOTSTRAP_WORKSPACE_ID.to_string(),
                    name: name.clone(),
                    key_hash: hash.clone(),
                    status: ApiKeyStatus::Active,
                    expires_at: None,
                    allowed_models: None,
                    created_at: Utc::now(),
                };
                (hash, record)
            })
            .collect();
        Self {
            store,
            cache,
            bootstrap,
        }
    }

    /// Resolve a presented secret to a principal.
    pub async fn authenticate(&self, secret: &str) -> GatewayResult<Principal> {
        let hash = hash_key(secret);
        let record = self
            .lookup(&hash)
            .await?
            .ok_or(GatewayError::InvalidCredentials)?;

        match record.status {
            ApiKeyStatus::Revoked => return Err(GatewayError::CredentialsRevoked),
            ApiKeyStatus::Expired => return Err(GatewayError::CredentialsExpired),
            ApiKeyStatus::Active => {}
        }
        if record.is_expired(Utc::now()) {
            return Err(GatewayError::CredentialsExpired);
        }

        Ok(Principal {
            workspace_id: record.workspace_id.clone(),
            actor_id: record.id.clone(),
            scopes: vec![SCOPE_API.to_string()],
            allowed_models: record.allowed_models.clone(),
        })
    }

    async fn lookup(&self, hash: &str) -> GatewayResult<Option<ApiKeyRecord>> {
        // Bootstrap keys first; they must work with no store and no cache.
        for (stored_hash, record) in &self.bootstrap {
            if constant_time_eq(stored_hash, hash) {
                return Ok(Some(record.clone()));
            }
        }

        if let Some(record) = self.cache.get(hash).await {
            debug!(key_id = %record.id, "api key cache hit");
            return Ok(Some(record));
        }

        let Some(store) = &self.store else {
            return Ok(None);
        };
        let record = store.api_key_by_hash(hash).await?;
        if let Some(record) = &record {
            self.cache.put(record).await;
        }
        Ok(record)
    }

    /// Drop a key from the cache (revocation takes effect immediately
    /// instead of at TTL expiry).
    pub async fn invalidate(&self, hash: &str) {
        self.cache.invalidate(hash).await;
    }
}
