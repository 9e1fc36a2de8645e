//! Cache layer
//!
//! Key/value abstraction in front of redis. When the backend is
//! unreachable the gateway runs on [`NullCache`], where every `get`
//! misses and every `set` is a no-op; no code path may treat a cache hit
//! as a correctness dependency. Every redis operation carries its own 2 s
//! timeout so a stalled cache cannot stall the request path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as RedisPoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::config::RedisConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::storage::ApiKeyRecord;

const CACHE_OP_TIMEOUT: Duration = Duration::from_secs(2);

pub const API_KEY_TTL: Duration = Duration::from_secs(60);
pub const AGENT_CARD_TTL: Duration = Duration::from_secs(600);

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> GatewayResult<()>;
    async fn delete(&self, key: &str) -> GatewayResult<()>;
    async fn delete_pattern(&self, pattern: &str) -> GatewayResult<u64>;
    async fn ping(&self) -> GatewayResult<()>;
}

/// Production cache backed by a redis connection pool.
pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub async fn connect(config: &RedisConfig) -> GatewayResult<Self> {
        let url = match &config.password {
            Some(password) => format!("redis://:{}@{}/{}", password, config.addr, config.db),
            None => format!("redis://{}/{}", config.addr, config.db),
        };
        let pool = RedisPoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| GatewayError::Cache(e.to_string()))?;
        let cache = Self { pool };
        cache.ping().await?;
        Ok(cache)
    }

    async fn conn(&self) -> GatewayResult<deadpool_redis::Connection> {
        tokio::time::timeout(CACHE_OP_TIMEOUT, self.pool.get())
            .await
            .map_err(|_| GatewayError::Cache("redis pool timeout".into()))?
            .map_err(|e| GatewayError::Cache(e.to_string()))
    }
}

async fn with_timeout<T>(
    fut: impl std::future::Future<Output = redis::RedisResult<T>>,
) -> GatewayResult<T> {
    tokio::time::timeout(CACHE_OP_TIMEOUT, fut)
        .await
        .map_err(|_| GatewayError::Cache("redis operation timeout".into()))?
        .map_err(|e| GatewayError::Cache(e.to_string()))
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let mut conn = self.conn().await?;
        with_timeout(conn.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> GatewayResult<()> {
        let mut conn = self.conn().await?;
        with_timeout(conn.set_ex(key, value, ttl.as_secs())).await
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        let mut conn = self.conn().await?;
        with_timeout(conn.del::<_, ()>(key)).await
    }

    async fn delete_pattern(&self, pattern: &str) -> GatewayResult<u64> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut deleted = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = with_timeout(
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn),
            )
            .await?;
            if !keys.is_empty() {
                deleted += keys.len() as u64;
                with_timeout(conn.del::<_, ()>(keys)).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(deleted)
    }

    async fn ping(&self) -> GatewayResult<()> {
        let mut conn = self.conn().await?;
        with_timeout(redis::cmd("PING").query_async::<()>(&mut conn)).await
    }
}

/// Pass-through cache used when no backend is configured or reachable.
pub struct NullCache;

#[async_trait]
impl Cache for NullCache {
    async fn get(&self, _key: &str) -> GatewayResult<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> GatewayResult<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> GatewayResult<()> {
        Ok(())
    }

    async fn delete_pattern(&self, _pattern: &str) -> GatewayResult<u64> {
        Ok(0)
    }

    async fn ping(&self) -> GatewayResult<()> {
        Err(GatewayError::Cache("no cache backend configured".into()))
    }
}

/// Connect to redis when configured, degrading to the null cache when the
/// backend does not answer.
pub async fn connect(config: Option<&RedisConfig>) -> Arc<dyn Cache> {
    match config {
        Some(redis_config) => match RedisCache::connect(redis_config).await {
            Ok(cache) => {
                debug!(addr = %redis_config.addr, "connected to redis cache");
                Arc::new(cache)
            }
            Err(e) => {
                warn!(addr = %redis_config.addr, error = %e,
                    "redis unreachable, running without cache");
                Arc::new(NullCache)
            }
        },
        None => Arc::new(NullCache),
    }
}

fn get_json<T: DeserializeOwned>(raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            // A stale or foreign entry; treat as a miss.
            warn!(error = %e, "discarding undecodable cache entry");
            None
        }
    }
}

async fn set_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
    match serde_json::to_string(value) {
        Ok(raw) => {
            if let Err(e) = cache.set(key, &raw, ttl).await {
                debug!(key, error = %e, "cache set failed");
            }
        }
        Err(e) => warn!(key, error = %e, "failed to serialize cache entry"),
    }
}

/// API-key lookups keyed by key hash. The TTL bounds how long a revoked
/// key can keep authenticating.
#[derive(Clone)]
pub struct ApiKeyInfoCache {
    inner: Arc<dyn Cache>,
}

impl ApiKeyInfoCache {
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self { inner }
    }

    fn key(hash: &str) -> String {
        format!("apikey:{}", hash)
    }

    pub async fn get(&self, hash: &str) -> Option<ApiKeyRecord> {
        match self.inner.get(&Self::key(hash)).await {
            Ok(raw) => get_json(raw),
            Err(e) => {
                debug!(error = %e, "api key cache get failed");
                None
            }
        }
    }

    pub async fn put(&self, record: &ApiKeyRecord) {
        set_json(
            self.inner.as_ref(),
            &Self::key(&record.key_hash),
            record,
            API_KEY_TTL,
        )
        .await;
    }

    pub async fn invalidate(&self, hash: &str) {
        if let Err(e) = self.inner.delete(&Self::key(hash)).await {
            debug!(error = %e, "api key cache invalidate failed");
        }
    }
}

/// Agent cards cached by id, skill and name.
#[derive(Clone)]
pub struct AgentCardCache {
    inner: Arc<dyn Cache>,
}

impl AgentCardCache {
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self { inner }
    }

    pub async fn get_by_id(&self, id: &str) -> Option<serde_json::Value> {
        self.fetch(&format!("agentcard:id:{}", id)).await
    }

    pub async fn get_by_skill(&self, skill: &str) -> Option<serde_json::Value> {
        self.fetch(&format!("agentcard:skill:{}", skill)).await
    }

    pub async fn get_by_name(&self, name: &str) -> Option<serde_json::Value> {
        self.fetch(&format!("agentcard:name:{}", name)).await
    }

    async fn fetch(&self, key: &str) -> Option<serde_json::Value> {
        match self.inner.get(key).await {
            Ok(raw) => get_json(raw),
            Err(_) => None,
        }
    }

    pub async fn put(&self, id: &str, name: &str, skills: &[String], card: &serde_json::Value) {
        set_json(self.inner.as_ref(), &format!("agentcard:id:{}", id), card, AGENT_CARD_TTL).await;
        set_json(
            self.inner.as_ref(),
            &format!("agentcard:name:{}", name),
            card,
            AGENT_CARD_TTL,
        )
        .await;
        for skill in skills {
            set_json(
                self.inner.as_ref(),
                &format!("agentcard:skill:{}", skill),
                card,
                AGENT_CARD_TTL,
            )
            .await;
        }
    }

    pub async fn invalidate_all(&self) {
        if let Err(e) = self.inner.delete_pattern("agentcard:*").await {
            debug!(error = %e, "agent card cache invalidate failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::storage::ApiKeyStatus;

    #[tokio::test]
    async fn test_null_cache_always_misses() {
        let cache = NullCache;
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.delete_pattern("*").await.unwrap(), 0);
        assert!(cache.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_api_key_cache_over_null_backend() {
        let wrapper = ApiKeyInfoCache::new(Arc::new(NullCache));
        let record = ApiKeyRecord {
            id: "k1".into(),
            workspace_id: "ws".into(),
            name: "test".into(),
            key_hash: "hash".into(),
            status: ApiKeyStatus::Active,
            expires_at: None,
            allowed_models: None,
            created_at: Utc::now(),
        };
        // Writes succeed silently and reads miss; callers fall through to
        // the store either way.
        wrapper.put(&record).await;
        assert!(wrapper.get("hash").await.is_none());
    }

    #[test]
    fn test_get_json_discards_garbage() {
        let parsed: Option<serde_json::Value> = get_json(Some("not-json{".to_string()));
        assert!(parsed.is_none());
        let parsed: Option<serde_json::Value> = get_json(Some("{\"a\":1}".to_string()));
        assert_eq!(parsed, Some(serde_json::json!({"a": 1})));
    }
}
