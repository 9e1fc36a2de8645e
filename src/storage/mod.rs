//! Persistence adapter
//!
//! Uniform façade over an embedded SQLite store and a networked Postgres
//! store. The backend is chosen at startup; when the preferred server
//! backend cannot be reached within the ping budget the gateway falls
//! back to the embedded store and logs the downgrade.

pub mod migrations;
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{DbConfig, DbDriver};
use crate::error::{GatewayError, GatewayResult};
use crate::trace::TraceEvent;
use crate::usage::{UsageFilter, UsageRecord};

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

const PING_ATTEMPTS: u32 = 3;
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Workspace lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Active,
    Suspended,
    Deleted,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Suspended => "suspended",
            WorkspaceStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(WorkspaceStatus::Active),
            "suspended" => Some(WorkspaceStatus::Suspended),
            "deleted" => Some(WorkspaceStatus::Deleted),
            _ => None,
        }
    }
}

/// Tenancy boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub slug: String,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
}

/// Principal row within a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub workspace_id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// API key lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
    Expired,
}

impl ApiKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyStatus::Active => "active",
            ApiKeyStatus::Revoked => "revoked",
            ApiKeyStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ApiKeyStatus::Active),
            "revoked" => Some(ApiKeyStatus::Revoked),
            "expired" => Some(ApiKeyStatus::Expired),
            _ => None,
        }
    }
}

/// Stored API key metadata. The hash is write-once; rotation creates a
/// new row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    /// Hex sha256 of the presented secret; the plaintext is never stored.
    pub key_hash: String,
    pub status: ApiKeyStatus,
    pub expires_at: Option<DateTime<Utc>>,
    /// Optional model allow-list; `None` allows everything.
    pub allowed_models: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }
}

/// Workspace-local named upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    pub workspace_id: String,
    pub slug: String,
    pub provider_type: String,
    pub base_url: String,
    pub credential_ref: Option<String>,
    pub status: String,
    pub health: Option<Value>,
}

/// Totals over a usage window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    pub request_count: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_duration_ms: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsageRow {
    pub model: String,
    pub request_count: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUsageRow {
    pub provider: String,
    pub request_count: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Aggregation bucket for timeseries queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBucket {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl TimeBucket {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(TimeBucket::Hourly),
            "daily" => Some(TimeBucket::Daily),
            "weekly" => Some(TimeBucket::Weekly),
            "monthly" => Some(TimeBucket::Monthly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBucketRow {
    pub bucket: String,
    pub request_count: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Uniform store façade. Both backends implement every repository.
#[async_trait]
pub trait Store: Send + Sync {
    fn driver(&self) -> &'static str;

    async fn ping(&self) -> GatewayResult<()>;

    // Workspaces
    async fn create_workspace(&self, workspace: &Workspace) -> GatewayResult<()>;
    async fn workspace(&self, id: &str) -> GatewayResult<Option<Workspace>>;
    async fn workspace_by_slug(&self, slug: &str) -> GatewayResult<Option<Workspace>>;
    async fn list_workspaces(&self) -> GatewayResult<Vec<Workspace>>;
    async fn update_workspace_status(&self, id: &str, status: WorkspaceStatus)
        -> GatewayResult<()>;
    /// Deletes the workspace and cascades to owned rows.
    async fn delete_workspace(&self, id: &str) -> GatewayResult<()>;

    // Users
    async fn create_user(&self, user: &User) -> GatewayResult<()>;
    async fn user(&self, id: &str) -> GatewayResult<Option<User>>;
    async fn user_by_email(&self, workspace_id: &str, email: &str) -> GatewayResult<Option<User>>;
    async fn touch_last_login(&self, id: &str) -> GatewayResult<()>;

    // API keys
    async fn insert_api_key(&self, key: &ApiKeyRecord) -> GatewayResult<()>;
    async fn api_key_by_hash(&self, key_hash: &str) -> GatewayResult<Option<ApiKeyRecord>>;
    async fn list_api_keys(&self, workspace_id: &str) -> GatewayResult<Vec<ApiKeyRecord>>;
    async fn update_api_key_status(&self, id: &str, status: ApiKeyStatus) -> GatewayResult<()>;

    // Providers
    async fn upsert_provider(&self, provider: &ProviderRecord) -> GatewayResult<()>;
    async fn list_providers(&self, workspace_id: &str) -> GatewayResult<Vec<ProviderRecord>>;
    async fn update_provider_health(&self, id: &str, health: &Value) -> GatewayResult<()>;

    // Usage records
    async fn insert_usage(&self, records: &[UsageRecord]) -> GatewayResult<()>;
    /// Rows with `cost_usd IS NULL`, oldest first.
    async fn fetch_uncosted(&self, limit: u32) -> GatewayResult<Vec<UsageRecord>>;
    /// Fill costs for the given rows; only `NULL -> value` writes occur, so
    /// the operation is idempotent row-wise. Returns the number of rows
    /// actually updated.
    async fn fill_costs(&self, updates: &[(String, f64)]) -> GatewayResult<usize>;
    async fn query_usage(&self, filter: &UsageFilter) -> GatewayResult<Vec<UsageRecord>>;
    async fn usage_summary(&self, filter: &UsageFilter) -> GatewayResult<UsageSummary>;
    async fn usage_by_model(&self, filter: &UsageFilter) -> GatewayResult<Vec<ModelUsageRow>>;
    async fn usage_by_provider(&self, filter: &UsageFilter)
        -> GatewayResult<Vec<ProviderUsageRow>>;
    async fn usage_timeseries(
        &self,
        filter: &UsageFilter,
        bucket: TimeBucket,
    ) -> GatewayResult<Vec<TimeBucketRow>>;

    // Trace events
    async fn insert_trace_events(&self, events: &[TraceEvent]) -> GatewayResult<()>;
    async fn trace_events(&self, trace_id: &str) -> GatewayResult<Vec<TraceEvent>>;
}

/// Connect to the configured backend, falling back to the embedded store
/// when the server backend does not answer within the ping budget.
pub async fn connect(config: &DbConfig) -> GatewayResult<Arc<dyn Store>> {
    match config.driver {
        DbDriver::Sqlite => {
            let store = SqliteStore::open(&config.dsn)?;
            info!(dsn = %config.dsn, "connected to sqlite store");
            Ok(Arc::new(store))
        }
        DbDriver::Postgres => match connect_postgres(config).await {
            Ok(store) => {
                info!("connected to postgres store");
                Ok(Arc::new(store))
            }
            Err(e) => {
                // Operators must see this; a silent downgrade would make
                // "where did my rows go" an archaeology project.
                error!(error = %e, "postgres unreachable, falling back to embedded sqlite store");
                let store = SqliteStore::open("rad-gateway-fallback.db")?;
                Ok(Arc::new(store))
            }
        },
    }
}

async fn connect_postgres(config: &DbConfig) -> GatewayResult<PostgresStore> {
    let mut backoff = Duration::from_secs(1);
    let mut last_err = None;
    for attempt in 1..=PING_ATTEMPTS {
        match tokio::time::timeout(PING_TIMEOUT, PostgresStore::connect(config)).await {
            Ok(Ok(store)) => return Ok(store),
            Ok(Err(e)) => {
                warn!(attempt, error = %e, "postgres connect attempt failed");
                last_err = Some(e);
            }
            Err(_) => {
                warn!(attempt, "postgres connect attempt timed out");
                last_err = Some(GatewayError::Timeout("postgres connect".into()));
            }
        }
        if attempt < PING_ATTEMPTS {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
    Err(last_err.unwrap_or_else(|| GatewayError::Storage("postgres unreachable".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_expiry() {
        let now = Utc::now();
        let key = ApiKeyRecord {
            id: "k1".into(),
            workspace_id: "ws".into(),
            name: "test".into(),
            key_hash: "h".into(),
            status: ApiKeyStatus::Active,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            allowed_models: None,
            created_at: now,
        };
        assert!(key.is_expired(now));

        let fresh = ApiKeyRecord {
            expires_at: Some(now + chrono::Duration::hours(1)),
            ..key.clone()
        };
        assert!(!fresh.is_expired(now));

        let eternal = ApiKeyRecord {
            expires_at: None,
            ..key
        };
        assert!(!eternal.is_expired(now));
    }

    #[test]
    fn test_status_round_trips() {
        for status in [
            WorkspaceStatus::Active,
            WorkspaceStatus::Suspended,
            WorkspaceStatus::Deleted,
        ] {
            assert_eq!(WorkspaceStatus::parse(status.as_str()), Some(status));
        }
        for status in [ApiKeyStatus::Active, ApiKeyStatus::Revoked, ApiKeyStatus::Expired] {
            assert_eq!(ApiKeyStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TimeBucket::parse("weekly"), Some(TimeBucket::Weekly));
        assert_eq!(TimeBucket::parse("yearly"), None);
    }
}
