//! Networked Postgres store
//!
//! sqlx-backed implementation of the store façade. The pool settings come
//! from the `RAD_DB_*` environment; queries mirror the SQLite backend so
//! the two stay swappable behind the trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{info, warn};

use super::migrations;
use super::{
    ApiKeyRecord, ApiKeyStatus, ModelUsageRow, ProviderRecord, ProviderUsageRow, Store,
    TimeBucket, TimeBucketRow, UsageSummary, User, Workspace, WorkspaceStatus,
};
use crate::config::DbConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::trace::TraceEvent;
use crate::usage::{ResponseStatus, UsageFilter, UsageRecord};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(config: &DbConfig) -> GatewayResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns)
            .max_lifetime(config.conn_max_lifetime)
            .connect(&config.dsn)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> GatewayResult<()> {
        sqlx::raw_sql(migrations::SCHEMA_MIGRATIONS_POSTGRES)
            .execute(&self.pool)
            .await?;

        for migration in migrations::migrations() {
            let recorded: Option<String> =
                sqlx::query_scalar("SELECT checksum FROM schema_migrations WHERE version = $1")
                    .bind(migration.version)
                    .fetch_optional(&self.pool)
                    .await?;

            match recorded {
                Some(checksum) => migrations::verify_checksum(migration, &checksum)?,
                None => {
                    let mut tx = self.pool.begin().await?;
                    sqlx::raw_sql(migration.postgres_up)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(
                        "INSERT INTO schema_migrations (version, checksum, applied_at)
                         VALUES ($1, $2, $3)",
                    )
                    .bind(migration.version)
                    .bind(migration.checksum())
                    .bind(Utc::now())
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    info!(version = migration.version, name = migration.name, "applied migration");
                }
            }
        }
        Ok(())
    }

    /// Operator-initiated rollback to `target_version` (0 = everything).
    pub async fn migrate_down(&self, target_version: i64) -> GatewayResult<()> {
        for migration in migrations::migrations().iter().rev() {
            if migration.version <= target_version {
                break;
            }
            let recorded: Option<String> =
                sqlx::query_scalar("SELECT checksum FROM schema_migrations WHERE version = $1")
                    .bind(migration.version)
                    .fetch_optional(&self.pool)
                    .await?;
            if recorded.is_none() {
                continue;
            }
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration.postgres_down)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM schema_migrations WHERE version = $1")
                .bind(migration.version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version = migration.version, name = migration.name, "rolled back migration");
        }
        Ok(())
    }
}

fn usage_from_row(row: &PgRow) -> GatewayResult<UsageRecord> {
    Ok(UsageRecord {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        request_id: row.try_get("request_id")?,
        trace_id: row.try_get("trace_id")?,
        api_key_id: row.try_get("api_key_id")?,
        provider_id: row.try_get("provider_id")?,
        incoming_model: row.try_get("incoming_model")?,
        selected_model: row.try_get("selected_model")?,
        prompt_tokens: row.try_get::<i32, _>("prompt_tokens")? as u32,
        completion_tokens: row.try_get::<i32, _>("completion_tokens")? as u32,
        total_tokens: row.try_get::<i32, _>("total_tokens")? as u32,
        cost_usd: row.try_get("cost_usd")?,
        duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
        response_status: ResponseStatus::parse(&row.try_get::<String, _>("response_status")?)
            .unwrap_or(ResponseStatus::Error),
        created_at: row.try_get("created_at")?,
    })
}

fn api_key_from_row(row: &PgRow) -> GatewayResult<ApiKeyRecord> {
    let allowed: Option<String> = row.try_get("allowed_models")?;
    Ok(ApiKeyRecord {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        name: row.try_get("name")?,
        key_hash: row.try_get("key_hash")?,
        status: ApiKeyStatus::parse(&row.try_get::<String, _>("status")?)
            .unwrap_or(ApiKeyStatus::Revoked),
        expires_at: row.try_get("expires_at")?,
        allowed_models: allowed.as_deref().map(serde_json::from_str).transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

fn workspace_from_row(row: &PgRow) -> GatewayResult<Workspace> {
    Ok(Workspace {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        status: WorkspaceStatus::parse(&row.try_get::<String, _>("status")?)
            .unwrap_or(WorkspaceStatus::Active),
        created_at: row.try_get("created_at")?,
    })
}

fn user_from_row(row: &PgRow) -> GatewayResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        workspace_id: row.try_get("workspace_id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        last_login_at: row.try_get("last_login_at")?,
    })
}

/// Append filter conditions to a query builder that already ends in
/// either `WHERE true` or a bare select.
fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &UsageFilter) {
    if let Some(ws) = &filter.workspace_id {
        builder.push(" AND workspace_id = ").push_bind(ws.clone());
    }
    if let Some(key) = &filter.api_key_id {
        builder.push(" AND api_key_id = ").push_bind(key.clone());
    }
    if let Some(provider) = &filter.provider {
        builder.push(" AND provider_id = ").push_bind(provider.clone());
    }
    if let Some(model) = &filter.model {
        builder
            .push(" AND (selected_model = ")
            .push_bind(model.clone())
            .push(" OR incoming_model = ")
            .push_bind(model.clone())
            .push(")");
    }
    if let Some(since) = filter.since {
        builder.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        builder.push(" AND created_at <= ").push_bind(until);
    }
}

fn bucket_format(bucket: TimeBucket) -> (&'static str, &'static str) {
    match bucket {
        TimeBucket::Hourly => ("hour", "YYYY-MM-DD\"T\"HH24:00"),
        TimeBucket::Daily => ("day", "YYYY-MM-DD"),
        TimeBucket::Weekly => ("week", "IYYY-\"W\"IW"),
        TimeBucket::Monthly => ("month", "YYYY-MM"),
    }
}

const USAGE_COLUMNS: &str = "id, workspace_id, request_id, trace_id, api_key_id, provider_id, \
     incoming_model, selected_model, prompt_tokens, completion_tokens, total_tokens, cost_usd, \
     duration_ms, response_status, created_at";

#[async_trait]
impl Store for PostgresStore {
    fn driver(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> GatewayResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_workspace(&self, workspace: &Workspace) -> GatewayResult<()> {
        sqlx::query("INSERT INTO workspaces (id, slug, status, created_at) VALUES ($1, $2, $3, $4)")
            .bind(&workspace.id)
            .bind(&workspace.slug)
            .bind(workspace.status.as_str())
            .bind(workspace.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn workspace(&self, id: &str) -> GatewayResult<Option<Workspace>> {
        let row = sqlx::query("SELECT id, slug, status, created_at FROM workspaces WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(workspace_from_row).transpose()
    }

    async fn workspace_by_slug(&self, slug: &str) -> GatewayResult<Option<Workspace>> {
        let row =
            sqlx::query("SELECT id, slug, status, created_at FROM workspaces WHERE slug = $1")
                .bind(slug)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(workspace_from_row).transpose()
    }

    async fn list_workspaces(&self) -> GatewayResult<Vec<Workspace>> {
        let rows =
            sqlx::query("SELECT id, slug, status, created_at FROM workspaces ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(workspace_from_row).collect()
    }

    async fn update_workspace_status(
        &self,
        id: &str,
        status: WorkspaceStatus,
    ) -> GatewayResult<()> {
        sqlx::query("UPDATE workspaces SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_workspace(&self, id: &str) -> GatewayResult<()> {
        sqlx::query("DELETE FROM workspaces WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_user(&self, user: &User) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO users (id, workspace_id, email, password_hash, last_login_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&user.id)
        .bind(&user.workspace_id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.last_login_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn user(&self, id: &str) -> GatewayResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, workspace_id, email, password_hash, last_login_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn user_by_email(&self, workspace_id: &str, email: &str) -> GatewayResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, workspace_id, email, password_hash, last_login_at
             FROM users WHERE workspace_id = $1 AND email = $2",
        )
        .bind(workspace_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn touch_last_login(&self, id: &str) -> GatewayResult<()> {
        sqlx::query("UPDATE users SET last_login_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_api_key(&self, key: &ApiKeyRecord) -> GatewayResult<()> {
        let allowed = key
            .allowed_models
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO api_keys
                 (id, workspace_id, name, key_hash, status, expires_at, allowed_models, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&key.id)
        .bind(&key.workspace_id)
        .bind(&key.name)
        .bind(&key.key_hash)
        .bind(key.status.as_str())
        .bind(key.expires_at)
        .bind(allowed)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn api_key_by_hash(&self, key_hash: &str) -> GatewayResult<Option<ApiKeyRecord>> {
        let row = sqlx::query(
            "SELECT id, workspace_id, name, key_hash, status, expires_at, allowed_models, created_at
             FROM api_keys WHERE key_hash = $1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(api_key_from_row).transpose()
    }

    async fn list_api_keys(&self, workspace_id: &str) -> GatewayResult<Vec<ApiKeyRecord>> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, name, key_hash, status, expires_at, allowed_models, created_at
             FROM api_keys WHERE workspace_id = $1 ORDER BY created_at",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(api_key_from_row).collect()
    }

    async fn update_api_key_status(&self, id: &str, status: ApiKeyStatus) -> GatewayResult<()> {
        sqlx::query("UPDATE api_keys SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_provider(&self, provider: &ProviderRecord) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO providers
                 (id, workspace_id, slug, provider_type, base_url, credential_ref, status, health)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (workspace_id, slug) DO UPDATE SET
                 provider_type = EXCLUDED.provider_type,
                 base_url = EXCLUDED.base_url,
                 credential_ref = EXCLUDED.credential_ref,
                 status = EXCLUDED.status",
        )
        .bind(&provider.id)
        .bind(&provider.workspace_id)
        .bind(&provider.slug)
        .bind(&provider.provider_type)
        .bind(&provider.base_url)
        .bind(&provider.credential_ref)
        .bind(&provider.status)
        .bind(provider.health.as_ref().map(Value::to_string))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_providers(&self, workspace_id: &str) -> GatewayResult<Vec<ProviderRecord>> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, slug, provider_type, base_url, credential_ref, status, health
             FROM providers WHERE workspace_id = $1 ORDER BY slug",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let health: Option<String> = row.try_get("health")?;
                Ok(ProviderRecord {
                    id: row.try_get("id")?,
                    workspace_id: row.try_get("workspace_id")?,
                    slug: row.try_get("slug")?,
                    provider_type: row.try_get("provider_type")?,
                    base_url: row.try_get("base_url")?,
                    credential_ref: row.try_get("credential_ref")?,
                    status: row.try_get("status")?,
                    health: health.as_deref().map(serde_json::from_str).transpose()?,
                })
            })
            .collect()
    }

    async fn update_provider_health(&self, id: &str, health: &Value) -> GatewayResult<()> {
        sqlx::query("UPDATE providers SET health = $1 WHERE id = $2")
            .bind(health.to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_usage(&self, records: &[UsageRecord]) -> GatewayResult<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO usage_records
                     (id, workspace_id, request_id, trace_id, api_key_id, provider_id,
                      incoming_model, selected_model, prompt_tokens, completion_tokens,
                      total_tokens, cost_usd, duration_ms, response_status, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            )
            .bind(&record.id)
            .bind(&record.workspace_id)
            .bind(&record.request_id)
            .bind(&record.trace_id)
            .bind(&record.api_key_id)
            .bind(&record.provider_id)
            .bind(&record.incoming_model)
            .bind(&record.selected_model)
            .bind(record.prompt_tokens as i32)
            .bind(record.completion_tokens as i32)
            .bind(record.total_tokens as i32)
            .bind(record.cost_usd)
            .bind(record.duration_ms as i64)
            .bind(record.response_status.as_str())
            .bind(record.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_uncosted(&self, limit: u32) -> GatewayResult<Vec<UsageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records
             WHERE cost_usd IS NULL ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(usage_from_row).collect()
    }

    async fn fill_costs(&self, updates: &[(String, f64)]) -> GatewayResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for (id, cost) in updates {
            let result =
                sqlx::query("UPDATE usage_records SET cost_usd = $1 WHERE id = $2 AND cost_usd IS NULL")
                    .bind(cost)
                    .bind(id)
                    .execute(&mut *tx)
                    .await;
            match result {
                Ok(done) => updated += done.rows_affected() as usize,
                Err(e) => {
                    warn!(id = %id, error = %e, "cost update failed for row");
                }
            }
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn query_usage(&self, filter: &UsageFilter) -> GatewayResult<Vec<UsageRecord>> {
        let mut builder = QueryBuilder::new(format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records WHERE true"
        ));
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(100) as i64);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(usage_from_row).collect()
    }

    async fn usage_summary(&self, filter: &UsageFilter) -> GatewayResult<UsageSummary> {
        let mut builder = QueryBuilder::new(
            "SELECT COUNT(*) AS request_count,
                    COALESCE(SUM(total_tokens), 0)::BIGINT AS total_tokens,
                    COALESCE(SUM(cost_usd), 0.0) AS total_cost,
                    COALESCE(AVG(duration_ms), 0.0) AS avg_duration,
                    COALESCE(AVG(CASE WHEN response_status <> 'success' THEN 1.0 ELSE 0.0 END), 0.0)
                        AS error_rate
             FROM usage_records WHERE true",
        );
        push_filter(&mut builder, filter);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(UsageSummary {
            request_count: row.try_get::<i64, _>("request_count")? as u64,
            total_tokens: row.try_get::<i64, _>("total_tokens")? as u64,
            total_cost_usd: row.try_get("total_cost")?,
            avg_duration_ms: row.try_get("avg_duration")?,
            error_rate: row.try_get("error_rate")?,
        })
    }

    async fn usage_by_model(&self, filter: &UsageFilter) -> GatewayResult<Vec<ModelUsageRow>> {
        let mut builder = QueryBuilder::new(
            "SELECT selected_model, COUNT(*) AS request_count,
                    COALESCE(SUM(total_tokens), 0)::BIGINT AS total_tokens,
                    COALESCE(SUM(cost_usd), 0.0) AS total_cost
             FROM usage_records WHERE true",
        );
        push_filter(&mut builder, filter);
        builder.push(" GROUP BY selected_model ORDER BY COUNT(*) DESC");
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(ModelUsageRow {
                    model: row.try_get("selected_model")?,
                    request_count: row.try_get::<i64, _>("request_count")? as u64,
                    total_tokens: row.try_get::<i64, _>("total_tokens")? as u64,
                    total_cost_usd: row.try_get("total_cost")?,
                })
            })
            .collect()
    }

    async fn usage_by_provider(
        &self,
        filter: &UsageFilter,
    ) -> GatewayResult<Vec<ProviderUsageRow>> {
        let mut builder = QueryBuilder::new(
            "SELECT provider_id, COUNT(*) AS request_count,
                    COALESCE(SUM(total_tokens), 0)::BIGINT AS total_tokens,
                    COALESCE(SUM(cost_usd), 0.0) AS total_cost
             FROM usage_records WHERE true",
        );
        push_filter(&mut builder, filter);
        builder.push(" GROUP BY provider_id ORDER BY COUNT(*) DESC");
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(ProviderUsageRow {
                    provider: row.try_get("provider_id")?,
                    request_count: row.try_get::<i64, _>("request_count")? as u64,
                    total_tokens: row.try_get::<i64, _>("total_tokens")? as u64,
                    total_cost_usd: row.try_get("total_cost")?,
                })
            })
            .collect()
    }

    async fn usage_timeseries(
        &self,
        filter: &UsageFilter,
        bucket: TimeBucket,
    ) -> GatewayResult<Vec<TimeBucketRow>> {
        let (trunc, format) = bucket_format(bucket);
        let mut builder = QueryBuilder::new(format!(
            "SELECT to_char(date_trunc('{trunc}', created_at), '{format}') AS bucket,
                    COUNT(*) AS request_count,
                    COALESCE(SUM(total_tokens), 0)::BIGINT AS total_tokens,
                    COALESCE(SUM(cost_usd), 0.0) AS total_cost
             FROM usage_records WHERE true"
        ));
        push_filter(&mut builder, filter);
        builder.push(" GROUP BY bucket ORDER BY bucket");
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(TimeBucketRow {
                    bucket: row.try_get("bucket")?,
                    request_count: row.try_get::<i64, _>("request_count")? as u64,
                    total_tokens: row.try_get::<i64, _>("total_tokens")? as u64,
                    total_cost_usd: row.try_get("total_cost")?,
                })
            })
            .collect()
    }

    async fn insert_trace_events(&self, events: &[TraceEvent]) -> GatewayResult<()> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                "INSERT INTO trace_events
                     (trace_id, request_id, event_order, timestamp, stage, payload)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (trace_id, event_order) DO NOTHING",
            )
            .bind(&event.trace_id)
            .bind(&event.request_id)
            .bind(event.event_order as i64)
            .bind(event.timestamp)
            .bind(&event.stage)
            .bind(event.payload.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn trace_events(&self, trace_id: &str) -> GatewayResult<Vec<TraceEvent>> {
        let rows = sqlx::query(
            "SELECT trace_id, request_id, event_order, timestamp, stage, payload
             FROM trace_events WHERE trace_id = $1 ORDER BY event_order",
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                Ok(TraceEvent {
                    trace_id: row.try_get("trace_id")?,
                    request_id: row.try_get("request_id")?,
                    event_order: row.try_get::<i64, _>("event_order")? as u64,
                    timestamp: row.try_get::<DateTime<Utc>, _>("timestamp")?,
                    stage: row.try_get("stage")?,
                    payload: serde_json::from_str(&payload)
                        .map_err(|e| GatewayError::Storage(e.to_string()))?,
                })
            })
            .collect()
    }
}
