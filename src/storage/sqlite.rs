//! Embedded SQLite store
//!
//! Single connection behind a mutex. Statements are short and the write
//! volume is batched upstream by the usage sink, so connection-level
//! locking is the simple and sufficient choice here.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};

use super::migrations;
use super::{
    ApiKeyRecord, ApiKeyStatus, ModelUsageRow, ProviderRecord, ProviderUsageRow, Store,
    TimeBucket, TimeBucketRow, UsageSummary, User, Workspace, WorkspaceStatus,
};
use crate::error::{GatewayError, GatewayResult};
use crate::trace::TraceEvent;
use crate::usage::{ResponseStatus, UsageFilter, UsageRecord};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> GatewayResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> GatewayResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> GatewayResult<()> {
        let mut conn = self.conn.lock();
        conn.execute(migrations::SCHEMA_MIGRATIONS_SQLITE, [])?;

        for migration in migrations::migrations() {
            let recorded: Option<String> = conn
                .query_row(
                    "SELECT checksum FROM schema_migrations WHERE version = ?1",
                    params![migration.version],
                    |row| row.get(0),
                )
                .optional()?;

            match recorded {
                Some(checksum) => migrations::verify_checksum(migration, &checksum)?,
                None => {
                    let tx = conn.transaction()?;
                    tx.execute_batch(migration.sqlite_up)?;
                    tx.execute(
                        "INSERT INTO schema_migrations (version, checksum, applied_at)
                         VALUES (?1, ?2, ?3)",
                        params![
                            migration.version,
                            migration.checksum(),
                            Utc::now().to_rfc3339()
                        ],
                    )?;
                    tx.commit()?;
                    info!(version = migration.version, name = migration.name, "applied migration");
                }
            }
        }
        Ok(())
    }

    /// Operator-initiated rollback to `target_version` (0 = everything).
    pub fn migrate_down(&self, target_version: i64) -> GatewayResult<()> {
        let mut conn = self.conn.lock();
        for migration in migrations::migrations().iter().rev() {
            if migration.version <= target_version {
                break;
            }
            let recorded: Option<String> = conn
                .query_row(
                    "SELECT checksum FROM schema_migrations WHERE version = ?1",
                    params![migration.version],
                    |row| row.get(0),
                )
                .optional()?;
            if recorded.is_none() {
                continue;
            }
            let tx = conn.transaction()?;
            tx.execute_batch(migration.sqlite_down)?;
            tx.execute(
                "DELETE FROM schema_migrations WHERE version = ?1",
                params![migration.version],
            )?;
            tx.commit()?;
            info!(version = migration.version, name = migration.name, "rolled back migration");
        }
        Ok(())
    }
}

fn parse_time(raw: String) -> GatewayResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GatewayError::Storage(format!("bad timestamp '{}': {}", raw, e)))
}

fn row_to_workspace(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Workspace, String)> {
    Ok((
        Workspace {
            id: row.get(0)?,
            slug: row.get(1)?,
            status: WorkspaceStatus::parse(&row.get::<_, String>(2)?)
                .unwrap_or(WorkspaceStatus::Active),
            created_at: Utc::now(),
        },
        row.get::<_, String>(3)?,
    ))
}

fn finish_workspace(pair: (Workspace, String)) -> GatewayResult<Workspace> {
    let (mut ws, created) = pair;
    ws.created_at = parse_time(created)?;
    Ok(ws)
}

fn row_to_usage(row: &rusqlite::Row<'_>) -> rusqlite::Result<(UsageRecord, String)> {
    Ok((
        UsageRecord {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            request_id: row.get(2)?,
            trace_id: row.get(3)?,
            api_key_id: row.get(4)?,
            provider_id: row.get(5)?,
            incoming_model: row.get(6)?,
            selected_model: row.get(7)?,
            prompt_tokens: row.get::<_, i64>(8)? as u32,
            completion_tokens: row.get::<_, i64>(9)? as u32,
            total_tokens: row.get::<_, i64>(10)? as u32,
            cost_usd: row.get(11)?,
            duration_ms: row.get::<_, i64>(12)? as u64,
            response_status: ResponseStatus::parse(&row.get::<_, String>(13)?)
                .unwrap_or(ResponseStatus::Error),
            created_at: Utc::now(),
        },
        row.get::<_, String>(14)?,
    ))
}

fn finish_usage(pair: (UsageRecord, String)) -> GatewayResult<UsageRecord> {
    let (mut record, created) = pair;
    record.created_at = parse_time(created)?;
    Ok(record)
}

const USAGE_COLUMNS: &str = "id, workspace_id, request_id, trace_id, api_key_id, provider_id, \
     incoming_model, selected_model, prompt_tokens, completion_tokens, total_tokens, cost_usd, \
     duration_ms, response_status, created_at";

/// Build a WHERE clause + positional params from a usage filter. All
/// parameters are TEXT; timestamps compare lexically as RFC 3339 UTC.
fn filter_clause(filter: &UsageFilter) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();
    if let Some(ws) = &filter.workspace_id {
        values.push(ws.clone());
        conditions.push(format!("workspace_id = ?{}", values.len()));
    }
    if let Some(key) = &filter.api_key_id {
        values.push(key.clone());
        conditions.push(format!("api_key_id = ?{}", values.len()));
    }
    if let Some(provider) = &filter.provider {
        values.push(provider.clone());
        conditions.push(format!("provider_id = ?{}", values.len()));
    }
    if let Some(model) = &filter.model {
        values.push(model.clone());
        conditions.push(format!(
            "(selected_model = ?{n} OR incoming_model = ?{n})",
            n = values.len()
        ));
    }
    if let Some(since) = filter.since {
        values.push(since.to_rfc3339());
        conditions.push(format!("created_at >= ?{}", values.len()));
    }
    if let Some(until) = filter.until {
        values.push(until.to_rfc3339());
        conditions.push(format!("created_at <= ?{}", values.len()));
    }
    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    (clause, values)
}

fn bucket_format(bucket: TimeBucket) -> &'static str {
    match bucket {
        TimeBucket::Hourly => "%Y-%m-%dT%H:00",
        TimeBucket::Daily => "%Y-%m-%d",
        TimeBucket::Weekly => "%Y-W%W",
        TimeBucket::Monthly => "%Y-%m",
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn driver(&self) -> &'static str {
        "sqlite"
    }

    async fn ping(&self) -> GatewayResult<()> {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    async fn create_workspace(&self, workspace: &Workspace) -> GatewayResult<()> {
        self.conn.lock().execute(
            "INSERT INTO workspaces (id, slug, status, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                workspace.id,
                workspace.slug,
                workspace.status.as_str(),
                workspace.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn workspace(&self, id: &str) -> GatewayResult<Option<Workspace>> {
        let pair = self
            .conn
            .lock()
            .query_row(
                "SELECT id, slug, status, created_at FROM workspaces WHERE id = ?1",
                params![id],
                row_to_workspace,
            )
            .optional()?;
        pair.map(finish_workspace).transpose()
    }

    async fn workspace_by_slug(&self, slug: &str) -> GatewayResult<Option<Workspace>> {
        let pair = self
            .conn
            .lock()
            .query_row(
                "SELECT id, slug, status, created_at FROM workspaces WHERE slug = ?1",
                params![slug],
                row_to_workspace,
            )
            .optional()?;
        pair.map(finish_workspace).transpose()
    }

    async fn list_workspaces(&self) -> GatewayResult<Vec<Workspace>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, slug, status, created_at FROM workspaces ORDER BY created_at")?;
        let rows = stmt.query_map([], row_to_workspace)?;
        let mut workspaces = Vec::new();
        for row in rows {
            workspaces.push(finish_workspace(row?)?);
        }
        Ok(workspaces)
    }

    async fn update_workspace_status(
        &self,
        id: &str,
        status: WorkspaceStatus,
    ) -> GatewayResult<()> {
        self.conn.lock().execute(
            "UPDATE workspaces SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    async fn delete_workspace(&self, id: &str) -> GatewayResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM workspaces WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn create_user(&self, user: &User) -> GatewayResult<()> {
        self.conn.lock().execute(
            "INSERT INTO users (id, workspace_id, email, password_hash, last_login_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id,
                user.workspace_id,
                user.email,
                user.password_hash,
                user.last_login_at.map(|t| t.to_rfc3339())
            ],
        )?;
        Ok(())
    }

    async fn user(&self, id: &str) -> GatewayResult<Option<User>> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT id, workspace_id, email, password_hash, last_login_at
                 FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        User {
                            id: row.get(0)?,
                            workspace_id: row.get(1)?,
                            email: row.get(2)?,
                            password_hash: row.get(3)?,
                            last_login_at: None,
                        },
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(mut user, login)| {
            user.last_login_at = login.map(parse_time).transpose()?;
            Ok(user)
        })
        .transpose()
    }

    async fn user_by_email(&self, workspace_id: &str, email: &str) -> GatewayResult<Option<User>> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT id, workspace_id, email, password_hash, last_login_at
                 FROM users WHERE workspace_id = ?1 AND email = ?2",
                params![workspace_id, email],
                |row| {
                    Ok((
                        User {
                            id: row.get(0)?,
                            workspace_id: row.get(1)?,
                            email: row.get(2)?,
                            password_hash: row.get(3)?,
                            last_login_at: None,
                        },
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(mut user, login)| {
            user.last_login_at = login.map(parse_time).transpose()?;
            Ok(user)
        })
        .transpose()
    }

    async fn touch_last_login(&self, id: &str) -> GatewayResult<()> {
        self.conn.lock().execute(
            "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    async fn insert_api_key(&self, key: &ApiKeyRecord) -> GatewayResult<()> {
        let allowed = key
            .allowed_models
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.lock().execute(
            "INSERT INTO api_keys
                 (id, workspace_id, name, key_hash, status, expires_at, allowed_models, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key.id,
                key.workspace_id,
                key.name,
                key.key_hash,
                key.status.as_str(),
                key.expires_at.map(|t| t.to_rfc3339()),
                allowed,
                key.created_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn api_key_by_hash(&self, key_hash: &str) -> GatewayResult<Option<ApiKeyRecord>> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT id, workspace_id, name, key_hash, status, expires_at, allowed_models, created_at
                 FROM api_keys WHERE key_hash = ?1",
                params![key_hash],
                api_key_from_row,
            )
            .optional()?;
        row.map(finish_api_key).transpose()
    }

    async fn list_api_keys(&self, workspace_id: &str) -> GatewayResult<Vec<ApiKeyRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, name, key_hash, status, expires_at, allowed_models, created_at
             FROM api_keys WHERE workspace_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![workspace_id], api_key_from_row)?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(finish_api_key(row?)?);
        }
        Ok(keys)
    }

    async fn update_api_key_status(&self, id: &str, status: ApiKeyStatus) -> GatewayResult<()> {
        self.conn.lock().execute(
            "UPDATE api_keys SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    async fn upsert_provider(&self, provider: &ProviderRecord) -> GatewayResult<()> {
        let health = provider.health.as_ref().map(Value::to_string);
        self.conn.lock().execute(
            "INSERT INTO providers
                 (id, workspace_id, slug, provider_type, base_url, credential_ref, status, health)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(workspace_id, slug) DO UPDATE SET
                 provider_type = excluded.provider_type,
                 base_url = excluded.base_url,
                 credential_ref = excluded.credential_ref,
                 status = excluded.status",
            params![
                provider.id,
                provider.workspace_id,
                provider.slug,
                provider.provider_type,
                provider.base_url,
                provider.credential_ref,
                provider.status,
                health
            ],
        )?;
        Ok(())
    }

    async fn list_providers(&self, workspace_id: &str) -> GatewayResult<Vec<ProviderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, slug, provider_type, base_url, credential_ref, status, health
             FROM providers WHERE workspace_id = ?1 ORDER BY slug",
        )?;
        let rows = stmt.query_map(params![workspace_id], |row| {
            Ok((
                ProviderRecord {
                    id: row.get(0)?,
                    workspace_id: row.get(1)?,
                    slug: row.get(2)?,
                    provider_type: row.get(3)?,
                    base_url: row.get(4)?,
                    credential_ref: row.get(5)?,
                    status: row.get(6)?,
                    health: None,
                },
                row.get::<_, Option<String>>(7)?,
            ))
        })?;
        let mut providers = Vec::new();
        for row in rows {
            let (mut provider, health) = row?;
            provider.health = health.as_deref().map(serde_json::from_str).transpose()?;
            providers.push(provider);
        }
        Ok(providers)
    }

    async fn update_provider_health(&self, id: &str, health: &Value) -> GatewayResult<()> {
        self.conn.lock().execute(
            "UPDATE providers SET health = ?1 WHERE id = ?2",
            params![health.to_string(), id],
        )?;
        Ok(())
    }

    async fn insert_usage(&self, records: &[UsageRecord]) -> GatewayResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO usage_records
                     (id, workspace_id, request_id, trace_id, api_key_id, provider_id,
                      incoming_model, selected_model, prompt_tokens, completion_tokens,
                      total_tokens, cost_usd, duration_ms, response_status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )?;
            for record in records {
                stmt.execute(params![
                    record.id,
                    record.workspace_id,
                    record.request_id,
                    record.trace_id,
                    record.api_key_id,
                    record.provider_id,
                    record.incoming_model,
                    record.selected_model,
                    record.prompt_tokens as i64,
                    record.completion_tokens as i64,
                    record.total_tokens as i64,
                    record.cost_usd,
                    record.duration_ms as i64,
                    record.response_status.as_str(),
                    record.created_at.to_rfc3339()
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn fetch_uncosted(&self, limit: u32) -> GatewayResult<Vec<UsageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records
             WHERE cost_usd IS NULL ORDER BY created_at ASC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_usage)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(finish_usage(row?)?);
        }
        Ok(records)
    }

    async fn fill_costs(&self, updates: &[(String, f64)]) -> GatewayResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE usage_records SET cost_usd = ?1 WHERE id = ?2 AND cost_usd IS NULL",
            )?;
            for (id, cost) in updates {
                match stmt.execute(params![cost, id]) {
                    Ok(n) => updated += n,
                    Err(e) => {
                        // Skip the row; the rest of the batch still commits.
                        warn!(id = %id, error = %e, "cost update failed for row");
                    }
                }
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    async fn query_usage(&self, filter: &UsageFilter) -> GatewayResult<Vec<UsageRecord>> {
        let (clause, values) = filter_clause(filter);
        let limit = filter.limit.unwrap_or(100);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_records {clause}
             ORDER BY created_at DESC LIMIT {limit}"
        ))?;
        let rows = stmt.query_map(params_from_iter(values), row_to_usage)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(finish_usage(row?)?);
        }
        Ok(records)
    }

    async fn usage_summary(&self, filter: &UsageFilter) -> GatewayResult<UsageSummary> {
        let (clause, values) = filter_clause(filter);
        let conn = self.conn.lock();
        let summary = conn.query_row(
            &format!(
                "SELECT COUNT(*),
                        COALESCE(SUM(total_tokens), 0),
                        COALESCE(SUM(cost_usd), 0.0),
                        COALESCE(AVG(duration_ms), 0.0),
                        COALESCE(AVG(CASE WHEN response_status <> 'success' THEN 1.0 ELSE 0.0 END), 0.0)
                 FROM usage_records {clause}"
            ),
            params_from_iter(values),
            |row| {
                Ok(UsageSummary {
                    request_count: row.get::<_, i64>(0)? as u64,
                    total_tokens: row.get::<_, i64>(1)? as u64,
                    total_cost_usd: row.get(2)?,
                    avg_duration_ms: row.get(3)?,
                    error_rate: row.get(4)?,
                })
            },
        )?;
        Ok(summary)
    }

    async fn usage_by_model(&self, filter: &UsageFilter) -> GatewayResult<Vec<ModelUsageRow>> {
        let (clause, values) = filter_clause(filter);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT selected_model, COUNT(*), COALESCE(SUM(total_tokens), 0),
                    COALESCE(SUM(cost_usd), 0.0)
             FROM usage_records {clause}
             GROUP BY selected_model ORDER BY COUNT(*) DESC"
        ))?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(ModelUsageRow {
                model: row.get(0)?,
                request_count: row.get::<_, i64>(1)? as u64,
                total_tokens: row.get::<_, i64>(2)? as u64,
                total_cost_usd: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    async fn usage_by_provider(
        &self,
        filter: &UsageFilter,
    ) -> GatewayResult<Vec<ProviderUsageRow>> {
        let (clause, values) = filter_clause(filter);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT provider_id, COUNT(*), COALESCE(SUM(total_tokens), 0),
                    COALESCE(SUM(cost_usd), 0.0)
             FROM usage_records {clause}
             GROUP BY provider_id ORDER BY COUNT(*) DESC"
        ))?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(ProviderUsageRow {
                provider: row.get(0)?,
                request_count: row.get::<_, i64>(1)? as u64,
                total_tokens: row.get::<_, i64>(2)? as u64,
                total_cost_usd: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    async fn usage_timeseries(
        &self,
        filter: &UsageFilter,
        bucket: TimeBucket,
    ) -> GatewayResult<Vec<TimeBucketRow>> {
        let (clause, values) = filter_clause(filter);
        let format = bucket_format(bucket);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT strftime('{format}', created_at) AS bucket, COUNT(*),
                    COALESCE(SUM(total_tokens), 0), COALESCE(SUM(cost_usd), 0.0)
             FROM usage_records {clause}
             GROUP BY bucket ORDER BY bucket"
        ))?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(TimeBucketRow {
                bucket: row.get(0)?,
                request_count: row.get::<_, i64>(1)? as u64,
                total_tokens: row.get::<_, i64>(2)? as u64,
                total_cost_usd: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    async fn insert_trace_events(&self, events: &[TraceEvent]) -> GatewayResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO trace_events
                     (trace_id, request_id, event_order, timestamp, stage, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for event in events {
                stmt.execute(params![
                    event.trace_id,
                    event.request_id,
                    event.event_order as i64,
                    event.timestamp.to_rfc3339(),
                    event.stage,
                    event.payload.to_string()
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn trace_events(&self, trace_id: &str) -> GatewayResult<Vec<TraceEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trace_id, request_id, event_order, timestamp, stage, payload
             FROM trace_events WHERE trace_id = ?1 ORDER BY event_order",
        )?;
        let rows = stmt.query_map(params![trace_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (trace_id, request_id, order, timestamp, stage, payload) = row?;
            events.push(TraceEvent {
                trace_id,
                request_id,
                event_order: order as u64,
                timestamp: parse_time(timestamp)?,
                stage,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(events)
    }
}

type ApiKeyRow = (ApiKeyRecord, Option<String>, Option<String>, String);

fn api_key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKeyRow> {
    Ok((
        ApiKeyRecord {
            id: row.get(0)?,
            workspace_id: row.get(1)?,
            name: row.get(2)?,
            key_hash: row.get(3)?,
            status: ApiKeyStatus::parse(&row.get::<_, String>(4)?).unwrap_or(ApiKeyStatus::Revoked),
            expires_at: None,
            allowed_models: None,
            created_at: Utc::now(),
        },
        row.get::<_, Option<String>>(5)?,
        row.get::<_, Option<String>>(6)?,
        row.get::<_, String>(7)?,
    ))
}

fn finish_api_key(row: ApiKeyRow) -> GatewayResult<ApiKeyRecord> {
    let (mut key, expires, allowed, created) = row;
    key.expires_at = expires.map(parse_time).transpose()?;
    key.allowed_models = allowed.as_deref().map(serde_json::from_str).transpose()?;
    key.created_at = parse_time(created)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workspace(id: &str, slug: &str) -> Workspace {
        Workspace {
            id: id.to_string(),
            slug: slug.to_string(),
            status: WorkspaceStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn usage(id: &str, workspace: &str, model: &str, cost: Option<f64>) -> UsageRecord {
        UsageRecord {
            id: id.to_string(),
            workspace_id: workspace.to_string(),
            request_id: format!("req-{}", id),
            trace_id: format!("trace-{}", id),
            api_key_id: "key-1".into(),
            provider_id: "openai".into(),
            incoming_model: model.to_string(),
            selected_model: model.to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            cost_usd: cost,
            duration_ms: 42,
            response_status: ResponseStatus::Success,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_migrations_apply_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        // Re-running the migration pass must be a no-op, not a failure.
        store.migrate().unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_workspace_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_workspace(&workspace("ws-1", "acme")).await.unwrap();

        let found = store.workspace_by_slug("acme").await.unwrap().unwrap();
        assert_eq!(found.id, "ws-1");
        assert_eq!(found.status, WorkspaceStatus::Active);
        assert!(store.workspace_by_slug("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_workspace_delete_cascades_usage() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_workspace(&workspace("ws-1", "acme")).await.unwrap();
        store
            .insert_usage(&[usage("u1", "ws-1", "gpt-4o", None)])
            .await
            .unwrap();

        store.delete_workspace("ws-1").await.unwrap();
        assert!(store.fetch_uncosted(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_api_key_lookup_by_hash() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_workspace(&workspace("ws-1", "acme")).await.unwrap();
        let key = ApiKeyRecord {
            id: "k1".into(),
            workspace_id: "ws-1".into(),
            name: "ci".into(),
            key_hash: "abc123".into(),
            status: ApiKeyStatus::Active,
            expires_at: None,
            allowed_models: Some(vec!["gpt-4o".into()]),
            created_at: Utc::now(),
        };
        store.insert_api_key(&key).await.unwrap();

        let found = store.api_key_by_hash("abc123").await.unwrap().unwrap();
        assert_eq!(found.id, "k1");
        assert_eq!(found.allowed_models, Some(vec!["gpt-4o".to_string()]));
        assert!(store.api_key_by_hash("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fill_costs_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_workspace(&workspace("ws-1", "acme")).await.unwrap();
        store
            .insert_usage(&[
                usage("u1", "ws-1", "gpt-4o", None),
                usage("u2", "ws-1", "gpt-4o", None),
            ])
            .await
            .unwrap();

        let updates = vec![("u1".to_string(), 0.5), ("u2".to_string(), 0.25)];
        assert_eq!(store.fill_costs(&updates).await.unwrap(), 2);
        // Only NULL -> value writes occur; the second run changes nothing.
        assert_eq!(store.fill_costs(&updates).await.unwrap(), 0);
        assert!(store.fetch_uncosted(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_uncosted_oldest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_workspace(&workspace("ws-1", "acme")).await.unwrap();
        let mut old = usage("old", "ws-1", "gpt-4o", None);
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        let new = usage("new", "ws-1", "gpt-4o", None);
        let costed = usage("done", "ws-1", "gpt-4o", Some(0.1));
        store.insert_usage(&[new, old, costed]).await.unwrap();

        let uncosted = store.fetch_uncosted(10).await.unwrap();
        assert_eq!(uncosted.len(), 2);
        assert_eq!(uncosted[0].id, "old");
        assert_eq!(uncosted[1].id, "new");
    }

    #[tokio::test]
    async fn test_usage_summary_and_groupings() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_workspace(&workspace("ws-1", "acme")).await.unwrap();
        let mut failed = usage("u3", "ws-1", "claude-3-haiku", Some(0.2));
        failed.response_status = ResponseStatus::Error;
        failed.provider_id = "anthropic".into();
        store
            .insert_usage(&[
                usage("u1", "ws-1", "gpt-4o", Some(0.5)),
                usage("u2", "ws-1", "gpt-4o", Some(0.3)),
                failed,
            ])
            .await
            .unwrap();

        let summary = store.usage_summary(&UsageFilter::default()).await.unwrap();
        assert_eq!(summary.request_count, 3);
        assert_eq!(summary.total_tokens, 45);
        assert!((summary.total_cost_usd - 1.0).abs() < 1e-9);
        assert!((summary.error_rate - 1.0 / 3.0).abs() < 1e-9);

        let by_model = store.usage_by_model(&UsageFilter::default()).await.unwrap();
        assert_eq!(by_model.len(), 2);
        assert_eq!(by_model[0].model, "gpt-4o");
        assert_eq!(by_model[0].request_count, 2);

        let by_provider = store
            .usage_by_provider(&UsageFilter::default())
            .await
            .unwrap();
        assert_eq!(by_provider.len(), 2);

        let series = store
            .usage_timeseries(&UsageFilter::default(), TimeBucket::Daily)
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].request_count, 3);
    }

    #[tokio::test]
    async fn test_trace_events_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        let events: Vec<TraceEvent> = (0..3)
            .map(|i| TraceEvent {
                trace_id: "t1".into(),
                request_id: "r1".into(),
                event_order: i,
                timestamp: Utc::now(),
                stage: "attempt.start".into(),
                payload: json!({"n": i}),
            })
            .collect();
        store.insert_trace_events(&events).await.unwrap();

        let found = store.trace_events("t1").await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[2].event_order, 2);
    }

    #[tokio::test]
    async fn test_migrate_down_removes_tables() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.migrate_down(1).unwrap();
        // usage_records is gone after rolling back migration 2.
        let err = store
            .insert_usage(&[usage("u1", "ws-1", "m", None)])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("usage_records"));
        // Re-applying brings it back.
        store.migrate().unwrap();
        store.create_workspace(&workspace("ws-1", "acme")).await.unwrap();
        store
            .insert_usage(&[usage("u1", "ws-1", "m", None)])
            .await
            .unwrap();
    }
}
