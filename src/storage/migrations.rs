//! Schema migrations
//!
//! Migrations are forward-only in normal operation; `down` SQL exists for
//! operator-initiated rollback. Each applied version is recorded in
//! `schema_migrations` together with a checksum of its SQL; a checksum
//! mismatch on startup aborts before any further migration runs.

use sha2::{Digest, Sha256};

use crate::error::{GatewayError, GatewayResult};

/// One schema migration, carried in both SQL dialects.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sqlite_up: &'static str,
    pub postgres_up: &'static str,
    pub sqlite_down: &'static str,
    pub postgres_down: &'static str,
}

impl Migration {
    /// Checksum over both dialects so a drive-by edit to either is caught
    /// regardless of which backend recorded the row.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sqlite_up.as_bytes());
        hasher.update(self.postgres_up.as_bytes());
        hex::encode(hasher.finalize())
    }
}

pub const SCHEMA_MIGRATIONS_SQLITE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    checksum TEXT NOT NULL,
    applied_at TEXT NOT NULL
)";

pub const SCHEMA_MIGRATIONS_POSTGRES: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version BIGINT PRIMARY KEY,
    checksum TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL
)";

pub fn migrations() -> &'static [Migration] {
    &[
        Migration {
            version: 1,
            name: "tenancy",
            sqlite_up: "
                CREATE TABLE workspaces (
                    id TEXT PRIMARY KEY,
                    slug TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE users (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    email TEXT NOT NULL,
                    password_hash TEXT NOT NULL,
                    last_login_at TEXT,
                    UNIQUE(workspace_id, email)
                );
                CREATE TABLE api_keys (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    key_hash TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL,
                    expires_at TEXT,
                    allowed_models TEXT,
                    created_at TEXT NOT NULL
                );
                CREATE TABLE providers (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    slug TEXT NOT NULL,
                    provider_type TEXT NOT NULL,
                    base_url TEXT NOT NULL,
                    credential_ref TEXT,
                    status TEXT NOT NULL,
                    health TEXT,
                    UNIQUE(workspace_id, slug)
                );
            ",
            postgres_up: "
                CREATE TABLE workspaces (
                    id TEXT PRIMARY KEY,
                    slug TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                );
                CREATE TABLE users (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    email TEXT NOT NULL,
                    password_hash TEXT NOT NULL,
                    last_login_at TIMESTAMPTZ,
                    UNIQUE(workspace_id, email)
                );
                CREATE TABLE api_keys (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    key_hash TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL,
                    expires_at TIMESTAMPTZ,
                    allowed_models TEXT,
                    created_at TIMESTAMPTZ NOT NULL
                );
                CREATE TABLE providers (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    slug TEXT NOT NULL,
                    provider_type TEXT NOT NULL,
                    base_url TEXT NOT NULL,
                    credential_ref TEXT,
                    status TEXT NOT NULL,
                    health TEXT,
                    UNIQUE(workspace_id, slug)
                );
            ",
            sqlite_down: "
                DROP TABLE providers;
                DROP TABLE api_keys;
                DROP TABLE users;
                DROP TABLE workspaces;
            ",
            postgres_down: "
                DROP TABLE providers;
                DROP TABLE api_keys;
                DROP TABLE users;
                DROP TABLE workspaces;
            ",
        },
        Migration {
            version: 2,
            name: "usage_and_traces",
            sqlite_up: "
                CREATE TABLE usage_records (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    request_id TEXT NOT NULL,
                    trace_id TEXT NOT NULL,
                    api_key_id TEXT NOT NULL,
                    provider_id TEXT NOT NULL,
                    incoming_model TEXT NOT NULL,
                    selected_model TEXT NOT NULL,
                    prompt_tokens INTEGER NOT NULL,
                    completion_tokens INTEGER NOT NULL,
                    total_tokens INTEGER NOT NULL,
                    cost_usd REAL,
                    duration_ms INTEGER NOT NULL,
                    response_status TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX idx_usage_workspace_time
                    ON usage_records(workspace_id, created_at);
                CREATE INDEX idx_usage_uncosted
                    ON usage_records(created_at) WHERE cost_usd IS NULL;
                CREATE TABLE trace_events (
                    trace_id TEXT NOT NULL,
                    request_id TEXT NOT NULL,
                    event_order INTEGER NOT NULL,
                    timestamp TEXT NOT NULL,
                    stage TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY(trace_id, event_order)
                );
            ",
            postgres_up: "
                CREATE TABLE usage_records (
                    id TEXT PRIMARY KEY,
                    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
                    request_id TEXT NOT NULL,
                    trace_id TEXT NOT NULL,
                    api_key_id TEXT NOT NULL,
                    provider_id TEXT NOT NULL,
                    incoming_model TEXT NOT NULL,
                    selected_model TEXT NOT NULL,
                    prompt_tokens INTEGER NOT NULL,
                    completion_tokens INTEGER NOT NULL,
                    total_tokens INTEGER NOT NULL,
                    cost_usd DOUBLE PRECISION,
                    duration_ms BIGINT NOT NULL,
                    response_status TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                );
                CREATE INDEX idx_usage_workspace_time
                    ON usage_records(workspace_id, created_at);
                CREATE INDEX idx_usage_uncosted
                    ON usage_records(created_at) WHERE cost_usd IS NULL;
                CREATE TABLE trace_events (
                    trace_id TEXT NOT NULL,
                    request_id TEXT NOT NULL,
                    event_order BIGINT NOT NULL,
                    timestamp TIMESTAMPTZ NOT NULL,
                    stage TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY(trace_id, event_order)
                );
            ",
            sqlite_down: "
                DROP TABLE trace_events;
                DROP TABLE usage_records;
            ",
            postgres_down: "
                DROP TABLE trace_events;
                DROP TABLE usage_records;
            ",
        },
    ]
}

/// Compare a recorded checksum against the current migration source.
pub fn verify_checksum(migration: &Migration, recorded: &str) -> GatewayResult<()> {
    let current = migration.checksum();
    if current != recorded {
        return Err(GatewayError::Storage(format!(
            "migration {} ({}) checksum mismatch: recorded {}, source {}",
            migration.version, migration.name, recorded, current
        )));
    }
    Ok(())
}
