//! Environment configuration
//!
//! The gateway is configured entirely through `RAD_*` environment
//! variables; there is no config file apart from the optional route table
//! JSON pointed to by `RAD_ROUTES_FILE`.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

/// Server-side timeouts. `read_header` and `idle` apply at the
/// connection layer in `server::serve`; `read` bounds handler futures
/// via the timeout layers; `write` is the per-request gateway deadline.
#[derive(Debug, Clone, Copy)]
pub struct ServerTimeouts {
    pub read_header: Duration,
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            read_header: Duration::from_secs(5),
            read: Duration::from_secs(15),
            write: Duration::from_secs(30),
            idle: Duration::from_secs(60),
        }
    }
}

/// Database backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbDriver {
    Sqlite,
    Postgres,
}

impl DbDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbDriver::Sqlite => "sqlite",
            DbDriver::Postgres => "postgres",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub driver: DbDriver,
    pub dsn: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Duration,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
}

/// Upstream credentials for the built-in provider adapters.
#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub gemini: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub public_base_url: String,
    pub db: Option<DbConfig>,
    pub redis: Option<RedisConfig>,
    /// Bootstrap API keys (`name -> secret`) usable without a database.
    pub bootstrap_keys: Vec<(String, String)>,
    /// Seed admin login (`email:password`) created in the default
    /// workspace on first start.
    pub admin_user: Option<(String, String)>,
    pub jwt_secret: Option<String>,
    pub routes_file: Option<PathBuf>,
    pub retry_budget: u32,
    pub provider_keys: ProviderKeys,
    /// CORS origins; empty means allow-all (dev default).
    pub cors_origins: Vec<String>,
    pub timeouts: ServerTimeouts,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8090".parse().unwrap(),
            log_level: "info".to_string(),
            public_base_url: "http://localhost:8090".to_string(),
            db: None,
            redis: None,
            bootstrap_keys: Vec::new(),
            admin_user: None,
            jwt_secret: None,
            routes_file: None,
            retry_budget: 2,
            provider_keys: ProviderKeys::default(),
            cors_origins: Vec::new(),
            timeouts: ServerTimeouts::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = GatewayConfig::default();

        if let Ok(addr) = env::var("RAD_LISTEN_ADDR") {
            config.listen_addr = parse_listen_addr(&addr)
                .with_context(|| format!("invalid RAD_LISTEN_ADDR '{}'", addr))?;
        }
        if let Ok(level) = env::var("RAD_LOG_LEVEL") {
            match level.as_str() {
                "debug" | "info" | "warn" | "error" => config.log_level = level,
                other => bail!("invalid RAD_LOG_LEVEL '{}'", other),
            }
        }
        if let Ok(url) = env::var("RAD_PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        config.db = db_config_from_env()?;
        config.redis = redis_config_from_env()?;

        if let Ok(keys) = env::var("RAD_API_KEYS") {
            config.bootstrap_keys = parse_bootstrap_keys(&keys)?;
        }
        if let Ok(raw) = env::var("RAD_ADMIN_USER") {
            let (email, password) = raw
                .split_once(':')
                .with_context(|| "invalid RAD_ADMIN_USER (expected email:password)")?;
            config.admin_user = Some((email.to_string(), password.to_string()));
        }
        config.jwt_secret = env::var("RAD_JWT_SECRET").ok().filter(|s| !s.is_empty());
        config.routes_file = env::var("RAD_ROUTES_FILE").ok().map(PathBuf::from);

        if let Ok(budget) = env::var("RAD_RETRY_BUDGET") {
            config.retry_budget = budget
                .parse()
                .with_context(|| format!("invalid RAD_RETRY_BUDGET '{}'", budget))?;
        }

        config.provider_keys = ProviderKeys {
            openai: env::var("RAD_OPENAI_API_KEY").ok().filter(|s| !s.is_empty()),
            anthropic: env::var("RAD_ANTHROPIC_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            gemini: env::var("RAD_GEMINI_API_KEY").ok().filter(|s| !s.is_empty()),
        };

        if let Ok(origins) = env::var("RAD_CORS_ORIGINS") {
            config.cors_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        Ok(config)
    }
}

/// Accept `":8090"` as shorthand for all interfaces, like the original
/// deployment configs did.
fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    Ok(addr.parse()?)
}

fn db_config_from_env() -> anyhow::Result<Option<DbConfig>> {
    let driver = match env::var("RAD_DB_DRIVER") {
        Ok(d) => d,
        Err(_) => return Ok(None),
    };
    let driver = match driver.as_str() {
        "sqlite" => DbDriver::Sqlite,
        "postgres" => DbDriver::Postgres,
        other => bail!("invalid RAD_DB_DRIVER '{}' (expected sqlite|postgres)", other),
    };
    let dsn = env::var("RAD_DB_DSN").unwrap_or_else(|_| match driver {
        DbDriver::Sqlite => "rad-gateway.db".to_string(),
        DbDriver::Postgres => String::new(),
    });
    if driver == DbDriver::Postgres && dsn.is_empty() {
        bail!("RAD_DB_DRIVER=postgres requires RAD_DB_DSN");
    }

    let max_open_conns = env_parse("RAD_DB_MAX_OPEN_CONNS", 10)?;
    let max_idle_conns = env_parse("RAD_DB_MAX_IDLE_CONNS", 3)?;
    let lifetime_secs: u64 = env_parse("RAD_DB_CONN_MAX_LIFETIME", 300)?;

    Ok(Some(DbConfig {
        driver,
        dsn,
        max_open_conns,
        max_idle_conns,
        conn_max_lifetime: Duration::from_secs(lifetime_secs),
    }))
}

fn redis_config_from_env() -> anyhow::Result<Option<RedisConfig>> {
    let addr = match env::var("RAD_REDIS_ADDR") {
        Ok(a) if !a.is_empty() => a,
        _ => return Ok(None),
    };
    Ok(Some(RedisConfig {
        addr,
        password: env::var("RAD_REDIS_PASSWORD").ok().filter(|s| !s.is_empty()),
        db: env_parse("RAD_REDIS_DB", 0)?,
    }))
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {} '{}': {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}

/// Parse `name:secret[,name:secret]*`; duplicate names are rejected so a
/// typo cannot silently shadow a key.
fn parse_bootstrap_keys(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut seen = HashMap::new();
    let mut keys = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, secret) = entry
            .split_once(':')
            .with_context(|| format!("invalid RAD_API_KEYS entry '{}'", entry))?;
        if name.is_empty() || secret.is_empty() {
            bail!("invalid RAD_API_KEYS entry '{}'", entry);
        }
        if seen.insert(name.to_string(), ()).is_some() {
            bail!("duplicate RAD_API_KEYS name '{}'", name);
        }
        keys.push((name.to_string(), secret.to_string()));
    }
    Ok(keys)
}
