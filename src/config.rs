//! Configuration loader for the `coldchain-sentinel` service.
//!
//! Loads runtime configuration from environment variables (with optional
//! `.env` file support provided by the caller) so that `env::var` calls do
//! not spread across the codebase.
//!
use std::env;

use anyhow::{anyhow, Result};

/// Parse an optional numeric environment variable with a default value.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// HTTP listen port.
    pub listen_port: u16,

    /// Largest accepted bulk ingestion batch.
    pub max_batch_size: usize,

    /// Attempts at creating an alert before giving up on a conflicting unit.
    pub alert_create_retries: u32,

    /// Excess past a limit, in hundredths of a degree, at which an alert is
    /// critical rather than warning.
    pub critical_delta_centi: i32,

    /// Base URL of the realtime relay. `None` means events are only logged.
    pub realtime_url: Option<String>,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `LISTEN_PORT` – HTTP port (default: 8080)
/// - `MAX_BATCH_SIZE` – readings per bulk call (default: 1000)
/// - `ALERT_CREATE_RETRIES` – alert creation attempts (default: 3)
/// - `CRITICAL_DELTA_CENTI` – critical severity delta (default: 300, i.e. 3 °C)
/// - `REALTIME_URL` – realtime relay base URL (default: unset)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env!("DB_POOL_MAX", u32, 5);
    let listen_port = parse_env!("LISTEN_PORT", u16, 8080);
    let max_batch_size = parse_env!("MAX_BATCH_SIZE", usize, 1000);
    let alert_create_retries = parse_env!("ALERT_CREATE_RETRIES", u32, 3);
    let critical_delta_centi = parse_env!("CRITICAL_DELTA_CENTI", i32, 300);
    let realtime_url = env::var("REALTIME_URL")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    if max_batch_size == 0 {
        return Err(anyhow!("MAX_BATCH_SIZE must be at least 1"));
    }
    if alert_create_retries == 0 {
        return Err(anyhow!("ALERT_CREATE_RETRIES must be at least 1"));
    }
    if critical_delta_centi <= 0 {
        return Err(anyhow!("CRITICAL_DELTA_CENTI must be positive"));
    }

    Ok(Config {
        db_url,
        db_pool_max,
        listen_port,
        max_batch_size,
        alert_create_retries,
        critical_delta_centi,
        realtime_url,
    })
}

/// Replace the password of a connection URL with `****`.
fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
        }
    }
    db_url.to_string()
}

impl Config {
    /// Log the loaded configuration, masking the database password.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL         : {}", mask_db_url(&self.db_url));
        tracing::info!("  DB_POOL_MAX          : {}", self.db_pool_max);
        tracing::info!("  LISTEN_PORT          : {}", self.listen_port);
        tracing::info!("  MAX_BATCH_SIZE       : {}", self.max_batch_size);
        tracing::info!("  ALERT_CREATE_RETRIES : {}", self.alert_create_retries);
        tracing::info!("  CRITICAL_DELTA_CENTI : {}", self.critical_delta_centi);
        tracing::info!(
            "  REALTIME_URL         : {}",
            self.realtime_url.as_deref().unwrap_or("(unset, log only)")
        );
    }

    /// Masked connection string, safe to log.
    pub fn masked_db_url(&self) -> String {
        mask_db_url(&self.db_url)
    }
}
