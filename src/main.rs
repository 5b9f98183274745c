//! Application entry point for the `coldchain-sentinel` service.
//!
//! Startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Establishing a PostgreSQL connection pool
//! - Creating the database schema if it does not exist
//! - Wiring the store, realtime emitter and engine services
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Binding the Axum HTTP server and serving requests
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `DB_POOL_MAX`, `LISTEN_PORT`, `MAX_BATCH_SIZE`, `ALERT_CREATE_RETRIES`,
//!   `CRITICAL_DELTA_CENTI`, `REALTIME_URL` – see [`config::load_from_env`]
//! - `APP_LOG_LEVEL` (optional) – log verbosity when `RUST_LOG` is unset (default: `debug`)
//! - `APP_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! This module follows the Explicit Module Boundary Pattern (EMBP): sibling
//! modules import shared types through the re-exports below, never through
//! each other's paths.
use std::{env, net::SocketAddr, sync::Arc};

use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use anyhow::Result;

mod adapter;
mod config;
mod emitter;
mod error;
mod ingestion;
mod lifecycle;
mod models;
mod routes;
mod schema;
mod state_machine;
mod store;
mod thresholds;
mod validation;

pub use config::Config;

// Re-exported for the sibling modules, so that refactoring one module does
// not ripple through the import paths of the others.
pub use adapter::{TemperatureUnit, UplinkPayload};
pub use emitter::{emit_best_effort, HttpEmitter, LogEmitter, RealtimeEmitter, RealtimeEvent};
pub use error::{EngineError, EngineResult};
pub use ingestion::{ManualReadingInput, ManualReadingOutcome, ReadingIngestionPipeline};
pub use lifecycle::{AcknowledgeResult, AlertLifecycleManager, ResolveResult};
pub use models::{
    from_scaled, to_scaled, AlarmStatus, Alert, AlertStatus, AuditAction, AuditEntry,
    CorrectiveAction, CorrectiveActionInput, EffectiveThresholds, IngestSummary, NewAlert,
    NewReading, Pagination, RawReading, ReadingSource, SensorReading, Severity, StoredReading,
    ThresholdChain, ThresholdConfig, TimeRange, Unit, UnitAlarmState,
};
pub use state_machine::{AlertAction, AlertEvaluator, Decision, EvaluationOutcome};
pub use store::{
    latest_per_unit, AcknowledgeOutcome, AppliedEvaluation, DecideFn, PgStore, ResolveOutcome,
    Store,
};
pub use thresholds::ThresholdResolver;
pub use validation::{validate_batch, validate_reading};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database: {}", cfg.masked_db_url());

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .connect(&cfg.db_url)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to connect to database '{}': {}",
                cfg.masked_db_url(),
                e
            )
        })?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool, cfg.alert_create_retries));
    let emitter: Arc<dyn RealtimeEmitter> = match &cfg.realtime_url {
        Some(url) => {
            tracing::info!("Publishing realtime events to {}", url);
            Arc::new(HttpEmitter::new(url.clone()))
        }
        None => Arc::new(LogEmitter),
    };

    // Build app from routes gateway (EMBP)
    let state = routes::AppState::new(store, emitter, &cfg);
    let app: Router = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR`:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by `APP_SPAN_EVENTS`:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level from `RUST_LOG`, else `APP_LOG_LEVEL`
///
/// Alert acknowledge/resolve records are logged under the `audit` target,
/// so `RUST_LOG=warn,audit=info` keeps the audit trail in quiet deployments.
fn init_tracing() {
    // ---
    let span_events = match env::var("APP_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("APP_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
