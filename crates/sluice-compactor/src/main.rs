//! # sluice-compactor
//!
//! Service and CLI for delete-artifact compaction.
//!
//! ## Modes
//!
//! - **Service Mode**: receives storage notifications over HTTP, dispatches
//!   compaction runs and redelivers due retry tickets in the background
//! - **Job Mode**: runs the convergence loop once for one table
//! - **Resolve Mode**: prints how a storage location maps to a table
//!
//! ## Endpoints
//!
//! - `POST /events` - Raw notification envelope, answered with a batch summary
//! - `GET /health` - Shallow liveness check (always 200)
//! - `GET /ready` - Readiness, unhealthy while the retry pump is failing
//! - `GET /metrics` - Prometheus metrics
//! - `GET /runs/{run_id}` - Status of one workflow run
//!
//! ## Usage
//!
//! ```bash
//! # Run as service
//! SLUICE_DELETE_SUFFIX=-deletes.parquet sluice-compactor serve \
//!     --maintenance-url http://maintenance:8080
//!
//! # Compact one table
//! sluice-compactor compact --table catalog.sales.orders \
//!     --maintenance-url http://maintenance:8080
//!
//! # Show where a key resolves
//! sluice-compactor resolve --bucket wh --key sales/orders/data/1-deletes.parquet
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use sluice_compactor::driver::{CompactionDriver, DriverSettings};
use sluice_compactor::job::DriverJob;
use sluice_compactor::maintenance::TableMaintenance;
use sluice_compactor::maintenance::http::HttpTableMaintenance;
use sluice_core::{
    CoordinatorConfig, LogFormat, ObjectStoreBackend, RunId, TableIdentifier, TableResolver,
    init_logging,
};
use sluice_flow::dispatcher::Dispatcher;
use sluice_flow::error::Error as FlowError;
use sluice_flow::inbound::parse_envelope;
use sluice_flow::lease::LockStore;
use sluice_flow::lease::memory::InMemoryLockStore;
use sluice_flow::lease::storage::StorageLockStore;
use sluice_flow::retry::RetryQueue;
use sluice_flow::retry::memory::InMemoryRetryQueue;
use sluice_flow::retry::storage::StorageRetryQueue;
use sluice_flow::workflow::Orchestrator;
use sluice_flow::workflow::local::LocalWorkflowStarter;

// ============================================================================
// CLI Arguments
// ============================================================================

/// Ceiling on retry delay, matching SQS.
const RETRY_QUEUE_MAX_DELAY: Duration = Duration::from_secs(900);
const RETRY_QUEUE_NAME: &str = "sluice-retries";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Json,
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => Self::Json,
            LogFormatArg::Pretty => Self::Pretty,
        }
    }
}

/// Sluice delete-artifact compactor.
#[derive(Debug, Parser)]
#[command(name = "sluice-compactor")]
#[command(about = "Serializes and runs delete-artifact compaction per table")]
#[command(version)]
struct Args {
    /// Log output format.
    #[arg(long, env = "SLUICE_LOG_FORMAT", value_enum, default_value = "json", global = true)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the event service.
    Serve {
        /// HTTP port.
        #[arg(long, env = "SLUICE_PORT", default_value = "8080")]
        port: u16,

        /// Base URL of the table maintenance service.
        #[arg(long, env = "SLUICE_MAINTENANCE_URL")]
        maintenance_url: String,

        /// Object storage URL for table leases and retry tickets
        /// (e.g. `s3://bucket/prefix`). Both are kept in memory when unset.
        #[arg(long, env = "SLUICE_LOCK_STORE_URL")]
        lock_store_url: Option<String>,

        /// Seconds between retry queue polls.
        #[arg(long, env = "SLUICE_RETRY_POLL_SECS", default_value = "5")]
        retry_poll_secs: u64,
    },

    /// Run the compaction loop once for one table.
    Compact {
        /// Table to compact (`catalog.database.table`).
        #[arg(long)]
        table: TableIdentifier,

        /// Base URL of the table maintenance service.
        #[arg(long, env = "SLUICE_MAINTENANCE_URL")]
        maintenance_url: String,

        /// Override the configured pass bound.
        #[arg(long)]
        max_passes: Option<u32>,
    },

    /// Print the resolver's decision for a storage location.
    Resolve {
        /// Bucket name.
        #[arg(long)]
        bucket: String,

        /// Object key.
        #[arg(long)]
        key: String,
    },
}

// ============================================================================
// Service State
// ============================================================================

#[derive(Debug)]
struct PumpHealth {
    /// Whether the service finished starting.
    ready: AtomicBool,
    /// Whether the last retry pump cycle succeeded.
    healthy: AtomicBool,
    /// Tickets redelivered since start.
    delivered: AtomicU64,
    /// Pump cycles that failed.
    failures: AtomicU64,
}

impl PumpHealth {
    fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

#[derive(Clone)]
struct ServiceState {
    dispatcher: Dispatcher,
    starter: LocalWorkflowStarter,
    prometheus: PrometheusHandle,
    health: Arc<PumpHealth>,
}

// ============================================================================
// HTTP Handlers
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    ready: bool,
    healthy: bool,
    active_runs: usize,
    retries_delivered: u64,
    retry_pump_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn error_body(error: &str, message: impl Into<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": error, "message": message.into() }))
}

/// GET /health - Shallow liveness check.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /ready - Readiness check.
async fn ready(State(state): State<ServiceState>) -> impl IntoResponse {
    let ready = state.health.ready.load(Ordering::Acquire);
    let healthy = state.health.healthy.load(Ordering::Acquire);
    let active_runs = state.starter.active_runs().unwrap_or_default();

    let message = if !ready {
        Some("Service starting up".to_string())
    } else if !healthy {
        Some("Retry queue pump is failing".to_string())
    } else {
        None
    };
    let status = if ready && healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready,
            healthy,
            active_runs,
            retries_delivered: state.health.delivered.load(Ordering::Relaxed),
            retry_pump_failures: state.health.failures.load(Ordering::Relaxed),
            message,
        }),
    )
}

/// GET /metrics - Prometheus text format.
async fn serve_metrics(State(state): State<ServiceState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// POST /events - Dispatch a raw notification envelope.
///
/// Returns:
/// - `200 OK` with the batch summary
/// - `400 Bad Request` if the body is not JSON
/// - `500 Internal Server Error` on infrastructure failure, so the caller redelivers
async fn events(State(state): State<ServiceState>, body: Bytes) -> impl IntoResponse {
    let events = match parse_envelope(&body) {
        Ok(events) => events,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, error_body("malformed_event", e.to_string()))
                .into_response();
        }
    };

    match state.dispatcher.handle_batch(events).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "dispatch failed; delivery will be retried");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("dispatch_failed", e.to_string()),
            )
                .into_response()
        }
    }
}

/// GET /runs/{run_id} - Workflow run status.
async fn run_status(
    State(state): State<ServiceState>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    let Ok(run_id) = run_id.parse::<RunId>() else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("invalid_run_id", format!("'{run_id}' is not a run id")),
        )
            .into_response();
    };

    match state.starter.status(run_id) {
        Ok(run) => (StatusCode::OK, Json(run)).into_response(),
        Err(FlowError::RunNotFound { .. }) => (
            StatusCode::NOT_FOUND,
            error_body("run_not_found", format!("run {run_id} is unknown")),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("internal", e.to_string()),
        )
            .into_response(),
    }
}

// ============================================================================
// Retry Pump
// ============================================================================

async fn run_retry_pump(dispatcher: Dispatcher, health: Arc<PumpHealth>, interval: Duration) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        timer.tick().await;
        match dispatcher.pump_retries().await {
            Ok(delivered) => {
                health.healthy.store(true, Ordering::Release);
                health
                    .delivered
                    .fetch_add(u64::try_from(delivered).unwrap_or(u64::MAX), Ordering::Relaxed);
                if delivered > 0 {
                    tracing::info!(delivered, "retry tickets redelivered");
                }
            }
            Err(e) => {
                health.healthy.store(false, Ordering::Release);
                health.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "retry pump failed");
            }
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

fn driver(config: &CoordinatorConfig, maintenance_url: &str) -> Result<CompactionDriver> {
    let maintenance: Arc<dyn TableMaintenance> = Arc::new(
        HttpTableMaintenance::new(maintenance_url).context("invalid maintenance service")?,
    );
    Ok(CompactionDriver::new(
        maintenance,
        DriverSettings::from(config),
    ))
}

/// Lease store and retry queue, both in object storage when a URL is given.
fn coordination(url: Option<&str>) -> Result<(Arc<dyn LockStore>, Arc<dyn RetryQueue>)> {
    match url {
        Some(url) => {
            let backend = Arc::new(
                ObjectStoreBackend::from_url(url)
                    .with_context(|| format!("invalid coordination store url '{url}'"))?,
            );
            tracing::info!(url, "using object storage leases and retry queue");
            let locks: Arc<dyn LockStore> = Arc::new(StorageLockStore::new(Arc::clone(&backend)));
            let queue: Arc<dyn RetryQueue> = Arc::new(
                StorageRetryQueue::new(backend, RETRY_QUEUE_NAME)
                    .with_max_delay(RETRY_QUEUE_MAX_DELAY),
            );
            Ok((locks, queue))
        }
        None => {
            tracing::warn!(
                "SLUICE_LOCK_STORE_URL unset; leases and retry tickets are kept in memory"
            );
            let locks: Arc<dyn LockStore> = Arc::new(InMemoryLockStore::new());
            let queue: Arc<dyn RetryQueue> = Arc::new(
                InMemoryRetryQueue::new(RETRY_QUEUE_NAME).with_max_delay(RETRY_QUEUE_MAX_DELAY),
            );
            Ok((locks, queue))
        }
    }
}

async fn serve(
    config: CoordinatorConfig,
    port: u16,
    maintenance_url: &str,
    lock_store_url: Option<&str>,
    retry_poll: Duration,
) -> Result<()> {
    let prometheus = sluice_compactor::metrics::install_prometheus()
        .map_err(|e| anyhow!("failed to install prometheus recorder: {e}"))?;

    let job = DriverJob::new(driver(&config, maintenance_url)?);
    let starter = LocalWorkflowStarter::new(Orchestrator::new(Arc::new(job), config.job_timeout));
    let (locks, queue) = coordination(lock_store_url)?;
    let dispatcher = Dispatcher::from_config(&config, locks, queue, Arc::new(starter.clone()));

    tracing::info!(
        port,
        delete_suffix = %config.delete_suffix,
        max_passes = config.max_passes,
        lock_ttl_secs = config.lock_ttl.as_secs(),
        retry_delay_secs = config.retry_delay.as_secs(),
        "Starting sluice compactor service"
    );

    let pump = Arc::new(PumpHealth::new());
    let state = ServiceState {
        dispatcher: dispatcher.clone(),
        starter,
        prometheus,
        health: Arc::clone(&pump),
    };

    let router = Router::new()
        .route("/events", post(events))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(serve_metrics))
        .route("/runs/{run_id}", get(run_status))
        .with_state(state);

    let pump_health = Arc::clone(&pump);
    tokio::spawn(async move {
        run_retry_pump(dispatcher, pump_health, retry_poll).await;
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    pump.ready.store(true, Ordering::Release);
    tracing::info!(address = %addr, "Listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn compact(
    config: &CoordinatorConfig,
    table: &TableIdentifier,
    maintenance_url: &str,
    max_passes: Option<u32>,
) -> Result<()> {
    let driver = driver(config, maintenance_url)?;
    let max_passes = max_passes.unwrap_or(config.max_passes);

    let report = tokio::time::timeout(config.job_timeout, driver.run(table, max_passes))
        .await
        .map_err(|_| anyhow!("compaction of {table} exceeded {:?}", config.job_timeout))??;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn resolve(config: &CoordinatorConfig, bucket: &str, key: &str) -> Result<()> {
    let resolver = TableResolver::new(config.resolver.clone());
    let decision = match resolver.resolve(bucket, key) {
        Ok(resolved) => serde_json::json!({ "resolved": resolved }),
        Err(rejection) => serde_json::json!({ "rejected": rejection }),
    };
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format.into());

    let config = CoordinatorConfig::from_env().context("invalid configuration")?;

    match args.command {
        Commands::Serve {
            port,
            ref maintenance_url,
            ref lock_store_url,
            retry_poll_secs,
        } => {
            serve(
                config,
                port,
                maintenance_url,
                lock_store_url.as_deref(),
                Duration::from_secs(retry_poll_secs.max(1)),
            )
            .await
        }
        Commands::Compact {
            ref table,
            ref maintenance_url,
            max_passes,
        } => compact(&config, table, maintenance_url, max_passes).await,
        Commands::Resolve {
            ref bucket,
            ref key,
        } => resolve(&config, bucket, key),
    }
}
