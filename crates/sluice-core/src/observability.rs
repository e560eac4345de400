//! Logging initialisation and span helpers.
//!
//! All sluice components log through `tracing`. Dispatches and compaction
//! runs get their own spans so a single table's history can be followed
//! across retries.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops. `RUST_LOG`
/// controls levels and defaults to `info`.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Span for one dispatcher decision.
#[must_use]
pub fn dispatch_span(bucket: &str, key: &str) -> Span {
    tracing::info_span!("dispatch", bucket = bucket, key = key)
}

/// Span for one compaction run against a table.
#[must_use]
pub fn compaction_span(table: &str) -> Span {
    tracing::info_span!("compaction", table = table)
}
