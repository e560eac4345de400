//! Compactor metrics and the Prometheus exporter.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `sluice_compaction_passes_total` | Counter | `result` | Passes by completed/failed |
//! | `sluice_compaction_runs_total` | Counter | `termination` | Runs by termination reason |
//! | `sluice_compaction_run_duration_seconds` | Histogram | `termination` | Driver wall-clock time |
//! | `sluice_compaction_final_delete_count` | Gauge | `table` | Last observed delete count |

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use sluice_core::TableIdentifier;
use sluice_flow::metrics::names as flow_names;

use crate::driver::Termination;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Compaction passes by result.
    pub const COMPACTION_PASSES_TOTAL: &str = "sluice_compaction_passes_total";
    /// Counter: Compaction runs by termination reason.
    pub const COMPACTION_RUNS_TOTAL: &str = "sluice_compaction_runs_total";
    /// Histogram: Compaction run duration in seconds.
    pub const COMPACTION_RUN_DURATION_SECONDS: &str = "sluice_compaction_run_duration_seconds";
    /// Gauge: Last observed delete count per table.
    pub const COMPACTION_FINAL_DELETE_COUNT: &str = "sluice_compaction_final_delete_count";
}

/// Label keys used across metrics.
pub mod labels {
    /// Pass result (completed, failed).
    pub const RESULT: &str = "result";
    /// Termination reason.
    pub const TERMINATION: &str = "termination";
    /// Table identifier.
    pub const TABLE: &str = "table";
}

/// Records compaction metrics. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CompactorMetrics;

impl CompactorMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records one pass.
    pub fn record_pass(&self, completed: bool) {
        let result = if completed { "completed" } else { "failed" };
        counter!(names::COMPACTION_PASSES_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Records a finished run.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_run(
        &self,
        table: &TableIdentifier,
        termination: Termination,
        final_delete_count: u64,
        elapsed: Duration,
    ) {
        let termination = termination.as_str();
        counter!(names::COMPACTION_RUNS_TOTAL, labels::TERMINATION => termination).increment(1);
        histogram!(names::COMPACTION_RUN_DURATION_SECONDS, labels::TERMINATION => termination)
            .record(elapsed.as_secs_f64());
        gauge!(names::COMPACTION_FINAL_DELETE_COUNT, labels::TABLE => table.to_string())
            .set(final_delete_count as f64);
    }
}

/// Installs the global Prometheus recorder and describes every metric.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed.
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(
        flow_names::DISPATCH_OUTCOMES_TOTAL,
        "Dispatcher decisions by outcome"
    );
    describe_counter!(
        flow_names::RETRY_ENQUEUES_TOTAL,
        "Retry ticket admissions by result"
    );
    describe_gauge!(flow_names::RETRY_QUEUE_DEPTH, "Tickets held by the retry queue");
    describe_counter!(
        flow_names::WORKFLOW_RUNS_TOTAL,
        "Workflow runs by terminal state"
    );
    describe_histogram!(
        flow_names::WORKFLOW_RUN_DURATION_SECONDS,
        "Workflow run duration in seconds"
    );
    describe_gauge!(flow_names::WORKFLOW_ACTIVE_RUNS, "Runs currently executing");
    describe_counter!(names::COMPACTION_PASSES_TOTAL, "Compaction passes by result");
    describe_counter!(
        names::COMPACTION_RUNS_TOTAL,
        "Compaction runs by termination reason"
    );
    describe_histogram!(
        names::COMPACTION_RUN_DURATION_SECONDS,
        "Compaction run duration in seconds"
    );
    describe_gauge!(
        names::COMPACTION_FINAL_DELETE_COUNT,
        "Last observed delete file count per table"
    );

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}
