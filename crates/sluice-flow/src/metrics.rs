//! Coordination metrics.
//!
//! Recorded through the `metrics` facade; without an installed recorder
//! every call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `sluice_dispatch_outcomes_total` | Counter | `outcome` | Dispatcher decisions |
//! | `sluice_retry_enqueues_total` | Counter | `result` | Retry ticket admissions |
//! | `sluice_retry_queue_depth` | Gauge | `queue` | Tickets held by the retry queue |
//! | `sluice_workflow_runs_total` | Counter | `state` | Workflow runs by terminal state |
//! | `sluice_workflow_run_duration_seconds` | Histogram | `state` | Job wall-clock time |
//! | `sluice_workflow_active_runs` | Gauge | - | Runs currently executing |

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::workflow::RunState;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Dispatcher decisions by outcome.
    pub const DISPATCH_OUTCOMES_TOTAL: &str = "sluice_dispatch_outcomes_total";
    /// Counter: Retry ticket admissions by result.
    pub const RETRY_ENQUEUES_TOTAL: &str = "sluice_retry_enqueues_total";
    /// Gauge: Tickets held by the retry queue.
    pub const RETRY_QUEUE_DEPTH: &str = "sluice_retry_queue_depth";
    /// Counter: Workflow runs by terminal state.
    pub const WORKFLOW_RUNS_TOTAL: &str = "sluice_workflow_runs_total";
    /// Histogram: Workflow run duration in seconds.
    pub const WORKFLOW_RUN_DURATION_SECONDS: &str = "sluice_workflow_run_duration_seconds";
    /// Gauge: Runs currently executing.
    pub const WORKFLOW_ACTIVE_RUNS: &str = "sluice_workflow_active_runs";
}

/// Label keys used across metrics.
pub mod labels {
    /// Dispatcher outcome (started, retried, skipped, rejected).
    pub const OUTCOME: &str = "outcome";
    /// Result status (enqueued, queue_full, error).
    pub const RESULT: &str = "result";
    /// Queue name.
    pub const QUEUE: &str = "queue";
    /// Run state.
    pub const STATE: &str = "state";
}

/// Records coordination metrics. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records a dispatcher decision.
    pub fn record_outcome(&self, outcome: &'static str) {
        counter!(names::DISPATCH_OUTCOMES_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records a retry ticket admission attempt.
    pub fn record_retry_enqueue(&self, result: &'static str) {
        counter!(names::RETRY_ENQUEUES_TOTAL, labels::RESULT => result).increment(1);
    }

    /// Sets the retry queue depth.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        gauge!(names::RETRY_QUEUE_DEPTH, labels::QUEUE => queue.to_string()).set(depth as f64);
    }

    /// Marks a run as executing.
    pub fn run_started(&self) {
        gauge!(names::WORKFLOW_ACTIVE_RUNS).increment(1.0);
    }

    /// Records a run reaching a terminal state.
    pub fn run_finished(&self, state: RunState, elapsed: Duration) {
        let state = state.to_string();
        gauge!(names::WORKFLOW_ACTIVE_RUNS).decrement(1.0);
        counter!(names::WORKFLOW_RUNS_TOTAL, labels::STATE => state.clone()).increment(1);
        histogram!(names::WORKFLOW_RUN_DURATION_SECONDS, labels::STATE => state)
            .record(elapsed.as_secs_f64());
    }
}
