//! Single-step workflow orchestration.
//!
//! A workflow run is `Start → RunCompactionJob → End`: it receives a table,
//! runs exactly one [`CompactionJob`] to completion under a wall-clock
//! timeout and surfaces the terminal status. The orchestrator knows nothing
//! about table leases; overlapping runs for one table are prevented by the
//! dispatcher before a run is ever started.
//!
//! ## State Machine
//!
//! ```text
//! PENDING ──► RUNNING ──┬──► SUCCEEDED
//!                       ├──► FAILED
//!                       └──► TIMED_OUT
//! ```

pub mod local;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::{ResolvedTable, RunId, TableIdentifier, WarehouseRoot};

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;

/// Parameters of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInput {
    /// Table to compact.
    pub table_id: TableIdentifier,
    /// Warehouse the table lives in.
    pub warehouse_root: WarehouseRoot,
}

impl WorkflowInput {
    /// Creates a workflow input.
    #[must_use]
    pub const fn new(table_id: TableIdentifier, warehouse_root: WarehouseRoot) -> Self {
        Self {
            table_id,
            warehouse_root,
        }
    }
}

impl From<ResolvedTable> for WorkflowInput {
    fn from(resolved: ResolvedTable) -> Self {
        Self::new(resolved.table_id, resolved.warehouse_root)
    }
}

/// Run execution state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Created, waiting to start.
    #[default]
    Pending,
    /// The compaction job is executing.
    Running,
    /// The job exited successfully.
    Succeeded,
    /// The job returned an error.
    Failed,
    /// The job exceeded its wall-clock bound.
    TimedOut,
}

impl RunState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running),
            Self::Running => matches!(target, Self::Succeeded | Self::Failed | Self::TimedOut),
            Self::Succeeded | Self::Failed | Self::TimedOut => false,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// What a finished compaction job reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    /// Delete-artifact count observed last.
    pub final_delete_count: u64,
    /// Passes executed.
    pub passes: u32,
    /// Why the job stopped, in the job's own vocabulary.
    pub termination: String,
    /// Full job-specific report.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

/// A job failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    /// Description of the failure.
    pub message: String,
}

impl JobError {
    /// Creates a job error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The long-running unit of work a run executes.
#[async_trait]
pub trait CompactionJob: Send + Sync {
    /// Runs the job to completion.
    ///
    /// # Errors
    ///
    /// Returns a [`JobError`] if the job fails; the run ends `FAILED`.
    async fn run(&self, input: &WorkflowInput) -> std::result::Result<JobReport, JobError>;
}

/// Starts workflow runs without waiting for them.
#[async_trait]
pub trait WorkflowStarter: Send + Sync {
    /// Starts a run and returns its ID as soon as it is accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the run could not be accepted.
    async fn start(&self, input: WorkflowInput) -> Result<RunId>;
}

/// A workflow run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    /// Run identifier.
    pub run_id: RunId,
    /// Run parameters.
    pub input: WorkflowInput,
    /// Current state.
    pub state: RunState,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the job started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Job report, when the job succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<JobReport>,
    /// Failure description, when the job failed or timed out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowRun {
    /// Creates a pending run.
    #[must_use]
    pub fn new(input: WorkflowInput) -> Self {
        Self {
            run_id: RunId::generate(),
            input,
            state: RunState::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            report: None,
            error: None,
        }
    }

    /// Moves the run to `target`, stamping timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the state machine does
    /// not allow the move.
    pub fn transition_to(&mut self, target: RunState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state,
                to: target,
            });
        }
        let now = Utc::now();
        if target == RunState::Running {
            self.started_at = Some(now);
        }
        if target.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = target;
        Ok(())
    }
}

/// Runs one job per workflow run, under a wall-clock timeout.
#[derive(Clone)]
pub struct Orchestrator {
    job: Arc<dyn CompactionJob>,
    timeout: Duration,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(job: Arc<dyn CompactionJob>, timeout: Duration) -> Self {
        Self {
            job,
            timeout,
            metrics: FlowMetrics::new(),
        }
    }

    /// Executes a pending run to a terminal state.
    ///
    /// `publish` observes every state change, including the final one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if `run` is not pending.
    /// Job failures are not errors; they end the run `FAILED`.
    pub async fn execute(
        &self,
        mut run: WorkflowRun,
        publish: &(dyn Fn(&WorkflowRun) + Send + Sync),
    ) -> Result<WorkflowRun> {
        run.transition_to(RunState::Running)?;
        publish(&run);
        self.metrics.run_started();
        tracing::info!(run_id = %run.run_id, table = %run.input.table_id, "workflow run started");

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.job.run(&run.input)).await;
        let terminal = match outcome {
            Ok(Ok(report)) => {
                tracing::info!(
                    run_id = %run.run_id,
                    final_delete_count = report.final_delete_count,
                    passes = report.passes,
                    termination = %report.termination,
                    "workflow run succeeded"
                );
                run.report = Some(report);
                RunState::Succeeded
            }
            Ok(Err(e)) => {
                tracing::warn!(run_id = %run.run_id, error = %e, "workflow run failed");
                run.error = Some(e.message);
                RunState::Failed
            }
            Err(_) => {
                tracing::warn!(
                    run_id = %run.run_id,
                    timeout_secs = self.timeout.as_secs(),
                    "workflow run timed out"
                );
                run.error = Some(format!("job exceeded {}s", self.timeout.as_secs()));
                RunState::TimedOut
            }
        };
        run.transition_to(terminal)?;
        self.metrics.run_finished(terminal, started.elapsed());
        publish(&run);
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedJob(std::result::Result<JobReport, JobError>, Duration);

    #[async_trait]
    impl CompactionJob for FixedJob {
        async fn run(&self, _input: &WorkflowInput) -> std::result::Result<JobReport, JobError> {
            tokio::time::sleep(self.1).await;
            self.0.clone()
        }
    }

    fn input() -> WorkflowInput {
        WorkflowInput::new(
            "catalog.sales.orders".parse().expect("table"),
            WarehouseRoot::new("s3", "wh", ""),
        )
    }

    fn report() -> JobReport {
        JobReport {
            final_delete_count: 0,
            passes: 2,
            termination: "converged".into(),
            details: serde_json::Value::Null,
        }
    }

    #[test]
    fn state_machine() {
        assert!(RunState::Pending.can_transition_to(RunState::Running));
        assert!(!RunState::Pending.can_transition_to(RunState::Succeeded));
        assert!(RunState::Running.can_transition_to(RunState::TimedOut));
        assert!(!RunState::Succeeded.can_transition_to(RunState::Running));
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert_eq!(RunState::TimedOut.to_string(), "TIMED_OUT");
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut run = WorkflowRun::new(input());
        assert!(matches!(
            run.transition_to(RunState::Succeeded),
            Err(Error::InvalidStateTransition { .. })
        ));
        run.transition_to(RunState::Running).expect("start");
        assert!(run.started_at.is_some());
        run.transition_to(RunState::Failed).expect("fail");
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn successful_job() {
        let orchestrator = Orchestrator::new(
            Arc::new(FixedJob(Ok(report()), Duration::ZERO)),
            Duration::from_secs(5),
        );
        let seen = std::sync::Mutex::new(Vec::new());
        let run = orchestrator
            .execute(WorkflowRun::new(input()), &|r| {
                seen.lock().expect("lock").push(r.state);
            })
            .await
            .expect("execute");
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.report, Some(report()));
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![RunState::Running, RunState::Succeeded]
        );
    }

    #[tokio::test]
    async fn failing_job() {
        let orchestrator = Orchestrator::new(
            Arc::new(FixedJob(Err(JobError::new("boom")), Duration::ZERO)),
            Duration::from_secs(5),
        );
        let run = orchestrator
            .execute(WorkflowRun::new(input()), &|_| {})
            .await
            .expect("execute");
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn slow_job_times_out() {
        let orchestrator = Orchestrator::new(
            Arc::new(FixedJob(Ok(report()), Duration::from_secs(5))),
            Duration::from_millis(20),
        );
        let run = orchestrator
            .execute(WorkflowRun::new(input()), &|_| {})
            .await
            .expect("execute");
        assert_eq!(run.state, RunState::TimedOut);
        assert!(run.report.is_none());
    }

    #[tokio::test]
    async fn non_pending_run_is_rejected() {
        let orchestrator = Orchestrator::new(
            Arc::new(FixedJob(Ok(report()), Duration::ZERO)),
            Duration::from_secs(5),
        );
        let mut run = WorkflowRun::new(input());
        run.transition_to(RunState::Running).expect("start");
        assert!(orchestrator.execute(run, &|_| {}).await.is_err());
    }
}
