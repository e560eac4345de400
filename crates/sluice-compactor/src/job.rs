//! Plugs the compaction driver into the workflow orchestrator.

use async_trait::async_trait;

use sluice_flow::workflow::{CompactionJob, JobError, JobReport, WorkflowInput};

use crate::driver::CompactionDriver;

/// A [`CompactionJob`] that runs the convergence loop once per run.
#[derive(Debug, Clone)]
pub struct DriverJob {
    driver: CompactionDriver,
}

impl DriverJob {
    /// Wraps a driver.
    #[must_use]
    pub const fn new(driver: CompactionDriver) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl CompactionJob for DriverJob {
    async fn run(&self, input: &WorkflowInput) -> Result<JobReport, JobError> {
        tracing::debug!(
            table = %input.table_id,
            warehouse = %input.warehouse_root,
            "compaction job starting"
        );
        let report = self
            .driver
            .run_default(&input.table_id)
            .await
            .map_err(|e| JobError::new(e.to_string()))?;
        let details =
            serde_json::to_value(&report).map_err(|e| JobError::new(e.to_string()))?;
        Ok(JobReport {
            final_delete_count: report.final_delete_count,
            passes: report.pass_count(),
            termination: report.termination.to_string(),
            details,
        })
    }
}
