//! Multi-pass compaction convergence loop.
//!
//! [`CompactionDriver::run`] rewrites a table until its outstanding delete
//! files reach zero or stop decreasing, bounded by a pass count:
//!
//! ```text
//! last = count()
//! while pass < max_passes && last > 0:
//!     pass += 1
//!     rewrite data files          (failure: pass failed, last unchanged)
//!     rewrite position deletes    (failure: logged only)
//!     refresh                     (failure: pass failed, last unchanged)
//!     new = count()
//!     if pass > 1 && new >= last: stop, no progress
//!     last = new
//! expire snapshots                (failure: logged only)
//! ```
//!
//! The no-progress check is skipped on the first pass, so a single pass
//! always completes even when it removes nothing.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::Instrument;

use sluice_core::{CoordinatorConfig, TableIdentifier, compaction_span};

use crate::maintenance::{
    DeleteRewriteStats, ExpireStats, MaintenanceError, RewriteOptions, RewriteStats,
    TableMaintenance,
};
use crate::metrics::CompactorMetrics;

/// A delete file is enough to qualify a data file for rewrite.
pub const DELETE_FILE_THRESHOLD: u32 = 1;

/// Errors that abort a compaction run.
#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    /// The starting delete-file count could not be read.
    #[error("failed to read delete file count of {table}: {source}")]
    InitialCount {
        /// Table being compacted.
        table: TableIdentifier,
        /// Underlying failure.
        #[source]
        source: MaintenanceError,
    },
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// No delete files at entry; nothing ran.
    AlreadyClean,
    /// The count reached zero.
    Converged,
    /// A pass after the first did not lower the count.
    NoProgress,
    /// The pass bound was hit with delete files remaining.
    MaxPassesReached,
}

impl Termination {
    /// Returns the snake-case name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyClean => "already_clean",
            Self::Converged => "converged",
            Self::NoProgress => "no_progress",
            Self::MaxPassesReached => "max_passes_reached",
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One iteration of the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// 1-based pass index.
    pub pass: u32,
    /// Count before the pass.
    pub delete_count_before: u64,
    /// Count after the pass, if the pass got that far.
    pub delete_count_after: Option<u64>,
    /// Base rewrite statistics.
    pub rewrite: Option<RewriteStats>,
    /// Delete-file rewrite statistics.
    pub delete_rewrite: Option<DeleteRewriteStats>,
    /// Why the pass failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PassReport {
    fn new(pass: u32, delete_count_before: u64) -> Self {
        Self {
            pass,
            delete_count_before,
            delete_count_after: None,
            rewrite: None,
            delete_rewrite: None,
            error: None,
        }
    }

    /// Returns true if the pass produced a fresh count.
    #[must_use]
    pub const fn completed(&self) -> bool {
        self.delete_count_after.is_some()
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Table that was compacted.
    pub table_id: TableIdentifier,
    /// Count at entry.
    pub initial_delete_count: u64,
    /// Last observed count.
    pub final_delete_count: u64,
    /// Why the loop stopped.
    pub termination: Termination,
    /// Executed passes, in order.
    pub passes: Vec<PassReport>,
    /// Snapshot expiry statistics, when expiry ran and succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired: Option<ExpireStats>,
}

impl CompactionReport {
    /// Number of passes executed.
    #[must_use]
    pub fn pass_count(&self) -> u32 {
        u32::try_from(self.passes.len()).unwrap_or(u32::MAX)
    }
}

/// Driver settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    /// Default pass bound.
    pub max_passes: u32,
    /// Target size of rewritten data files.
    pub target_file_size_bytes: u64,
    /// Snapshots kept by expiry.
    pub retain_last_snapshots: u32,
}

impl From<&CoordinatorConfig> for DriverSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            max_passes: config.max_passes,
            target_file_size_bytes: config.target_file_size_bytes,
            retain_last_snapshots: config.retain_last_snapshots,
        }
    }
}

/// Runs the convergence loop against a [`TableMaintenance`] backend.
#[derive(Clone)]
pub struct CompactionDriver {
    maintenance: Arc<dyn TableMaintenance>,
    settings: DriverSettings,
    metrics: CompactorMetrics,
}

impl fmt::Debug for CompactionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactionDriver")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CompactionDriver {
    /// Creates a driver.
    #[must_use]
    pub fn new(maintenance: Arc<dyn TableMaintenance>, settings: DriverSettings) -> Self {
        Self {
            maintenance,
            settings,
            metrics: CompactorMetrics::new(),
        }
    }

    /// Returns the driver settings.
    #[must_use]
    pub const fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Compacts a table with the configured pass bound.
    ///
    /// # Errors
    ///
    /// See [`CompactionDriver::run`].
    pub async fn run_default(
        &self,
        table: &TableIdentifier,
    ) -> Result<CompactionReport, CompactionError> {
        self.run(table, self.settings.max_passes).await
    }

    /// Compacts a table, running at most `max_passes` passes.
    ///
    /// # Errors
    ///
    /// Returns [`CompactionError::InitialCount`] if the starting count cannot
    /// be read. Failures inside passes are recorded in the report instead.
    pub async fn run(
        &self,
        table: &TableIdentifier,
        max_passes: u32,
    ) -> Result<CompactionReport, CompactionError> {
        let span = compaction_span(&table.to_string());
        self.run_inner(table, max_passes).instrument(span).await
    }

    async fn run_inner(
        &self,
        table: &TableIdentifier,
        max_passes: u32,
    ) -> Result<CompactionReport, CompactionError> {
        let started = Instant::now();
        let initial = self
            .maintenance
            .delete_file_count(table)
            .await
            .map_err(|source| CompactionError::InitialCount {
                table: table.clone(),
                source,
            })?;
        tracing::info!(delete_count = initial, max_passes, "compaction starting");

        let mut last_count = initial;
        let mut pass = 0;
        let mut passes = Vec::new();
        let mut stalled = false;

        while pass < max_passes && last_count > 0 {
            pass += 1;
            let report = self.run_pass(table, pass, last_count).await;
            self.metrics.record_pass(report.completed());

            let Some(new_count) = report.delete_count_after else {
                passes.push(report);
                continue;
            };
            passes.push(report);

            if pass > 1 && new_count >= last_count {
                tracing::warn!(
                    pass,
                    before = last_count,
                    after = new_count,
                    "no progress; stopping"
                );
                last_count = new_count;
                stalled = true;
                break;
            }
            last_count = new_count;
        }

        let termination = if passes.is_empty() && last_count == 0 {
            Termination::AlreadyClean
        } else if last_count == 0 {
            Termination::Converged
        } else if stalled {
            Termination::NoProgress
        } else {
            Termination::MaxPassesReached
        };

        let expired = if passes.is_empty() {
            None
        } else {
            self.expire(table).await
        };

        let report = CompactionReport {
            table_id: table.clone(),
            initial_delete_count: initial,
            final_delete_count: last_count,
            termination,
            passes,
            expired,
        };
        self.metrics
            .record_run(table, termination, last_count, started.elapsed());
        tracing::info!(
            passes = report.pass_count(),
            initial_delete_count = initial,
            final_delete_count = last_count,
            %termination,
            "compaction finished"
        );
        Ok(report)
    }

    async fn run_pass(&self, table: &TableIdentifier, pass: u32, before: u64) -> PassReport {
        let mut report = PassReport::new(pass, before);
        let options = RewriteOptions {
            rewrite_all: true,
            delete_file_threshold: DELETE_FILE_THRESHOLD,
            target_file_size_bytes: self.settings.target_file_size_bytes,
        };

        match self.maintenance.rewrite_data_files(table, options).await {
            Ok(stats) => report.rewrite = Some(stats),
            Err(e) => {
                tracing::error!(pass, error = %e, "data file rewrite failed");
                report.error = Some(e.to_string());
                return report;
            }
        }

        match self.maintenance.rewrite_position_deletes(table).await {
            Ok(stats) => report.delete_rewrite = Some(stats),
            Err(e) if e.is_unsupported() => {
                tracing::info!(pass, "position delete rewrite unsupported; skipping");
            }
            Err(e) => tracing::warn!(pass, error = %e, "position delete rewrite failed"),
        }

        if let Err(e) = self.maintenance.refresh(table).await {
            tracing::error!(pass, error = %e, "metadata refresh failed");
            report.error = Some(e.to_string());
            return report;
        }

        match self.maintenance.delete_file_count(table).await {
            Ok(after) => report.delete_count_after = Some(after),
            Err(e) => {
                tracing::error!(pass, error = %e, "delete file count failed");
                report.error = Some(e.to_string());
                return report;
            }
        }

        let rewrite = report.rewrite.unwrap_or_default();
        tracing::info!(
            pass,
            before,
            after = report.delete_count_after,
            added_files = rewrite.added_files,
            rewritten_files = rewrite.rewritten_files,
            removed_delete_files = rewrite.removed_delete_files,
            failed_files = rewrite.failed_files,
            "pass complete"
        );
        report
    }

    async fn expire(&self, table: &TableIdentifier) -> Option<ExpireStats> {
        let retain_last = self.settings.retain_last_snapshots;
        match self.maintenance.expire_snapshots(table, retain_last).await {
            Ok(stats) => {
                tracing::info!(
                    retain_last,
                    deleted_data_files = stats.deleted_data_files,
                    deleted_delete_files = stats.deleted_delete_files,
                    deleted_manifest_files = stats.deleted_manifest_files,
                    "snapshots expired"
                );
                Some(stats)
            }
            Err(e) => {
                tracing::warn!(retain_last, error = %e, "snapshot expiry failed");
                None
            }
        }
    }
}
