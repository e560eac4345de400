//! Scripted table maintenance for driver tests.
//!
//! Delete counts are served from a script: each `delete_file_count` call
//! consumes the next value, and the final value repeats forever.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use sluice_compactor::maintenance::{
    DeleteRewriteStats, ExpireStats, MaintenanceError, Result, RewriteOptions, RewriteStats,
    TableMaintenance,
};
use sluice_core::TableIdentifier;

/// Record of a maintenance call for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceCall {
    /// `delete_file_count`.
    Count,
    /// `rewrite_data_files`.
    RewriteDataFiles(RewriteOptions),
    /// `rewrite_position_deletes`.
    RewritePositionDeletes,
    /// `refresh`.
    Refresh,
    /// `expire_snapshots`.
    ExpireSnapshots {
        /// Snapshots retained.
        retain_last: u32,
    },
}

#[derive(Debug, Default)]
struct Script {
    counts: VecDeque<u64>,
    calls: Vec<MaintenanceCall>,
    rewrites: u32,
    failing_rewrites: HashSet<u32>,
    delete_rewrite_unsupported: bool,
    fail_delete_rewrite: bool,
    fail_expiry: bool,
    fail_count: bool,
}

/// A table whose delete-file counts follow a script.
#[derive(Debug, Default)]
pub struct ScriptedMaintenance {
    script: Mutex<Script>,
}

fn failed(operation: &'static str) -> MaintenanceError {
    MaintenanceError::Failed {
        operation,
        message: "injected failure".to_string(),
    }
}

impl ScriptedMaintenance {
    /// Creates a table whose counts follow `counts`. The first value is the
    /// count at entry.
    pub fn new(counts: impl IntoIterator<Item = u64>) -> Self {
        Self {
            script: Mutex::new(Script {
                counts: counts.into_iter().collect(),
                ..Script::default()
            }),
        }
    }

    /// Fails the data-file rewrite on the given 1-based rewrite calls.
    pub fn failing_rewrites(self, calls: impl IntoIterator<Item = u32>) -> Self {
        self.script.lock().unwrap().failing_rewrites = calls.into_iter().collect();
        self
    }

    /// Reports the position-delete rewrite as unsupported.
    pub fn without_delete_rewrite(self) -> Self {
        self.script.lock().unwrap().delete_rewrite_unsupported = true;
        self
    }

    /// Fails every position-delete rewrite.
    pub fn failing_delete_rewrite(self) -> Self {
        self.script.lock().unwrap().fail_delete_rewrite = true;
        self
    }

    /// Fails snapshot expiry.
    pub fn failing_expiry(self) -> Self {
        self.script.lock().unwrap().fail_expiry = true;
        self
    }

    /// Fails every count query.
    pub fn failing_count(self) -> Self {
        self.script.lock().unwrap().fail_count = true;
        self
    }

    /// Returns every call made so far.
    pub fn calls(&self) -> Vec<MaintenanceCall> {
        self.script.lock().unwrap().calls.clone()
    }

    /// Returns how many data-file rewrites were attempted.
    pub fn rewrite_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MaintenanceCall::RewriteDataFiles(_)))
            .count()
    }

    /// Returns the retention of every expiry call.
    pub fn expiries(&self) -> Vec<u32> {
        self.calls()
            .iter()
            .filter_map(|c| match c {
                MaintenanceCall::ExpireSnapshots { retain_last } => Some(*retain_last),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TableMaintenance for ScriptedMaintenance {
    async fn delete_file_count(&self, _table: &TableIdentifier) -> Result<u64> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(MaintenanceCall::Count);
        if script.fail_count {
            return Err(failed("delete_file_count"));
        }
        let count = if script.counts.len() > 1 {
            script.counts.pop_front()
        } else {
            script.counts.front().copied()
        };
        Ok(count.unwrap_or(0))
    }

    async fn rewrite_data_files(
        &self,
        _table: &TableIdentifier,
        options: RewriteOptions,
    ) -> Result<RewriteStats> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(MaintenanceCall::RewriteDataFiles(options));
        script.rewrites += 1;
        if script.failing_rewrites.contains(&script.rewrites) {
            return Err(failed("rewrite_data_files"));
        }
        Ok(RewriteStats {
            added_files: 1,
            rewritten_files: 2,
            removed_delete_files: 1,
            failed_files: 0,
        })
    }

    async fn rewrite_position_deletes(
        &self,
        table: &TableIdentifier,
    ) -> Result<DeleteRewriteStats> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(MaintenanceCall::RewritePositionDeletes);
        if script.delete_rewrite_unsupported {
            return Err(MaintenanceError::Unsupported {
                operation: "rewrite_position_deletes",
                table: table.to_string(),
            });
        }
        if script.fail_delete_rewrite {
            return Err(failed("rewrite_position_deletes"));
        }
        Ok(DeleteRewriteStats::default())
    }

    async fn refresh(&self, _table: &TableIdentifier) -> Result<()> {
        self.script.lock().unwrap().calls.push(MaintenanceCall::Refresh);
        Ok(())
    }

    async fn expire_snapshots(
        &self,
        _table: &TableIdentifier,
        retain_last: u32,
    ) -> Result<ExpireStats> {
        let mut script = self.script.lock().unwrap();
        script
            .calls
            .push(MaintenanceCall::ExpireSnapshots { retain_last });
        if script.fail_expiry {
            return Err(failed("expire_snapshots"));
        }
        Ok(ExpireStats::default())
    }
}
