//! Workflow starters for dispatcher tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use sluice_core::{RunId, TableIdentifier};
use sluice_flow::error::{Error, Result};
use sluice_flow::workflow::{WorkflowInput, WorkflowStarter};

/// Records every start without running anything.
#[derive(Debug, Default)]
pub struct RecordingStarter {
    starts: Mutex<Vec<(RunId, WorkflowInput)>>,
    failing: AtomicBool,
}

impl RecordingStarter {
    /// Creates a starter that accepts every start.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent starts fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns every recorded start, in order.
    pub fn starts(&self) -> Vec<(RunId, WorkflowInput)> {
        self.starts.lock().unwrap().clone()
    }

    /// Returns how many runs were started.
    pub fn count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    /// Returns how many runs were started for one table.
    pub fn count_for(&self, table: &TableIdentifier) -> usize {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, input)| &input.table_id == table)
            .count()
    }
}

#[async_trait]
impl WorkflowStarter for RecordingStarter {
    async fn start(&self, input: WorkflowInput) -> Result<RunId> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::WorkflowStart {
                message: "injected start failure".to_string(),
            });
        }
        let run_id = RunId::generate();
        self.starts.lock().unwrap().push((run_id, input));
        Ok(run_id)
    }
}
