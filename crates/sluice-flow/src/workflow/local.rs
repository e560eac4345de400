//! Tokio-backed workflow starter.
//!
//! Runs are executed as spawned tasks in the current runtime. Runs are kept
//! in a registry so their status can be queried or awaited. Once the registry
//! exceeds its retention cap, the oldest finished runs are forgotten.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;

use sluice_core::RunId;

use super::{Orchestrator, WorkflowInput, WorkflowRun, WorkflowStarter};
use crate::error::{Error, Result};

type RunMap = HashMap<RunId, Arc<watch::Sender<WorkflowRun>>>;
type Registry = RwLock<RunMap>;

/// Default number of runs kept in the registry.
pub const DEFAULT_RETAINED_RUNS: usize = 1024;

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("run registry lock poisoned")
}

/// Starts runs on the local tokio runtime.
#[derive(Debug, Clone)]
pub struct LocalWorkflowStarter {
    orchestrator: Arc<Orchestrator>,
    runs: Arc<Registry>,
    retained_runs: usize,
}

/// Observes one run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    receiver: watch::Receiver<WorkflowRun>,
}

impl RunHandle {
    /// Returns the latest observed state of the run.
    #[must_use]
    pub fn current(&self) -> WorkflowRun {
        self.receiver.borrow().clone()
    }

    /// Waits until the run reaches a terminal state.
    pub async fn wait(mut self) -> WorkflowRun {
        let done = self
            .receiver
            .wait_for(|run| run.state.is_terminal())
            .await
            .map(|run| run.clone());
        match done {
            Ok(run) => run,
            Err(_) => self.receiver.borrow().clone(),
        }
    }
}

impl LocalWorkflowStarter {
    /// Creates a starter around an orchestrator.
    #[must_use]
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            runs: Arc::new(RwLock::new(HashMap::new())),
            retained_runs: DEFAULT_RETAINED_RUNS,
        }
    }

    /// Bounds how many runs the registry keeps.
    ///
    /// Runs still in flight are never forgotten, so the registry can
    /// temporarily exceed the bound.
    #[must_use]
    pub fn with_retained_runs(mut self, retained_runs: usize) -> Self {
        self.retained_runs = retained_runs.max(1);
        self
    }

    /// Returns the current record of a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] if the run is unknown or was pruned.
    pub fn status(&self, run_id: RunId) -> Result<WorkflowRun> {
        Ok(self.handle(run_id)?.current())
    }

    /// Returns a handle observing a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RunNotFound`] if the run is unknown.
    pub fn handle(&self, run_id: RunId) -> Result<RunHandle> {
        let runs = self.runs.read().map_err(poison_err)?;
        let sender = runs.get(&run_id).ok_or(Error::RunNotFound { run_id })?;
        Ok(RunHandle {
            receiver: sender.subscribe(),
        })
    }

    /// Returns every known run, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn runs(&self) -> Result<Vec<WorkflowRun>> {
        let runs = self.runs.read().map_err(poison_err)?;
        let mut all: Vec<WorkflowRun> = runs.values().map(|s| s.borrow().clone()).collect();
        drop(runs);
        all.sort_by_key(|run| run.run_id);
        Ok(all)
    }

    /// Returns the number of runs that have not reached a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned.
    pub fn active_runs(&self) -> Result<usize> {
        let runs = self.runs.read().map_err(poison_err)?;
        Ok(runs
            .values()
            .filter(|s| !s.borrow().state.is_terminal())
            .count())
    }
}

/// Drops the oldest finished runs until at most `retain` remain.
fn prune_finished(runs: &mut RunMap, retain: usize) {
    let excess = runs.len().saturating_sub(retain);
    if excess == 0 {
        return;
    }
    let mut finished: Vec<RunId> = runs
        .iter()
        .filter(|(_, sender)| sender.borrow().state.is_terminal())
        .map(|(run_id, _)| *run_id)
        .collect();
    finished.sort_unstable();
    for run_id in finished.into_iter().take(excess) {
        runs.remove(&run_id);
    }
    tracing::debug!(retained = runs.len(), "pruned finished workflow runs");
}

#[async_trait]
impl WorkflowStarter for LocalWorkflowStarter {
    async fn start(&self, input: WorkflowInput) -> Result<RunId> {
        let run = WorkflowRun::new(input);
        let run_id = run.run_id;
        let (sender, _) = watch::channel(run.clone());
        let sender = Arc::new(sender);

        {
            let mut runs = self.runs.write().map_err(poison_err)?;
            runs.insert(run_id, Arc::clone(&sender));
            prune_finished(&mut runs, self.retained_runs);
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            let publish = |r: &WorkflowRun| {
                sender.send_replace(r.clone());
            };
            if let Err(e) = orchestrator.execute(run, &publish).await {
                tracing::error!(%run_id, error = %e, "workflow run could not execute");
            }
        });

        Ok(run_id)
    }
}
