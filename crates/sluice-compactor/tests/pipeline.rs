//! Notification to finished compaction, end to end.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use sluice_compactor::driver::{CompactionDriver, DriverSettings};
use sluice_compactor::job::DriverJob;
use sluice_core::{CoordinatorConfig, ObjectCreated};
use sluice_flow::dispatcher::{DispatchOutcome, Dispatcher};
use sluice_flow::lease::memory::InMemoryLockStore;
use sluice_flow::retry::memory::InMemoryRetryQueue;
use sluice_flow::workflow::local::LocalWorkflowStarter;
use sluice_flow::workflow::{Orchestrator, RunState};
use sluice_test_utils::{DELETE_SUFFIX, ScriptedMaintenance, init_test_logging};

fn pipeline(table_ops: Arc<ScriptedMaintenance>) -> (Dispatcher, LocalWorkflowStarter) {
    let config = CoordinatorConfig::new(DELETE_SUFFIX);
    let driver = CompactionDriver::new(table_ops, DriverSettings::from(&config));
    let starter = LocalWorkflowStarter::new(Orchestrator::new(
        Arc::new(DriverJob::new(driver)),
        Duration::from_secs(10),
    ));
    let dispatcher = Dispatcher::from_config(
        &config,
        Arc::new(InMemoryLockStore::new()),
        Arc::new(InMemoryRetryQueue::new("retries")),
        Arc::new(starter.clone()),
    );
    (dispatcher, starter)
}

#[tokio::test]
async fn notification_drives_table_to_zero_deletes() {
    init_test_logging();
    let table_ops = Arc::new(ScriptedMaintenance::new([8, 3, 0]));
    let (dispatcher, starter) = pipeline(Arc::clone(&table_ops));

    let outcome = dispatcher
        .handle(ObjectCreated::new("wh", "sales/orders/data/00001-deletes.parquet"))
        .await
        .expect("dispatch");
    let DispatchOutcome::Started { table_id, run_id } = outcome else {
        panic!("expected Started, got {outcome:?}");
    };
    assert_eq!(table_id.to_string(), "catalog.sales.orders");

    let run = starter.handle(run_id).expect("handle").wait().await;
    assert_eq!(run.state, RunState::Succeeded);

    let report = run.report.expect("report");
    assert_eq!(report.final_delete_count, 0);
    assert_eq!(report.passes, 2);
    assert_eq!(report.termination, "converged");
    assert_eq!(report.details["passes"].as_array().map(Vec::len), Some(2));
    assert_eq!(table_ops.expiries(), vec![1]);
}

#[tokio::test]
async fn unreadable_table_fails_the_run() {
    let table_ops = Arc::new(ScriptedMaintenance::new([3]).failing_count());
    let (dispatcher, starter) = pipeline(table_ops);

    let DispatchOutcome::Started { run_id, .. } = dispatcher
        .handle(ObjectCreated::new("wh", "sales/orders/data/00001-deletes.parquet"))
        .await
        .expect("dispatch")
    else {
        panic!("expected Started");
    };

    let run = starter.handle(run_id).expect("handle").wait().await;
    assert_eq!(run.state, RunState::Failed);
    assert!(
        run.error
            .as_deref()
            .is_some_and(|e| e.contains("delete file count"))
    );
}
