//! Convergence loop behavior against scripted tables.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use proptest::prelude::*;

use sluice_compactor::driver::{CompactionDriver, DriverSettings, Termination};
use sluice_compactor::maintenance::TableMaintenance;
use sluice_compactor::CompactionError;
use sluice_test_utils::{MaintenanceCall, ScriptedMaintenance, table};

fn settings() -> DriverSettings {
    DriverSettings {
        max_passes: 5,
        target_file_size_bytes: 512 * 1024 * 1024,
        retain_last_snapshots: 1,
    }
}

fn driver(maintenance: &Arc<ScriptedMaintenance>) -> CompactionDriver {
    CompactionDriver::new(
        Arc::clone(maintenance) as Arc<dyn TableMaintenance>,
        settings(),
    )
}

#[tokio::test]
async fn clean_table_is_a_zero_pass_no_op() {
    let table_ops = Arc::new(ScriptedMaintenance::new([0]));
    let report = driver(&table_ops)
        .run(&table("catalog.sales.orders"), 5)
        .await
        .expect("run");

    assert_eq!(report.pass_count(), 0);
    assert_eq!(report.final_delete_count, 0);
    assert_eq!(report.termination, Termination::AlreadyClean);
    assert_eq!(table_ops.calls(), vec![MaintenanceCall::Count]);
}

#[tokio::test]
async fn stalled_second_pass_stops_the_loop() {
    let table_ops = Arc::new(ScriptedMaintenance::new([10, 6, 6]));
    let report = driver(&table_ops)
        .run(&table("catalog.sales.orders"), 5)
        .await
        .expect("run");

    assert_eq!(report.pass_count(), 2);
    assert_eq!(report.final_delete_count, 6);
    assert_eq!(report.termination, Termination::NoProgress);
    assert_eq!(table_ops.rewrite_calls(), 2);
}

#[tokio::test]
async fn single_pass_bound_skips_the_progress_check() {
    let table_ops = Arc::new(ScriptedMaintenance::new([10, 10]));
    let report = driver(&table_ops)
        .run(&table("catalog.sales.orders"), 1)
        .await
        .expect("run");

    assert_eq!(report.pass_count(), 1);
    assert_eq!(report.final_delete_count, 10);
    assert_eq!(report.termination, Termination::MaxPassesReached);
}

#[tokio::test]
async fn documented_scenario_converges_in_two_passes() {
    let table_ops = Arc::new(ScriptedMaintenance::new([8, 3, 0]));
    let report = driver(&table_ops)
        .run(&table("catalog.sales.orders"), 5)
        .await
        .expect("run");

    assert_eq!(report.pass_count(), 2);
    assert_eq!(report.final_delete_count, 0);
    assert_eq!(report.termination, Termination::Converged);
    assert_eq!(report.passes[0].delete_count_before, 8);
    assert_eq!(report.passes[0].delete_count_after, Some(3));
    assert_eq!(report.passes[1].delete_count_after, Some(0));
    assert_eq!(table_ops.expiries(), vec![1]);
}

#[tokio::test]
async fn pass_calls_rewrite_everything_then_cleanup_then_refresh() {
    let table_ops = Arc::new(ScriptedMaintenance::new([2, 0]));
    driver(&table_ops)
        .run(&table("catalog.sales.orders"), 5)
        .await
        .expect("run");

    let calls = table_ops.calls();
    let MaintenanceCall::RewriteDataFiles(options) = &calls[1] else {
        panic!("expected rewrite, got {calls:?}");
    };
    assert!(options.rewrite_all);
    assert_eq!(options.delete_file_threshold, 1);
    assert_eq!(options.target_file_size_bytes, 512 * 1024 * 1024);
    assert_eq!(
        calls[2..],
        [
            MaintenanceCall::RewritePositionDeletes,
            MaintenanceCall::Refresh,
            MaintenanceCall::Count,
            MaintenanceCall::ExpireSnapshots { retain_last: 1 },
        ]
    );
}

#[tokio::test]
async fn optional_steps_never_fail_the_run() {
    let table_ops = Arc::new(
        ScriptedMaintenance::new([5, 0])
            .failing_delete_rewrite()
            .failing_expiry(),
    );
    let report = driver(&table_ops)
        .run(&table("catalog.sales.orders"), 5)
        .await
        .expect("run");

    assert_eq!(report.termination, Termination::Converged);
    assert!(report.expired.is_none());
    assert!(report.passes[0].delete_rewrite.is_none());
    assert!(report.passes[0].error.is_none());

    let unsupported = Arc::new(ScriptedMaintenance::new([5, 0]).without_delete_rewrite());
    let report = driver(&unsupported)
        .run(&table("catalog.sales.orders"), 5)
        .await
        .expect("run");
    assert_eq!(report.final_delete_count, 0);
}

#[tokio::test]
async fn failed_rewrite_does_not_count_as_progress_check() {
    // Pass 2 fails; pass 3 then compares against the count after pass 1.
    let table_ops = Arc::new(ScriptedMaintenance::new([9, 4, 2, 0]).failing_rewrites([2]));
    let report = driver(&table_ops)
        .run(&table("catalog.sales.orders"), 5)
        .await
        .expect("run");

    assert_eq!(report.pass_count(), 4);
    assert!(report.passes[1].error.is_some());
    assert_eq!(report.passes[2].delete_count_before, 4);
    assert_eq!(report.final_delete_count, 0);
}

#[tokio::test]
async fn unreadable_initial_count_is_an_error() {
    let table_ops = Arc::new(ScriptedMaintenance::new([3]).failing_count());
    let result = driver(&table_ops)
        .run(&table("catalog.sales.orders"), 5)
        .await;
    assert!(matches!(result, Err(CompactionError::InitialCount { .. })));
    assert_eq!(table_ops.rewrite_calls(), 0);
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

proptest! {
    #[test]
    fn loop_never_exceeds_its_pass_bound(
        counts in prop::collection::vec(0u64..50, 1..12),
        max_passes in 1u32..8,
        failing in prop::collection::hash_set(1u32..8, 0..4),
    ) {
        let table_ops = Arc::new(
            ScriptedMaintenance::new(counts.clone()).failing_rewrites(failing),
        );
        let report = block_on(driver(&table_ops).run(&table("catalog.sales.orders"), max_passes))
            .expect("run");

        prop_assert!(report.pass_count() <= max_passes);
        prop_assert!(table_ops.rewrite_calls() <= max_passes as usize);
        prop_assert_eq!(report.initial_delete_count, counts[0]);

        for (index, pass) in report.passes.iter().enumerate() {
            prop_assert_eq!(pass.pass as usize, index + 1);
        }

        match report.termination {
            Termination::AlreadyClean => prop_assert!(report.passes.is_empty()),
            Termination::Converged => prop_assert_eq!(report.final_delete_count, 0),
            Termination::NoProgress => {
                let last = report.passes.last().expect("pass");
                prop_assert!(last.pass > 1);
                prop_assert!(last.delete_count_after >= Some(last.delete_count_before));
            }
            Termination::MaxPassesReached => {
                prop_assert_eq!(report.pass_count(), max_passes);
                prop_assert!(report.final_delete_count > 0);
            }
        }
    }
}
