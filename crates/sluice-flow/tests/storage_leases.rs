//! Lease coordination over an `object_store` backend.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use object_store::memory::InMemory;

use sluice_core::{CoordinatorConfig, ObjectStoreBackend, OwnerToken};
use sluice_flow::dispatcher::Dispatcher;
use sluice_flow::lease::storage::StorageLockStore;
use sluice_flow::lease::{AcquireResult, LockStore};
use sluice_flow::retry::RetryQueue;
use sluice_flow::retry::memory::InMemoryRetryQueue;
use sluice_flow::retry::storage::StorageRetryQueue;
use sluice_test_utils::{DELETE_SUFFIX, RecordingStarter, delete_notification, table};

type Backend = Arc<ObjectStoreBackend>;

fn backend() -> Backend {
    Arc::new(ObjectStoreBackend::new(Arc::new(InMemory::new()), "warehouse-coordination"))
}

/// A dispatcher whose leases and retry tickets all live in `backend`.
fn durable_dispatcher(
    backend: &Backend,
    starter: &Arc<RecordingStarter>,
) -> (Dispatcher, Arc<StorageRetryQueue<ObjectStoreBackend>>) {
    let mut config = CoordinatorConfig::new(DELETE_SUFFIX);
    config.retry_delay = Duration::from_millis(20);
    config.retry_marker_buffer = Duration::from_secs(60);
    let queue = Arc::new(StorageRetryQueue::new(Arc::clone(backend), "retries"));
    let dispatcher = Dispatcher::from_config(
        &config,
        Arc::new(StorageLockStore::new(Arc::clone(backend))),
        queue.clone(),
        starter.clone(),
    );
    (dispatcher, queue)
}

fn store() -> Arc<StorageLockStore<ObjectStoreBackend>> {
    let backend = ObjectStoreBackend::new(Arc::new(InMemory::new()), "warehouse-coordination");
    Arc::new(StorageLockStore::new(Arc::new(backend)))
}

#[tokio::test]
async fn racing_acquirers_get_one_lease() {
    let locks = store();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .try_acquire(
                        "catalog.sales.orders",
                        Duration::from_secs(60),
                        &OwnerToken::generate(),
                    )
                    .await
            })
        })
        .collect();

    let mut acquired = 0;
    for handle in handles {
        if handle.await.expect("join").expect("acquire").is_acquired() {
            acquired += 1;
        }
    }
    assert_eq!(acquired, 1);
}

#[tokio::test]
async fn expired_lease_is_taken_over() {
    let locks = store();
    let first = OwnerToken::generate();
    let second = OwnerToken::generate();

    assert!(
        locks
            .try_acquire("catalog.sales.orders", Duration::from_millis(30), &first)
            .await
            .expect("acquire")
            .is_acquired()
    );
    tokio::time::sleep(Duration::from_millis(60)).await;

    match locks
        .try_acquire("catalog.sales.orders", Duration::from_secs(60), &second)
        .await
        .expect("takeover")
    {
        AcquireResult::Acquired(record) => assert_eq!(record.owner_token, second),
        AcquireResult::Held { .. } => panic!("expired lease should be taken over"),
    }
}

#[tokio::test]
async fn dispatcher_serializes_through_object_storage() {
    let locks = store();
    let starter = Arc::new(RecordingStarter::new());
    let dispatcher = Dispatcher::from_config(
        &CoordinatorConfig::new(DELETE_SUFFIX),
        locks.clone(),
        Arc::new(InMemoryRetryQueue::new("retries")),
        starter.clone(),
    );

    let first = dispatcher
        .handle(delete_notification("sales/orders"))
        .await
        .expect("first");
    let second = dispatcher
        .handle(delete_notification("sales/orders"))
        .await
        .expect("second");
    let third = dispatcher
        .handle(delete_notification("sales/orders"))
        .await
        .expect("third");

    assert_eq!(
        [first.label(), second.label(), third.label()],
        ["started", "retried", "skipped"]
    );
    assert_eq!(starter.count_for(&table("catalog.sales.orders")), 1);
    assert!(
        locks
            .retry_pending("catalog.sales.orders")
            .await
            .expect("marker")
    );
}

#[tokio::test]
async fn queued_ticket_survives_a_restart() {
    let backend = backend();
    let starter = Arc::new(RecordingStarter::new());

    let (before, _) = durable_dispatcher(&backend, &starter);
    assert_eq!(
        before
            .handle(delete_notification("sales/orders"))
            .await
            .expect("start")
            .label(),
        "started"
    );
    assert_eq!(
        before
            .handle(delete_notification("sales/orders"))
            .await
            .expect("retry")
            .label(),
        "retried"
    );
    drop(before);

    let (after, queue) = durable_dispatcher(&backend, &starter);
    assert_eq!(queue.depth().await.expect("depth"), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(after.pump_retries().await.expect("pump"), 1);

    // The lease is still held, so the delivered ticket schedules its follow-up.
    assert_eq!(queue.depth().await.expect("depth"), 1);
    assert_eq!(starter.count_for(&table("catalog.sales.orders")), 1);
}
