//! Pre-built test fixtures for common test scenarios.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use sluice_core::{CoordinatorConfig, ObjectCreated, TableIdentifier};
use sluice_flow::dispatcher::Dispatcher;
use sluice_flow::lease::LockStore;
use sluice_flow::lease::memory::InMemoryLockStore;
use sluice_flow::retry::RetryQueue;
use sluice_flow::retry::memory::InMemoryRetryQueue;
use sluice_flow::workflow::WorkflowStarter;

use crate::starter::RecordingStarter;

/// Suffix used by every fixture.
pub const DELETE_SUFFIX: &str = "-deletes.parquet";

/// Bucket used by every fixture.
pub const BUCKET: &str = "wh";

/// A delete artifact notification under `{table_path}/data/`.
pub fn delete_notification(table_path: &str) -> ObjectCreated {
    ObjectCreated::new(BUCKET, format!("{table_path}/data/00001{DELETE_SUFFIX}"))
}

/// A plain data file notification under `{table_path}/data/`.
pub fn data_notification(table_path: &str) -> ObjectCreated {
    ObjectCreated::new(BUCKET, format!("{table_path}/data/00001.parquet"))
}

/// Parses a table identifier.
pub fn table(id: &str) -> TableIdentifier {
    id.parse().expect("valid table identifier")
}

/// A storage notification envelope carrying one record per key.
pub fn storage_envelope(keys: &[&str]) -> Value {
    let records: Vec<Value> = keys
        .iter()
        .map(|key| {
            json!({
                "eventTime": "2024-05-01T12:00:00.000Z",
                "s3": { "bucket": { "name": BUCKET }, "object": { "key": key } }
            })
        })
        .collect();
    json!({ "Records": records })
}

/// A queue delivery envelope carrying the given bodies.
pub fn queue_envelope(bodies: &[Value]) -> Value {
    let records: Vec<Value> = bodies
        .iter()
        .map(|body| json!({ "eventSource": "aws:sqs", "body": body.to_string() }))
        .collect();
    json!({ "Records": records })
}

/// A dispatcher wired to in-memory collaborators.
pub struct TestContext {
    /// The dispatcher under test.
    pub dispatcher: Dispatcher,
    /// Lease store.
    pub locks: Arc<InMemoryLockStore>,
    /// Retry queue.
    pub queue: Arc<InMemoryRetryQueue>,
    /// Recorded workflow starts.
    pub starter: Arc<RecordingStarter>,
    /// Configuration the dispatcher was built from.
    pub config: CoordinatorConfig,
}

impl TestContext {
    /// Creates a context with default configuration.
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::new(DELETE_SUFFIX))
    }

    /// Creates a context with the given configuration.
    pub fn with_config(config: CoordinatorConfig) -> Self {
        Self::with_queue(config, InMemoryRetryQueue::new("test-retries"))
    }

    /// Creates a context with the given configuration and queue.
    pub fn with_queue(config: CoordinatorConfig, queue: InMemoryRetryQueue) -> Self {
        let locks = Arc::new(InMemoryLockStore::new());
        let queue = Arc::new(queue);
        let starter = Arc::new(RecordingStarter::new());
        let dispatcher = Dispatcher::from_config(
            &config,
            Arc::clone(&locks) as Arc<dyn LockStore>,
            Arc::clone(&queue) as Arc<dyn RetryQueue>,
            Arc::clone(&starter) as Arc<dyn WorkflowStarter>,
        );
        Self {
            dispatcher,
            locks,
            queue,
            starter,
            config,
        }
    }

    /// Creates a context with short timings for retry tests.
    pub fn fast(lock_ttl: Duration, retry_delay: Duration) -> Self {
        let mut config = CoordinatorConfig::new(DELETE_SUFFIX);
        config.lock_ttl = lock_ttl;
        config.retry_delay = retry_delay;
        config.retry_marker_buffer = Duration::from_millis(50);
        Self::with_config(config)
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
