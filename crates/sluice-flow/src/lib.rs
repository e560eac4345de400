//! # sluice-flow
//!
//! Per-table coordination of delete-artifact compaction.
//!
//! Every new delete file in a warehouse produces a notification. This crate
//! turns that stream into at most one compaction run per table at a time:
//!
//! - **Leases**: a TTL lock per table, taken with a conditional write and
//!   never released ([`lease`])
//! - **Retries**: a delayed queue of tickets for tables whose lease was busy,
//!   deduplicated by a single-flight marker ([`retry`])
//! - **Dispatch**: the event handler deciding start, retry or skip
//!   ([`dispatcher`])
//! - **Workflows**: run state tracking and timeout enforcement around a
//!   pluggable compaction job ([`workflow`])
//!
//! ## Guarantees
//!
//! - **Serialized**: a table's lease is held by one run until it expires
//! - **Bounded retries**: at most one pending retry ticket per table
//! - **Idempotent**: replaying a delivery never starts a second run while a
//!   lease is live
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use sluice_core::{CoordinatorConfig, ObjectCreated};
//! use sluice_flow::dispatcher::Dispatcher;
//! use sluice_flow::lease::memory::InMemoryLockStore;
//! use sluice_flow::retry::memory::InMemoryRetryQueue;
//! use sluice_flow::workflow::local::LocalWorkflowStarter;
//! use sluice_flow::workflow::{CompactionJob, Orchestrator};
//!
//! # async fn example(job: Arc<dyn CompactionJob>) -> sluice_flow::error::Result<()> {
//! let config = CoordinatorConfig::new("-deletes.parquet");
//! let starter = LocalWorkflowStarter::new(Orchestrator::new(job, Duration::from_secs(3600)));
//! let dispatcher = Dispatcher::from_config(
//!     &config,
//!     Arc::new(InMemoryLockStore::new()),
//!     Arc::new(InMemoryRetryQueue::new("retries")),
//!     Arc::new(starter),
//! );
//!
//! let outcome = dispatcher
//!     .handle(ObjectCreated::new("wh", "sales/orders/data/00001-deletes.parquet"))
//!     .await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod dispatcher;
pub mod error;
pub mod inbound;
pub mod lease;
pub mod metrics;
pub mod retry;
pub mod workflow;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::dispatcher::{
        BatchStatus, DispatchOutcome, DispatchSettings, DispatchSummary, Dispatcher, SkipReason,
    };
    pub use crate::error::{Error, Result};
    pub use crate::inbound::{InboundEvent, parse_envelope};
    pub use crate::lease::memory::InMemoryLockStore;
    pub use crate::lease::storage::StorageLockStore;
    pub use crate::lease::{AcquireResult, LockRecord, LockStore};
    pub use crate::retry::memory::InMemoryRetryQueue;
    pub use crate::retry::storage::StorageRetryQueue;
    pub use crate::retry::{EnqueueResult, RetryDelivery, RetryQueue, RetryTicket};
    pub use crate::workflow::local::{LocalWorkflowStarter, RunHandle};
    pub use crate::workflow::{
        CompactionJob, JobError, JobReport, Orchestrator, RunState, WorkflowInput, WorkflowRun,
        WorkflowStarter,
    };
}
