//! # sluice-compactor
//!
//! The compaction side of sluice: a bounded, multi-pass convergence loop
//! that rewrites a table until its delete files are gone or stop shrinking.
//!
//! - **Driver**: [`driver::CompactionDriver`] sequences rewrite, cleanup,
//!   refresh and count calls, then expires old snapshots
//! - **Maintenance**: the [`maintenance::TableMaintenance`] collaborator and
//!   its HTTP adapter
//! - **Job**: [`job::DriverJob`] runs the driver inside a workflow run
//! - **Metrics**: pass and run metrics plus the Prometheus exporter
//!
//! The `sluice-compactor` binary hosts the dispatcher, the retry pump and
//! the local workflow starter behind an HTTP surface.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod driver;
pub mod job;
pub mod maintenance;
pub mod metrics;

pub use driver::{
    CompactionDriver, CompactionError, CompactionReport, DriverSettings, PassReport, Termination,
};
pub use job::DriverJob;
pub use maintenance::{MaintenanceError, TableMaintenance};
