//! Shared test utilities for sluice integration tests.
//!
//! This crate provides:
//! - [`ScriptedMaintenance`]: a table whose delete counts follow a script
//! - [`RecordingStarter`]: a workflow starter that records every start
//! - [`TestContext`]: a dispatcher wired to in-memory collaborators
//! - Notification and envelope fixtures
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice_test_utils::{TestContext, delete_notification};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::new();
//!     let outcome = ctx.dispatcher.handle(delete_notification("sales/orders")).await?;
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod maintenance;
pub mod starter;

pub use fixtures::*;
pub use maintenance::*;
pub use starter::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("sluice=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
