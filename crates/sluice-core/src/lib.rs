//! # sluice-core
//!
//! Shared primitives for the sluice delete-artifact compaction coordinator.
//!
//! This crate provides the types every sluice component agrees on:
//!
//! - **Table identity**: [`TableIdentifier`] and [`WarehouseRoot`]
//! - **Table resolution**: the pure [`TableResolver`] that maps storage keys to tables
//! - **Notifications**: the [`ObjectCreated`] event consumed from the storage bus
//! - **Storage**: conditional-write backends used for coordination state
//! - **Configuration**: [`CoordinatorConfig`] loaded from the environment
//! - **Error Types**: shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use sluice_core::prelude::*;
//!
//! let resolver = TableResolver::new(ResolverConfig::default());
//! let resolved = resolver
//!     .resolve("wh", "sales/orders/data/00001-deletes.parquet")
//!     .expect("resolves");
//! assert_eq!(resolved.table_id.to_string(), "catalog.sales.orders");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod id;
pub mod notification;
pub mod observability;
pub mod resolver;
pub mod storage;
pub mod table;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::CoordinatorConfig;
    pub use crate::error::{Error, Result};
    pub use crate::id::{OwnerToken, RunId};
    pub use crate::notification::ObjectCreated;
    pub use crate::resolver::{
        Rejection, ResolvedTable, ResolverConfig, TableMapping, TableResolver,
    };
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, WritePrecondition,
        WriteResult,
    };
    pub use crate::table::{TableIdentifier, WarehouseRoot};
}

pub use config::CoordinatorConfig;
pub use error::{Error, Result};
pub use id::{OwnerToken, RunId};
pub use notification::ObjectCreated;
pub use observability::{LogFormat, compaction_span, dispatch_span, init_logging};
pub use resolver::{Rejection, ResolvedTable, ResolverConfig, TableMapping, TableResolver};
pub use storage::{
    MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, WritePrecondition, WriteResult,
};
pub use table::{TableIdentifier, WarehouseRoot};
