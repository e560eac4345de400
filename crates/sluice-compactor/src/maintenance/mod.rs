//! Table maintenance operations the compaction driver depends on.
//!
//! The rewrite algorithms themselves live behind [`TableMaintenance`]; the
//! driver only sequences calls and reads counts. [`http::HttpTableMaintenance`]
//! talks to a remote maintenance service.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sluice_core::TableIdentifier;

/// Errors raised by maintenance operations.
#[derive(Debug, thiserror::Error)]
pub enum MaintenanceError {
    /// The operation is not available for this table or format version.
    #[error("{operation} is not supported for table {table}")]
    Unsupported {
        /// Operation name.
        operation: &'static str,
        /// Table the operation targeted.
        table: String,
    },

    /// The maintenance service answered with a failure status.
    #[error("{operation} failed with status {status}: {body}")]
    Status {
        /// Operation name.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The request could not be sent or timed out.
    #[error("{operation} request failed: {message}")]
    Request {
        /// Operation name.
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The response body did not have the expected shape.
    #[error("{operation} returned an unreadable response: {message}")]
    Decode {
        /// Operation name.
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The adapter is misconfigured.
    #[error("maintenance configuration error: {0}")]
    Configuration(String),

    /// The operation failed inside the table engine.
    #[error("{operation} failed: {message}")]
    Failed {
        /// Operation name.
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },
}

impl MaintenanceError {
    /// Returns true if the operation is unavailable rather than broken.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// Result type for maintenance operations.
pub type Result<T> = std::result::Result<T, MaintenanceError>;

/// Options of the base data rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteOptions {
    /// Rewrite every qualifying file, not only small ones.
    pub rewrite_all: bool,
    /// Outstanding delete files that qualify a data file for rewrite.
    pub delete_file_threshold: u32,
    /// Target size of output files.
    pub target_file_size_bytes: u64,
}

/// File statistics of a base data rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteStats {
    /// Data files written.
    pub added_files: u64,
    /// Data files replaced.
    pub rewritten_files: u64,
    /// Delete files no longer referenced.
    pub removed_delete_files: u64,
    /// File groups that failed to rewrite.
    pub failed_files: u64,
}

/// File statistics of a delete-file rewrite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteRewriteStats {
    /// Delete files replaced.
    pub rewritten_delete_files: u64,
    /// Delete files written.
    pub added_delete_files: u64,
}

/// What snapshot expiry removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpireStats {
    /// Data files deleted.
    pub deleted_data_files: u64,
    /// Delete files deleted.
    pub deleted_delete_files: u64,
    /// Manifest files deleted.
    pub deleted_manifest_files: u64,
}

/// Maintenance operations against one table.
///
/// Every call must return within bounded time; callers never retry
/// internally.
#[async_trait]
pub trait TableMaintenance: Send + Sync {
    /// Counts outstanding delete files in the current snapshot.
    async fn delete_file_count(&self, table: &TableIdentifier) -> Result<u64>;

    /// Rewrites data files together with the deletes that apply to them.
    async fn rewrite_data_files(
        &self,
        table: &TableIdentifier,
        options: RewriteOptions,
    ) -> Result<RewriteStats>;

    /// Rewrites leftover delete files.
    ///
    /// May return [`MaintenanceError::Unsupported`] for formats without the
    /// operation.
    async fn rewrite_position_deletes(&self, table: &TableIdentifier)
    -> Result<DeleteRewriteStats>;

    /// Reloads table metadata after commits.
    async fn refresh(&self, table: &TableIdentifier) -> Result<()>;

    /// Expires snapshots, keeping the newest `retain_last`.
    async fn expire_snapshots(&self, table: &TableIdentifier, retain_last: u32)
    -> Result<ExpireStats>;
}
