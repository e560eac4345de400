//! Error types for the coordination layer.
//!
//! Lock conflicts and pending retries are outcomes, not errors. Anything
//! surfaced here is a transient infrastructure failure that the event
//! runtime is expected to redeliver.

use sluice_core::RunId;

use crate::workflow::RunState;

/// The result type used throughout sluice-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in coordination operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The lock store or queue backend failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A retry ticket could not be admitted to the queue.
    #[error("retry enqueue failed for {table}: {message}")]
    Enqueue {
        /// Table the ticket was for.
        table: String,
        /// Description of the failure.
        message: String,
    },

    /// A workflow run could not be started.
    #[error("workflow start failed: {message}")]
    WorkflowStart {
        /// Description of the failure.
        message: String,
    },

    /// A workflow run was not found.
    #[error("run not found: {run_id}")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: RunId,
    },

    /// An invalid run state transition was attempted.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// The current state.
        from: RunState,
        /// The attempted target state.
        to: RunState,
    },

    /// An inbound payload could not be understood.
    #[error("malformed event: {message}")]
    MalformedEvent {
        /// Description of the problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from sluice-core.
    #[error("core error: {0}")]
    Core(#[from] sluice_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: RunState::Succeeded,
            to: RunState::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("SUCCEEDED"));
        assert!(msg.contains("RUNNING"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::storage_with_source("lock store unreachable", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn core_errors_convert() {
        let err: Error = sluice_core::Error::Configuration("bad".into()).into();
        assert!(matches!(err, Error::Core(_)));
    }
}
