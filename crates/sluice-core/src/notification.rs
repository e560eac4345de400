//! Object-creation notifications.
//!
//! The notification bus delivers these at-least-once, unordered and possibly
//! duplicated. Nothing here assumes ordering; consumers must be idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A storage notification announcing that an object was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCreated {
    /// Bucket the object was written to.
    pub bucket: String,
    /// Full object key within the bucket.
    pub key: String,
    /// When the storage layer recorded the creation, if the transport says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,
}

impl ObjectCreated {
    /// Creates a notification without an event time.
    #[must_use]
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            event_time: None,
        }
    }

    /// Sets the event time.
    #[must_use]
    pub const fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = Some(event_time);
        self
    }

    /// Returns true when the object's filename ends with the delete-artifact suffix.
    #[must_use]
    pub fn is_delete_artifact(&self, suffix: &str) -> bool {
        !suffix.is_empty() && self.key.ends_with(suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_filter() {
        let n = ObjectCreated::new("wh", "sales/orders/data/00001-deletes.parquet");
        assert!(n.is_delete_artifact("-deletes.parquet"));
        assert!(!n.is_delete_artifact("-puffin.bin"));
        assert!(!n.is_delete_artifact(""));
    }

    #[test]
    fn event_time_is_optional_on_the_wire() {
        let n: ObjectCreated =
            serde_json::from_str(r#"{"bucket":"wh","key":"a/b/c"}"#).expect("parse");
        assert!(n.event_time.is_none());
    }
}
