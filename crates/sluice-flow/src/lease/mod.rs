//! Per-table leases and retry-pending markers.
//!
//! A [`LockStore`] holds two small keyed records per table:
//!
//! - the **lease**: created by a conditional insert that succeeds when no
//!   record exists or the existing one has expired. There is no release;
//!   the lease only ever ends by expiry, so a crashed or hung job cannot
//!   leave its table locked.
//! - the **retry-pending marker**: single-flight guard ensuring at most one
//!   retry ticket per table is admitted while the lease is busy. It follows
//!   the same insert-unless-live rule and is cleared when its ticket is
//!   delivered.
//!
//! ## Implementations
//!
//! - [`memory::InMemoryLockStore`]: process-local, for tests and single-node use
//! - [`storage::StorageLockStore`]: object storage with CAS takeover of
//!   expired records

pub mod memory;
pub mod storage;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::OwnerToken;

use crate::error::Result;

/// A table lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Lock key (the rendered table identifier).
    pub key: String,
    /// Holder of the lease, for diagnostics.
    pub owner_token: OwnerToken,
    /// When the lease was granted.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses.
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// Creates a lease starting now.
    #[must_use]
    pub fn new(key: impl Into<String>, owner_token: OwnerToken, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            owner_token,
            acquired_at: now,
            expires_at: expiry_after(now, ttl),
        }
    }

    /// Returns whether the lease has lapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Returns whether the lease has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Returns the remaining lease time, or zero if expired.
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A retry-pending marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryMarker {
    /// Lock key the marker guards.
    pub key: String,
    /// When the marker was set.
    pub set_at: DateTime<Utc>,
    /// When the marker lapses on its own.
    pub expires_at: DateTime<Utc>,
}

impl RetryMarker {
    /// Creates a marker starting now.
    #[must_use]
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            set_at: now,
            expires_at: expiry_after(now, ttl),
        }
    }

    /// Returns whether the marker has lapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireResult {
    /// The lease was granted.
    Acquired(LockRecord),
    /// A live lease exists.
    Held {
        /// The live lease, when the store could read it.
        current: Option<LockRecord>,
    },
}

impl AcquireResult {
    /// Returns true if the lease was granted.
    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Keyed lease and marker store.
///
/// Both operations are single atomic conditional writes. Implementations
/// must never grant two live leases for the same key, even under concurrent
/// callers in different processes.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Attempts to take the lease for `key`.
    ///
    /// Succeeds when no record exists or the existing record has expired.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backing store fails. A live lease is
    /// reported as [`AcquireResult::Held`].
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
        owner: &OwnerToken,
    ) -> Result<AcquireResult>;

    /// Sets the retry-pending marker for `key` unless a live one exists.
    ///
    /// Returns `true` when this call set the marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    async fn mark_retry_pending(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Removes the retry-pending marker for `key`. Succeeds if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    async fn clear_retry_pending(&self, key: &str) -> Result<()>;

    /// Returns the current lease record for `key`, expired or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    async fn current(&self, key: &str) -> Result<Option<LockRecord>>;

    /// Returns whether a live retry-pending marker exists for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    async fn retry_pending(&self, key: &str) -> Result<bool>;
}

/// `now + ttl`, saturating at the maximum representable instant.
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expiry() {
        let record = LockRecord::new("c.d.t", OwnerToken::generate(), Duration::from_secs(60));
        assert!(!record.is_expired());
        assert!(record.remaining_ttl() > Duration::from_secs(55));
        assert!(record.is_expired_at(record.expires_at));

        let lapsed = LockRecord::new("c.d.t", OwnerToken::generate(), Duration::ZERO);
        assert!(lapsed.is_expired());
        assert_eq!(lapsed.remaining_ttl(), Duration::ZERO);
    }

    #[test]
    fn huge_ttl_saturates() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn lock_record_serializes_camel_case() {
        let record = LockRecord::new("c.d.t", OwnerToken::generate(), Duration::from_secs(1));
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("ownerToken"));
        assert!(json.contains("expiresAt"));
    }
}
