//! In-memory lock store.
//!
//! ## Limitations
//!
//! - **Single-process only**: leases are not visible across process boundaries
//! - **No persistence**: all state is lost when the process exits
//!
//! Expired records are never swept; they are replaced by the next
//! successful acquisition, which mirrors stores with lazy TTL deletion.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use sluice_core::OwnerToken;

use super::{AcquireResult, LockRecord, LockStore, RetryMarker};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct State {
    leases: HashMap<String, LockRecord>,
    markers: HashMap<String, RetryMarker>,
}

/// In-memory lock store for tests and single-node deployments.
///
/// ## Example
///
/// ```rust
/// use sluice_flow::lease::memory::InMemoryLockStore;
///
/// let store = InMemoryLockStore::new();
/// // Share behind an Arc with the dispatcher...
/// ```
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    state: RwLock<State>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock store poisoned")
}

impl InMemoryLockStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
        owner: &OwnerToken,
    ) -> Result<AcquireResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing) = state.leases.get(key) {
            if !existing.is_expired_at(Utc::now()) {
                let current = existing.clone();
                drop(state);
                return Ok(AcquireResult::Held {
                    current: Some(current),
                });
            }
        }

        let record = LockRecord::new(key, owner.clone(), ttl);
        state.leases.insert(key.to_string(), record.clone());
        drop(state);

        Ok(AcquireResult::Acquired(record))
    }

    async fn mark_retry_pending(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;

        if state.markers.get(key).is_some_and(|m| !m.is_expired()) {
            return Ok(false);
        }
        state
            .markers
            .insert(key.to_string(), RetryMarker::new(key, ttl));
        drop(state);
        Ok(true)
    }

    async fn clear_retry_pending(&self, key: &str) -> Result<()> {
        self.state.write().map_err(poison_err)?.markers.remove(key);
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<Option<LockRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.leases.get(key).cloned())
    }

    async fn retry_pending(&self, key: &str) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.markers.get(key).is_some_and(|m| !m.is_expired()))
    }
}
