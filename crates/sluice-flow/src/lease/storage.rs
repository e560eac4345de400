//! Lock store over object storage.
//!
//! Each record is a small JSON object:
//!
//! ```text
//! {prefix}/{key}.lock    lease
//! {prefix}/{key}.retry   retry-pending marker
//! ```
//!
//! Keys are percent-encoded into a single path segment.
//!
//! Acquisition is a `DoesNotExist` write. When that fails the existing
//! record is read together with its version; if it has expired it is
//! replaced with a `MatchesVersion` write, so two contenders racing to take
//! over the same stale record cannot both win.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use sluice_core::{OwnerToken, StorageBackend, WritePrecondition, WriteResult};

use super::{AcquireResult, LockRecord, LockStore, RetryMarker};
use crate::error::{Error, Result};

/// Default key prefix for coordination records.
pub const DEFAULT_PREFIX: &str = "sluice/locks";

fn object_name(key: &str) -> String {
    url::form_urlencoded::byte_serialize(key.as_bytes()).collect()
}

/// Outcome of a conditional claim on one record path.
enum Claim<T> {
    /// This caller wrote the record.
    Claimed,
    /// A live record exists.
    Live(T),
    /// The record changed underneath us; someone else holds it now.
    Lost,
}

trait Expiring {
    fn expired(&self) -> bool;
}

impl Expiring for LockRecord {
    fn expired(&self) -> bool {
        self.is_expired()
    }
}

impl Expiring for RetryMarker {
    fn expired(&self) -> bool {
        self.is_expired()
    }
}

/// Lock store persisted in a [`StorageBackend`].
pub struct StorageLockStore<S: StorageBackend + ?Sized> {
    storage: Arc<S>,
    prefix: String,
}

impl<S: StorageBackend + ?Sized> Clone for StorageLockStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            prefix: self.prefix.clone(),
        }
    }
}

impl<S: StorageBackend + ?Sized> std::fmt::Debug for StorageLockStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageLockStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl<S: StorageBackend + ?Sized> StorageLockStore<S> {
    /// Creates a store rooted at [`DEFAULT_PREFIX`].
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_prefix(storage, DEFAULT_PREFIX)
    }

    /// Creates a store rooted at `prefix`.
    #[must_use]
    pub fn with_prefix(storage: Arc<S>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    fn lock_path(&self, key: &str) -> String {
        format!("{}/{}.lock", self.prefix, object_name(key))
    }

    fn marker_path(&self, key: &str) -> String {
        format!("{}/{}.retry", self.prefix, object_name(key))
    }

    async fn read<T: DeserializeOwned>(&self, path: &str) -> Result<Option<(T, String)>> {
        let Some((data, version)) = self.storage.get(path).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&data).map_err(|e| Error::Serialization {
            message: format!("parse {path}: {e}"),
        })?;
        Ok(Some((record, version)))
    }

    /// Writes `record` at `path` unless a live record is already there.
    async fn claim<T>(&self, path: &str, record: &T) -> Result<Claim<T>>
    where
        T: Serialize + DeserializeOwned + Expiring + Send + Sync,
    {
        let body = Bytes::from(serde_json::to_vec(record)?);

        match self
            .storage
            .put(path, body.clone(), WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => return Ok(Claim::Claimed),
            WriteResult::PreconditionFailed => {}
        }

        // The expiry decision must be bound to the version used for the swap.
        let Some((existing, version)) = self.read::<T>(path).await? else {
            return Ok(Claim::Lost);
        };
        if !existing.expired() {
            return Ok(Claim::Live(existing));
        }

        match self
            .storage
            .put(path, body, WritePrecondition::MatchesVersion(version))
            .await?
        {
            WriteResult::Success { .. } => {
                tracing::debug!(path, "took over expired record");
                Ok(Claim::Claimed)
            }
            WriteResult::PreconditionFailed => Ok(Claim::Lost),
        }
    }
}

#[async_trait]
impl<S: StorageBackend + ?Sized> LockStore for StorageLockStore<S> {
    async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
        owner: &OwnerToken,
    ) -> Result<AcquireResult> {
        let record = LockRecord::new(key, owner.clone(), ttl);
        Ok(match self.claim(&self.lock_path(key), &record).await? {
            Claim::Claimed => AcquireResult::Acquired(record),
            Claim::Live(current) => AcquireResult::Held {
                current: Some(current),
            },
            Claim::Lost => AcquireResult::Held { current: None },
        })
    }

    async fn mark_retry_pending(&self, key: &str, ttl: Duration) -> Result<bool> {
        let marker = RetryMarker::new(key, ttl);
        Ok(matches!(
            self.claim(&self.marker_path(key), &marker).await?,
            Claim::Claimed
        ))
    }

    async fn clear_retry_pending(&self, key: &str) -> Result<()> {
        self.storage.delete(&self.marker_path(key)).await?;
        Ok(())
    }

    async fn current(&self, key: &str) -> Result<Option<LockRecord>> {
        Ok(self
            .read::<LockRecord>(&self.lock_path(key))
            .await?
            .map(|(record, _)| record))
    }

    async fn retry_pending(&self, key: &str) -> Result<bool> {
        Ok(self
            .read::<RetryMarker>(&self.marker_path(key))
            .await?
            .is_some_and(|(marker, _)| !marker.is_expired()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::MemoryBackend;

    const TTL: Duration = Duration::from_secs(60);

    fn store() -> StorageLockStore<MemoryBackend> {
        StorageLockStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let store = store();
        let owner = OwnerToken::generate();
        assert!(store.try_acquire("c.d.t", TTL, &owner).await.expect("acquire").is_acquired());

        let second = store
            .try_acquire("c.d.t", TTL, &OwnerToken::generate())
            .await
            .expect("acquire");
        let AcquireResult::Held { current: Some(current) } = second else {
            panic!("expected live lease, got {second:?}");
        };
        assert_eq!(current.owner_token, owner);
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_by_cas() {
        let store = store();
        store
            .try_acquire("c.d.t", Duration::from_millis(10), &OwnerToken::generate())
            .await
            .expect("acquire");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let next = OwnerToken::generate();
        assert!(store.try_acquire("c.d.t", TTL, &next).await.expect("acquire").is_acquired());
        let current = store.current("c.d.t").await.expect("read").expect("exists");
        assert_eq!(current.owner_token, next);
    }

    #[tokio::test]
    async fn marker_round_trip() {
        let store = store();
        assert!(store.mark_retry_pending("c.d.t", TTL).await.expect("mark"));
        assert!(!store.mark_retry_pending("c.d.t", TTL).await.expect("mark"));
        store.clear_retry_pending("c.d.t").await.expect("clear");
        store.clear_retry_pending("c.d.t").await.expect("idempotent clear");
        assert!(store.mark_retry_pending("c.d.t", TTL).await.expect("mark"));
    }

    #[tokio::test]
    async fn records_live_under_prefix() {
        let backend = Arc::new(MemoryBackend::new());
        let store = StorageLockStore::with_prefix(Arc::clone(&backend), "/coord/");
        store
            .try_acquire("c.d.t", TTL, &OwnerToken::generate())
            .await
            .expect("acquire");
        store.mark_retry_pending("c.d.t", TTL).await.expect("mark");
        assert!(backend.head("coord/c.d.t.lock").await.expect("head").is_some());
        assert!(backend.head("coord/c.d.t.retry").await.expect("head").is_some());
    }

    #[tokio::test]
    async fn keys_are_encoded_into_one_segment() {
        let backend = Arc::new(MemoryBackend::new());
        let store = StorageLockStore::with_prefix(Arc::clone(&backend), "coord");
        let key = "c.d.ord#ers?v=1 %/x";
        assert!(
            store
                .try_acquire(key, TTL, &OwnerToken::generate())
                .await
                .expect("acquire")
                .is_acquired()
        );
        assert!(
            backend
                .head("coord/c.d.ord%23ers%3Fv%3D1+%25%2Fx.lock")
                .await
                .expect("head")
                .is_some()
        );

        let again = store
            .try_acquire(key, TTL, &OwnerToken::generate())
            .await
            .expect("acquire");
        assert!(!again.is_acquired());
        let other = store
            .try_acquire("c.d.ord", TTL, &OwnerToken::generate())
            .await
            .expect("acquire");
        assert!(other.is_acquired());
    }

    proptest::proptest! {
        #[test]
        fn object_names_are_single_distinct_segments(
            a in "[a-z#?% /=.]{1,12}",
            b in "[a-z#?% /=.]{1,12}",
        ) {
            let (name_a, name_b) = (object_name(&a), object_name(&b));
            proptest::prop_assert!(!name_a.contains('/'));
            proptest::prop_assert_eq!(a == b, name_a == name_b);
        }
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .put(
                "sluice/locks/c.d.t.lock",
                Bytes::from_static(b"not json"),
                WritePrecondition::None,
            )
            .await
            .expect("put");
        let store = StorageLockStore::new(backend);
        let result = store.try_acquire("c.d.t", TTL, &OwnerToken::generate()).await;
        assert!(matches!(result, Err(Error::Serialization { .. })));
    }
}
