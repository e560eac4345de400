//! Retry queue persisted in object storage.
//!
//! Each ticket is one JSON object, `{prefix}/{message_id}.json`, holding the
//! ticket, the time it next becomes visible, and the receipt of its current
//! delivery. Message IDs are ULIDs, so listing order is enqueue order.
//!
//! `receive` claims a due ticket by rewriting it with a new receipt and a
//! pushed-back visibility time under a `MatchesVersion` precondition; of two
//! consumers racing for the same ticket only one wins. `ack` deletes the
//! object if the receipt still matches.
//!
//! Tickets survive process restarts, which keeps them consistent with the
//! retry-pending markers held by
//! [`StorageLockStore`](crate::lease::storage::StorageLockStore).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use sluice_core::{StorageBackend, WritePrecondition, WriteResult};

use super::memory::DEFAULT_VISIBILITY_TIMEOUT;
use super::{EnqueueResult, RetryDelivery, RetryQueue, RetryTicket};
use crate::error::{Error, Result};
use crate::lease::expiry_after;

/// Default key prefix for queued tickets.
pub const DEFAULT_PREFIX: &str = "sluice/retries";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredTicket {
    message_id: String,
    ticket: RetryTicket,
    visible_at: DateTime<Utc>,
    #[serde(default)]
    receipt: Option<String>,
    #[serde(default)]
    receive_count: u32,
}

/// Delayed-delivery queue over a [`StorageBackend`].
pub struct StorageRetryQueue<S: StorageBackend + ?Sized> {
    name: String,
    storage: Arc<S>,
    prefix: String,
    visibility_timeout: Duration,
    max_capacity: Option<usize>,
    max_delay: Option<Duration>,
}

impl<S: StorageBackend + ?Sized> std::fmt::Debug for StorageRetryQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRetryQueue")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}

impl<S: StorageBackend + ?Sized> StorageRetryQueue<S> {
    /// Creates a queue rooted at [`DEFAULT_PREFIX`].
    #[must_use]
    pub fn new(storage: Arc<S>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage,
            prefix: DEFAULT_PREFIX.to_string(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_capacity: None,
            max_delay: None,
        }
    }

    /// Roots the queue at `prefix`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_matches('/').to_string();
        self
    }

    /// Bounds the number of held tickets.
    #[must_use]
    pub const fn with_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = Some(max_capacity);
        self
    }

    /// Bounds the accepted delay.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Sets how long a received ticket stays hidden.
    #[must_use]
    pub const fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn ticket_path(&self, message_id: &str) -> String {
        format!("{}/{message_id}.json", self.prefix)
    }

    async fn read(&self, path: &str) -> Result<Option<(StoredTicket, String)>> {
        let Some((data, version)) = self.storage.get(path).await? else {
            return Ok(None);
        };
        let stored = serde_json::from_slice(&data).map_err(|e| Error::Serialization {
            message: format!("parse {path}: {e}"),
        })?;
        Ok(Some((stored, version)))
    }

    async fn held(&self) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .storage
            .list(&self.prefix)
            .await?
            .into_iter()
            .map(|meta| meta.path)
            .filter(|path| path.ends_with(".json"))
            .collect();
        paths.sort_unstable();
        Ok(paths)
    }
}

#[async_trait]
impl<S: StorageBackend + ?Sized> RetryQueue for StorageRetryQueue<S> {
    async fn enqueue(&self, ticket: RetryTicket, delay: Duration) -> Result<EnqueueResult> {
        if let Some(max) = self.max_delay {
            if delay > max {
                return Err(Error::Enqueue {
                    table: ticket.table_id.to_string(),
                    message: format!(
                        "delay of {}s exceeds the queue maximum of {}s",
                        delay.as_secs(),
                        max.as_secs()
                    ),
                });
            }
        }
        if let Some(max) = self.max_capacity {
            if self.held().await?.len() >= max {
                return Ok(EnqueueResult::QueueFull);
            }
        }

        let message_id = Ulid::new().to_string();
        let stored = StoredTicket {
            message_id: message_id.clone(),
            ticket,
            visible_at: expiry_after(Utc::now(), delay),
            receipt: None,
            receive_count: 0,
        };
        let body = Bytes::from(serde_json::to_vec(&stored)?);

        match self
            .storage
            .put(&self.ticket_path(&message_id), body, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(EnqueueResult::Enqueued { message_id }),
            WriteResult::PreconditionFailed => Err(Error::Enqueue {
                table: stored.ticket.table_id.to_string(),
                message: format!("message id {message_id} already in use"),
            }),
        }
    }

    async fn receive(&self) -> Result<Option<RetryDelivery>> {
        let now = Utc::now();

        let mut due = Vec::new();
        for path in self.held().await? {
            match self.read(&path).await {
                Ok(Some((stored, version))) if stored.visible_at <= now => {
                    due.push((path, stored, version));
                }
                Ok(_) => {}
                Err(e @ Error::Serialization { .. }) => {
                    tracing::warn!(
                        queue = %self.name,
                        path = %path,
                        error = %e,
                        "skipping unreadable ticket"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        due.sort_by_key(|(_, stored, _)| stored.visible_at);

        for (path, mut stored, version) in due {
            let receipt = format!("{}:{}", stored.message_id, Ulid::new());
            stored.receipt = Some(receipt.clone());
            stored.receive_count = stored.receive_count.saturating_add(1);
            stored.visible_at = expiry_after(now, self.visibility_timeout);
            let body = Bytes::from(serde_json::to_vec(&stored)?);

            match self
                .storage
                .put(&path, body, WritePrecondition::MatchesVersion(version))
                .await?
            {
                WriteResult::Success { .. } => {
                    return Ok(Some(RetryDelivery {
                        receipt,
                        message_id: stored.message_id,
                        receive_count: stored.receive_count,
                        ticket: stored.ticket,
                    }));
                }
                WriteResult::PreconditionFailed => {
                    tracing::debug!(
                        queue = %self.name,
                        path = %path,
                        "ticket claimed by another consumer"
                    );
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let Some((message_id, _)) = receipt.split_once(':') else {
            tracing::debug!(queue = %self.name, receipt, "ack for malformed receipt");
            return Ok(());
        };
        let path = self.ticket_path(message_id);
        match self.read(&path).await? {
            Some((stored, _)) if stored.receipt.as_deref() == Some(receipt) => {
                self.storage.delete(&path).await?;
            }
            _ => tracing::debug!(queue = %self.name, receipt, "ack for unknown receipt"),
        }
        Ok(())
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self.held().await?.len())
    }

    fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{MemoryBackend, ObjectCreated, WarehouseRoot};

    fn ticket() -> RetryTicket {
        RetryTicket::new(
            "catalog.sales.orders".parse().expect("table"),
            WarehouseRoot::new("s3", "wh", ""),
            ObjectCreated::new("wh", "sales/orders/data/1-deletes.parquet"),
            Duration::ZERO,
        )
    }

    fn queue(backend: &Arc<MemoryBackend>) -> StorageRetryQueue<MemoryBackend> {
        StorageRetryQueue::new(Arc::clone(backend), "q")
            .with_visibility_timeout(Duration::from_millis(30))
    }

    #[tokio::test]
    async fn delayed_ticket_is_invisible_until_due() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = queue(&backend);
        queue
            .enqueue(ticket(), Duration::from_millis(50))
            .await
            .expect("enqueue");
        assert!(queue.receive().await.expect("receive").is_none());
        assert_eq!(queue.depth().await.expect("depth"), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let delivery = queue.receive().await.expect("receive").expect("due");
        assert_eq!(delivery.receive_count, 1);
        assert_eq!(delivery.ticket.notification, ticket().notification);
    }

    #[tokio::test]
    async fn tickets_outlive_the_queue_instance() {
        let backend = Arc::new(MemoryBackend::new());
        queue(&backend)
            .enqueue(ticket(), Duration::ZERO)
            .await
            .expect("enqueue");

        let restarted = queue(&backend);
        let delivery = restarted.receive().await.expect("receive").expect("visible");
        restarted.ack(&delivery.receipt).await.expect("ack");
        assert_eq!(restarted.depth().await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn a_delivery_is_handed_to_one_consumer() {
        let backend = Arc::new(MemoryBackend::new());
        let (a, b) = (queue(&backend), queue(&backend));
        a.enqueue(ticket(), Duration::ZERO).await.expect("enqueue");

        assert!(a.receive().await.expect("receive").is_some());
        assert!(b.receive().await.expect("receive").is_none());
    }

    #[tokio::test]
    async fn unacked_ticket_reappears_and_stale_receipt_is_ignored() {
        let backend = Arc::new(MemoryBackend::new());
        let queue = queue(&backend);
        queue.enqueue(ticket(), Duration::ZERO).await.expect("enqueue");

        let first = queue.receive().await.expect("receive").expect("visible");
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = queue.receive().await.expect("receive").expect("redelivered");
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(second.receive_count, 2);

        queue.ack(&first.receipt).await.expect("stale ack");
        assert_eq!(queue.depth().await.expect("depth"), 1);
        queue.ack(&second.receipt).await.expect("ack");
        assert_eq!(queue.depth().await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn unreadable_ticket_does_not_block_the_queue() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .put(
                "sluice/retries/00000000000000000000000000.json",
                Bytes::from_static(b"not json"),
                WritePrecondition::None,
            )
            .await
            .expect("put");
        let queue = queue(&backend);
        queue.enqueue(ticket(), Duration::ZERO).await.expect("enqueue");
        assert!(queue.receive().await.expect("receive").is_some());
    }

    #[tokio::test]
    async fn capacity_and_max_delay_are_enforced() {
        let backend = Arc::new(MemoryBackend::new());
        let bounded = queue(&backend)
            .with_capacity(1)
            .with_max_delay(Duration::from_secs(900));
        assert!(
            bounded
                .enqueue(ticket(), Duration::ZERO)
                .await
                .expect("enqueue")
                .is_enqueued()
        );
        assert_eq!(
            bounded.enqueue(ticket(), Duration::ZERO).await.expect("enqueue"),
            EnqueueResult::QueueFull
        );
        assert!(matches!(
            bounded.enqueue(ticket(), Duration::from_secs(901)).await,
            Err(Error::Enqueue { .. })
        ));
    }
}
