//! In-memory retry queue with delayed visibility.
//!
//! ## Limitations
//!
//! - **Single-process only**: tickets are not visible across process boundaries
//! - **No persistence**: all state is lost when the process exits
//! - **Ordering**: tickets are handed out by visibility time, ties broken by
//!   enqueue order

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use super::{EnqueueResult, RetryDelivery, RetryQueue, RetryTicket};
use crate::error::{Error, Result};
use crate::lease::expiry_after;

/// Default time a received ticket stays hidden before reappearing.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Entry {
    message_id: String,
    ticket: RetryTicket,
    visible_at: DateTime<Utc>,
    receipt: Option<String>,
    receive_count: u32,
}

/// In-memory delayed-delivery queue.
///
/// ## Example
///
/// ```rust
/// use std::time::Duration;
/// use sluice_flow::retry::memory::InMemoryRetryQueue;
///
/// let queue = InMemoryRetryQueue::new("retries")
///     .with_max_delay(Duration::from_secs(900));
/// ```
#[derive(Debug)]
pub struct InMemoryRetryQueue {
    name: String,
    entries: RwLock<Vec<Entry>>,
    visibility_timeout: Duration,
    max_capacity: Option<usize>,
    max_delay: Option<Duration>,
}

impl Default for InMemoryRetryQueue {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("retry queue lock poisoned")
}

impl InMemoryRetryQueue {
    /// Creates an unbounded queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(Vec::new()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_capacity: None,
            max_delay: None,
        }
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

    /// Returns every held ticket in enqueue order, visible or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<RetryTicket>> {
        let entries = self.entries.read().map_err(poison_err)?;
        Ok(entries.iter().map(|e| e.ticket.clone()).collect())
    }
}

#[async_trait]
impl RetryQueue for InMemoryRetryQueue {
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

        let mut entries = self.entries.write().map_err(poison_err)?;
        if let Some(max) = self.max_capacity {
            if entries.len() >= max {
                return Ok(EnqueueResult::QueueFull);
            }
        }

        let message_id = Ulid::new().to_string();
        entries.push(Entry {
            message_id: message_id.clone(),
            ticket,
            visible_at: expiry_after(Utc::now(), delay),
            receipt: None,
            receive_count: 0,
        });
        drop(entries);

        Ok(EnqueueResult::Enqueued { message_id })
    }

    async fn receive(&self) -> Result<Option<RetryDelivery>> {
        let now = Utc::now();
        let mut entries = self.entries.write().map_err(poison_err)?;

        let next = entries
            .iter_mut()
            .filter(|e| e.visible_at <= now)
            .min_by_key(|e| e.visible_at);
        let Some(entry) = next else {
            return Ok(None);
        };

        let receipt = Ulid::new().to_string();
        entry.receipt = Some(receipt.clone());
        entry.receive_count = entry.receive_count.saturating_add(1);
        entry.visible_at = expiry_after(now, self.visibility_timeout);
        let delivery = RetryDelivery {
            receipt,
            message_id: entry.message_id.clone(),
            receive_count: entry.receive_count,
            ticket: entry.ticket.clone(),
        };
        drop(entries);

        Ok(Some(delivery))
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let before = entries.len();
        entries.retain(|e| e.receipt.as_deref() != Some(receipt));
        if entries.len() == before {
            tracing::debug!(queue = %self.name, receipt, "ack for unknown receipt");
        }
        Ok(())
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(poison_err)?.len())
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
    use sluice_core::{ObjectCreated, WarehouseRoot};

    fn ticket() -> RetryTicket {
        RetryTicket::new(
            "catalog.sales.orders".parse().expect("table"),
            WarehouseRoot::new("s3", "wh", ""),
            ObjectCreated::new("wh", "sales/orders/data/1-deletes.parquet"),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn delayed_ticket_is_invisible_until_due() {
        let queue = InMemoryRetryQueue::new("q");
        queue
            .enqueue(ticket(), Duration::from_millis(50))
            .await
            .expect("enqueue");
        assert!(queue.receive().await.expect("receive").is_none());
        assert_eq!(queue.depth().await.expect("depth"), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let delivery = queue.receive().await.expect("receive").expect("due");
        assert_eq!(delivery.receive_count, 1);
    }

    #[tokio::test]
    async fn acked_ticket_is_gone() {
        let queue = InMemoryRetryQueue::new("q");
        queue.enqueue(ticket(), Duration::ZERO).await.expect("enqueue");
        let delivery = queue.receive().await.expect("receive").expect("visible");
        queue.ack(&delivery.receipt).await.expect("ack");
        assert_eq!(queue.depth().await.expect("depth"), 0);
        queue.ack(&delivery.receipt).await.expect("repeat ack is harmless");
    }

    #[tokio::test]
    async fn unacked_ticket_reappears_after_visibility_timeout() {
        let queue = InMemoryRetryQueue::new("q").with_visibility_timeout(Duration::from_millis(30));
        queue.enqueue(ticket(), Duration::ZERO).await.expect("enqueue");

        let first = queue.receive().await.expect("receive").expect("visible");
        assert!(queue.receive().await.expect("receive").is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = queue.receive().await.expect("receive").expect("redelivered");
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(second.receive_count, 2);
        assert_ne!(first.receipt, second.receipt);

        queue.ack(&first.receipt).await.expect("stale ack");
        assert_eq!(queue.depth().await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn capacity_and_max_delay_are_enforced() {
        let queue = InMemoryRetryQueue::new("q")
            .with_capacity(1)
            .with_max_delay(Duration::from_secs(900));
        assert!(
            queue
                .enqueue(ticket(), Duration::ZERO)
                .await
                .expect("enqueue")
                .is_enqueued()
        );
        assert_eq!(
            queue.enqueue(ticket(), Duration::ZERO).await.expect("enqueue"),
            EnqueueResult::QueueFull
        );

        let bounded = InMemoryRetryQueue::new("q").with_max_delay(Duration::from_secs(900));
        assert!(matches!(
            bounded.enqueue(ticket(), Duration::from_secs(901)).await,
            Err(Error::Enqueue { .. })
        ));
        assert_eq!(bounded.max_delay(), Some(Duration::from_secs(900)));
    }
}
