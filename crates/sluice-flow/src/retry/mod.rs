//! Delayed retry of busy tables.
//!
//! When a table's lease is held, the dispatcher parks the original
//! notification in a [`RetryTicket`] and hands it to a [`RetryQueue`] with
//! a visibility delay. Redelivery re-enters the dispatcher through the same
//! decision function as a fresh notification.
//!
//! ## Delivery contract
//!
//! - `receive` returns at most one visible ticket and hides it for the
//!   queue's visibility timeout
//! - `ack` destroys the ticket; an unacknowledged ticket reappears
//! - queues may declare a maximum delay, which callers must respect
//!
//! ## Implementations
//!
//! - [`memory::InMemoryRetryQueue`]: process-local, for tests and single-node use
//! - [`storage::StorageRetryQueue`]: one object per ticket, claimed by CAS

pub mod memory;
pub mod storage;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use sluice_core::{ObjectCreated, TableIdentifier, WarehouseRoot};

use crate::error::Result;
use crate::lease::expiry_after;

/// "This table needs another attempt later."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryTicket {
    /// Unique ticket identifier.
    pub ticket_id: String,
    /// Table to retry.
    pub table_id: TableIdentifier,
    /// Warehouse the table lives in.
    pub warehouse_root: WarehouseRoot,
    /// The notification that first triggered the attempt, replayed verbatim.
    pub notification: ObjectCreated,
    /// Earliest time the ticket should be processed.
    pub not_before: DateTime<Utc>,
    /// Number of lease conflicts this notification has hit so far (1-indexed).
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

const fn first_attempt() -> u32 {
    1
}

impl RetryTicket {
    /// Creates a ticket for a table whose lease was busy.
    #[must_use]
    pub fn new(
        table_id: TableIdentifier,
        warehouse_root: WarehouseRoot,
        notification: ObjectCreated,
        delay: Duration,
    ) -> Self {
        Self {
            ticket_id: Ulid::new().to_string(),
            table_id,
            warehouse_root,
            notification,
            not_before: expiry_after(Utc::now(), delay),
            attempt: first_attempt(),
        }
    }

    /// Creates the follow-up ticket after this one hit a busy lease again.
    #[must_use]
    pub fn next_attempt(&self, delay: Duration) -> Self {
        Self {
            ticket_id: Ulid::new().to_string(),
            not_before: expiry_after(Utc::now(), delay),
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

/// Result of enqueuing a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Ticket was enqueued successfully.
    Enqueued {
        /// Queue-specific message ID.
        message_id: String,
    },
    /// Queue is at capacity.
    QueueFull,
}

impl EnqueueResult {
    /// Returns true if the ticket was enqueued.
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }

    /// Returns the message ID if enqueued.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Enqueued { message_id } => Some(message_id),
            Self::QueueFull => None,
        }
    }
}

/// A ticket handed out by [`RetryQueue::receive`].
#[derive(Debug, Clone)]
pub struct RetryDelivery {
    /// Handle used to acknowledge this delivery.
    pub receipt: String,
    /// Queue-specific message ID, stable across redeliveries.
    pub message_id: String,
    /// How many times the message has been received, including this one.
    pub receive_count: u32,
    /// The ticket.
    pub ticket: RetryTicket,
}

/// Delayed-delivery queue of retry tickets.
#[async_trait]
pub trait RetryQueue: Send + Sync {
    /// Enqueues a ticket that becomes visible after `delay`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or `delay` exceeds
    /// [`RetryQueue::max_delay`].
    async fn enqueue(&self, ticket: RetryTicket, delay: Duration) -> Result<EnqueueResult>;

    /// Receives the next visible ticket, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn receive(&self) -> Result<Option<RetryDelivery>>;

    /// Acknowledges a delivery, destroying its ticket.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn ack(&self, receipt: &str) -> Result<()>;

    /// Approximate number of tickets held, visible or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn depth(&self) -> Result<usize>;

    /// Longest delay the queue accepts, if bounded.
    fn max_delay(&self) -> Option<Duration> {
        None
    }

    /// Returns the queue's name or identifier.
    fn queue_name(&self) -> &str;
}
