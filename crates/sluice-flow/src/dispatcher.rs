//! The dispatcher: turns notifications into serialized compaction runs.
//!
//! Every entry point funnels into one decision:
//!
//! 1. Try to take the table's lease.
//! 2. Granted: start a workflow run and return [`DispatchOutcome::Started`]
//!    without waiting for it. The lease is never released; it expires.
//! 3. Busy: set the retry-pending marker. If one was already live, return
//!    [`DispatchOutcome::Skipped`]; otherwise enqueue a [`RetryTicket`] and
//!    return [`DispatchOutcome::Retried`].
//!
//! Fresh notifications are filtered by suffix and resolved first. Retry
//! tickets clear their marker and go straight to the decision with the
//! table they carry.
//!
//! Infrastructure failures are returned as errors so the event runtime
//! redelivers the whole input; the decision is idempotent under replay.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::Instrument;

use sluice_core::{
    CoordinatorConfig, ObjectCreated, OwnerToken, Rejection, RunId, TableIdentifier,
    TableResolver, dispatch_span,
};

use crate::error::{Error, Result};
use crate::inbound::InboundEvent;
use crate::lease::{AcquireResult, LockStore};
use crate::metrics::FlowMetrics;
use crate::retry::{EnqueueResult, RetryQueue, RetryTicket};
use crate::workflow::{WorkflowInput, WorkflowStarter};

/// Why a notification was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The object is not a delete artifact.
    NotDeleteArtifact,
    /// The lease is busy and a retry is already scheduled.
    RetryPending,
    /// The same table was already handled in this batch.
    DuplicateInBatch,
}

/// What the dispatcher decided for one notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// A workflow run was started.
    Started {
        /// Table being compacted.
        table_id: TableIdentifier,
        /// The started run.
        run_id: RunId,
    },
    /// The lease was busy; a retry ticket was enqueued.
    Retried {
        /// Table to retry.
        table_id: TableIdentifier,
        /// Queue message carrying the ticket.
        message_id: String,
    },
    /// Nothing to do.
    Skipped {
        /// Why.
        reason: SkipReason,
        /// Table, when it was known.
        #[serde(skip_serializing_if = "Option::is_none")]
        table_id: Option<TableIdentifier>,
    },
    /// The location was filtered out by the resolver.
    Rejected {
        /// Why.
        rejection: Rejection,
    },
}

impl DispatchOutcome {
    /// Metric label for this outcome.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Retried { .. } => "retried",
            Self::Skipped { .. } => "skipped",
            Self::Rejected { .. } => "rejected",
        }
    }

    /// Table the outcome concerns, if known.
    #[must_use]
    pub const fn table_id(&self) -> Option<&TableIdentifier> {
        match self {
            Self::Started { table_id, .. } | Self::Retried { table_id, .. } => Some(table_id),
            Self::Skipped { table_id, .. } => table_id.as_ref(),
            Self::Rejected { .. } => None,
        }
    }
}

/// Aggregate status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchStatus {
    /// At least one run was started.
    Triggered,
    /// Nothing started but at least one retry was queued.
    Queued,
    /// Tables matched but every one was skipped.
    Skipped,
    /// No notification named a dispatchable table.
    NoOp,
}

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Aggregate status.
    pub status: BatchStatus,
    /// Distinct tables considered.
    pub tables: usize,
    /// Runs started.
    pub started: usize,
    /// Retry tickets enqueued.
    pub retried: usize,
    /// Notifications skipped.
    pub skipped: usize,
    /// Notifications rejected by the resolver.
    pub rejected: usize,
    /// Whether the delivery carried retry tickets.
    pub is_retry: bool,
    /// Per-notification outcomes, in input order.
    pub outcomes: Vec<DispatchOutcome>,
}

impl DispatchSummary {
    fn from_outcomes(outcomes: Vec<DispatchOutcome>, tables: usize, is_retry: bool) -> Self {
        let count = |label: &str| outcomes.iter().filter(|o| o.label() == label).count();
        let started = count("started");
        let retried = count("retried");
        let skipped = count("skipped");
        let rejected = count("rejected");
        let status = if tables == 0 {
            BatchStatus::NoOp
        } else if started > 0 {
            BatchStatus::Triggered
        } else if retried > 0 {
            BatchStatus::Queued
        } else {
            BatchStatus::Skipped
        };
        Self {
            status,
            tables,
            started,
            retried,
            skipped,
            rejected,
            is_retry,
            outcomes,
        }
    }
}

/// Dispatcher timing settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Filename suffix of delete artifacts.
    pub delete_suffix: String,
    /// Lease hold time.
    pub lock_ttl: Duration,
    /// Delay before a retry ticket becomes visible.
    pub retry_delay: Duration,
    /// Extra life of the retry-pending marker beyond the delay.
    pub retry_marker_buffer: Duration,
}

impl From<&CoordinatorConfig> for DispatchSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            delete_suffix: config.delete_suffix.clone(),
            lock_ttl: config.lock_ttl,
            retry_delay: config.retry_delay,
            retry_marker_buffer: config.retry_marker_buffer,
        }
    }
}

/// The event handler.
#[derive(Clone)]
pub struct Dispatcher {
    resolver: TableResolver,
    settings: DispatchSettings,
    locks: Arc<dyn LockStore>,
    queue: Arc<dyn RetryQueue>,
    starter: Arc<dyn WorkflowStarter>,
    metrics: FlowMetrics,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("queue", &self.queue.queue_name())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        resolver: TableResolver,
        settings: DispatchSettings,
        locks: Arc<dyn LockStore>,
        queue: Arc<dyn RetryQueue>,
        starter: Arc<dyn WorkflowStarter>,
    ) -> Self {
        Self {
            resolver,
            settings,
            locks,
            queue,
            starter,
            metrics: FlowMetrics::new(),
        }
    }

    /// Creates a dispatcher from the coordinator configuration.
    #[must_use]
    pub fn from_config(
        config: &CoordinatorConfig,
        locks: Arc<dyn LockStore>,
        queue: Arc<dyn RetryQueue>,
        starter: Arc<dyn WorkflowStarter>,
    ) -> Self {
        Self::new(
            TableResolver::new(config.resolver.clone()),
            DispatchSettings::from(config),
            locks,
            queue,
            starter,
        )
    }

    /// Returns the resolver in use.
    #[must_use]
    pub fn resolver(&self) -> &TableResolver {
        &self.resolver
    }

    /// Handles one fresh notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock store, queue or workflow starter fails.
    pub async fn handle(&self, notification: ObjectCreated) -> Result<DispatchOutcome> {
        let span = dispatch_span(&notification.bucket, &notification.key);
        async {
            let outcome = match self.prepare(&notification) {
                Ok(input) => self.coordinate(input, notification, None).await?,
                Err(outcome) => outcome,
            };
            self.record(&outcome);
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Handles a redelivered retry ticket.
    ///
    /// The ticket's retry-pending marker is cleared before the lease is
    /// re-checked, so a busy lease schedules a fresh ticket.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock store, queue or workflow starter fails.
    pub async fn handle_retry(&self, ticket: RetryTicket) -> Result<DispatchOutcome> {
        let span = dispatch_span(&ticket.notification.bucket, &ticket.notification.key);
        async {
            let outcome = self.redeliver(ticket).await?;
            self.record(&outcome);
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Handles every event in one delivery, at most once per table.
    ///
    /// # Errors
    ///
    /// Returns the first infrastructure error; the delivery should then be
    /// redelivered as a whole.
    pub async fn handle_batch(&self, events: Vec<InboundEvent>) -> Result<DispatchSummary> {
        let mut seen: HashSet<TableIdentifier> = HashSet::new();
        let mut outcomes = Vec::with_capacity(events.len());
        let mut is_retry = false;

        // Every delivered ticket releases its marker before dedup, so whichever
        // event for the table runs first can schedule the follow-up.
        for event in &events {
            if let InboundEvent::Retry(ticket) = event {
                self.locks
                    .clear_retry_pending(&ticket.table_id.lock_key())
                    .await?;
            }
        }

        for event in events {
            let outcome = match event {
                InboundEvent::Created(notification) => {
                    let span = dispatch_span(&notification.bucket, &notification.key);
                    match self.prepare(&notification) {
                        Err(outcome) => outcome,
                        Ok(input) if !seen.insert(input.table_id.clone()) => {
                            duplicate(input.table_id)
                        }
                        Ok(input) => {
                            self.coordinate(input, notification, None)
                                .instrument(span)
                                .await?
                        }
                    }
                }
                InboundEvent::Retry(ticket) => {
                    is_retry = true;
                    if seen.insert(ticket.table_id.clone()) {
                        let span =
                            dispatch_span(&ticket.notification.bucket, &ticket.notification.key);
                        self.redeliver(ticket).instrument(span).await?
                    } else {
                        // An earlier event already decided for this table.
                        duplicate(ticket.table_id)
                    }
                }
            };
            self.record(&outcome);
            outcomes.push(outcome);
        }

        let summary = DispatchSummary::from_outcomes(outcomes, seen.len(), is_retry);
        tracing::info!(
            status = ?summary.status,
            tables = summary.tables,
            started = summary.started,
            retried = summary.retried,
            skipped = summary.skipped,
            rejected = summary.rejected,
            "batch dispatched"
        );
        Ok(summary)
    }

    /// Delivers every currently visible retry ticket.
    ///
    /// Tickets are acknowledged only after they were handled; a ticket whose
    /// handling failed stays in the queue and reappears after the queue's
    /// visibility timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue itself fails.
    pub async fn pump_retries(&self) -> Result<usize> {
        let mut delivered = 0;
        while let Some(delivery) = self.queue.receive().await? {
            let table = delivery.ticket.table_id.clone();
            match self.handle_retry(delivery.ticket).await {
                Ok(_) => {
                    self.queue.ack(&delivery.receipt).await?;
                    delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        table = %table,
                        receive_count = delivery.receive_count,
                        error = %e,
                        "retry ticket handling failed; leaving it for redelivery"
                    );
                }
            }
        }
        self.metrics
            .set_queue_depth(self.queue.queue_name(), self.queue.depth().await?);
        Ok(delivered)
    }

    /// Suffix filter and resolution for a fresh notification.
    fn prepare(
        &self,
        notification: &ObjectCreated,
    ) -> std::result::Result<WorkflowInput, DispatchOutcome> {
        if !notification.is_delete_artifact(&self.settings.delete_suffix) {
            tracing::debug!("not a delete artifact");
            return Err(DispatchOutcome::Skipped {
                reason: SkipReason::NotDeleteArtifact,
                table_id: None,
            });
        }
        match self.resolver.resolve(&notification.bucket, &notification.key) {
            Ok(resolved) => Ok(resolved.into()),
            Err(rejection) => {
                tracing::info!(%rejection, "notification rejected");
                Err(DispatchOutcome::Rejected { rejection })
            }
        }
    }

    async fn redeliver(&self, ticket: RetryTicket) -> Result<DispatchOutcome> {
        self.locks
            .clear_retry_pending(&ticket.table_id.lock_key())
            .await?;
        tracing::debug!(
            table = %ticket.table_id,
            attempt = ticket.attempt,
            "retry ticket delivered"
        );
        let input = WorkflowInput::new(ticket.table_id.clone(), ticket.warehouse_root.clone());
        let notification = ticket.notification.clone();
        self.coordinate(input, notification, Some(&ticket)).await
    }

    /// The decision shared by every entry point.
    async fn coordinate(
        &self,
        input: WorkflowInput,
        notification: ObjectCreated,
        previous: Option<&RetryTicket>,
    ) -> Result<DispatchOutcome> {
        let key = input.table_id.lock_key();
        let owner = OwnerToken::generate();

        match self
            .locks
            .try_acquire(&key, self.settings.lock_ttl, &owner)
            .await?
        {
            AcquireResult::Acquired(lease) => {
                let table_id = input.table_id.clone();
                let run_id = self.starter.start(input).await?;
                tracing::info!(
                    table = %table_id,
                    %run_id,
                    lease_expires_at = %lease.expires_at,
                    "lease acquired; workflow run started"
                );
                Ok(DispatchOutcome::Started { table_id, run_id })
            }
            AcquireResult::Held { current } => {
                tracing::info!(
                    table = %input.table_id,
                    holder_expires_at = ?current.map(|c| c.expires_at),
                    "lease busy"
                );
                self.schedule_retry(input, notification, previous).await
            }
        }
    }

    async fn schedule_retry(
        &self,
        input: WorkflowInput,
        notification: ObjectCreated,
        previous: Option<&RetryTicket>,
    ) -> Result<DispatchOutcome> {
        let key = input.table_id.lock_key();
        let delay = self.effective_retry_delay();
        let marker_ttl = delay.saturating_add(self.settings.retry_marker_buffer);

        if !self.locks.mark_retry_pending(&key, marker_ttl).await? {
            tracing::info!(table = %input.table_id, "retry already pending");
            return Ok(DispatchOutcome::Skipped {
                reason: SkipReason::RetryPending,
                table_id: Some(input.table_id),
            });
        }

        let ticket = match previous {
            Some(previous) => previous.next_attempt(delay),
            None => RetryTicket::new(
                input.table_id.clone(),
                input.warehouse_root,
                notification,
                delay,
            ),
        };
        let attempt = ticket.attempt;

        let failure = match self.queue.enqueue(ticket, delay).await {
            Ok(EnqueueResult::Enqueued { message_id }) => {
                self.metrics.record_retry_enqueue("enqueued");
                tracing::info!(
                    table = %input.table_id,
                    delay_secs = delay.as_secs(),
                    attempt,
                    %message_id,
                    "retry enqueued"
                );
                return Ok(DispatchOutcome::Retried {
                    table_id: input.table_id,
                    message_id,
                });
            }
            Ok(EnqueueResult::QueueFull) => {
                self.metrics.record_retry_enqueue("queue_full");
                Error::Enqueue {
                    table: input.table_id.to_string(),
                    message: format!("queue '{}' is full", self.queue.queue_name()),
                }
            }
            Err(e) => {
                self.metrics.record_retry_enqueue("error");
                e
            }
        };

        // Without a ticket the marker would block retries until it expires.
        if let Err(e) = self.locks.clear_retry_pending(&key).await {
            tracing::warn!(table = %input.table_id, error = %e, "failed to clear retry marker");
        }
        Err(failure)
    }

    fn effective_retry_delay(&self) -> Duration {
        match self.queue.max_delay() {
            Some(max) if self.settings.retry_delay > max => max,
            _ => self.settings.retry_delay,
        }
    }

    fn record(&self, outcome: &DispatchOutcome) {
        self.metrics.record_outcome(outcome.label());
    }
}

fn duplicate(table_id: TableIdentifier) -> DispatchOutcome {
    DispatchOutcome::Skipped {
        reason: SkipReason::DuplicateInBatch,
        table_id: Some(table_id),
    }
}
