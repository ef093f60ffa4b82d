//! Background processing loop.
//!
//! Drains the priority queue one message at a time: expired messages are
//! dropped, everything else is handed to the [`DeliveryTransport`]. Failed
//! attempts are retried with exponential backoff until the attempt budget is
//! spent, at which point the message moves to the failed set. Consecutive
//! connectivity failures latch the queue into the `Offline` state until the
//! host signals connectivity again.

mod backoff;

pub use backoff::{BackoffConfig, ExponentialBackoff};

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};

use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::message::{Message, MessageStatus};
use crate::metrics;
use crate::queue::PriorityQueue;
use crate::stats::ProcessingStats;
use crate::store::MessageStore;

/// Store writes are retried a few times before the queue gives up and
/// latches into the `Error` state.
const PERSIST_RETRY_LIMIT: u32 = 5;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Observable state of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    /// No pending messages
    Idle,
    /// Actively delivering messages
    Processing,
    /// Delivery suspended by the host
    Paused,
    /// Connectivity lost; waiting for an online signal
    Offline,
    /// Store writes are failing; manual intervention required
    Error,
}

/// Outbound delivery seam. The host supplies the actual transport; the queue
/// only cares about success, failure class, and latency.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError>;
}

/// Channels wiring the loop to its facade.
pub(crate) struct LoopChannels {
    pub state_tx: watch::Sender<QueueState>,
    pub size_tx: Arc<watch::Sender<usize>>,
    pub paused_rx: watch::Receiver<bool>,
    pub online_rx: watch::Receiver<bool>,
    pub wake: Arc<Notify>,
    pub shutdown: broadcast::Receiver<()>,
}

pub(crate) struct ProcessingLoop {
    store: Arc<dyn MessageStore>,
    queue: Arc<PriorityQueue>,
    failed: Arc<Mutex<Vec<Message>>>,
    stats: Arc<ProcessingStats>,
    transport: Arc<dyn DeliveryTransport>,
    config: DeliveryConfig,
    channels: LoopChannels,
    backoff: ExponentialBackoff,
    consecutive_failures: u32,
    offline_latched: bool,
    errored: bool,
}

impl ProcessingLoop {
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<PriorityQueue>,
        failed: Arc<Mutex<Vec<Message>>>,
        stats: Arc<ProcessingStats>,
        transport: Arc<dyn DeliveryTransport>,
        config: DeliveryConfig,
        channels: LoopChannels,
    ) -> Self {
        let backoff = ExponentialBackoff::with_config(config.backoff.clone());
        Self {
            store,
            queue,
            failed,
            stats,
            transport,
            config,
            channels,
            backoff,
            consecutive_failures: 0,
            offline_latched: false,
            errored: false,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            backend = self.store.backend_type(),
            "queue processing loop started"
        );

        loop {
            match self.channels.shutdown.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                // A received, lagged or closed channel all mean shutdown.
                _ => break,
            }

            let state = self.resolve_state();
            self.set_state(state);

            if state == QueueState::Processing {
                if !self.process_next().await {
                    break;
                }
            } else if !self.wait_for_change().await {
                break;
            }
        }

        tracing::info!("queue processing loop stopped");
    }

    fn resolve_state(&self) -> QueueState {
        if self.errored {
            QueueState::Error
        } else if *self.channels.paused_rx.borrow() {
            QueueState::Paused
        } else if self.offline_latched || !*self.channels.online_rx.borrow() {
            QueueState::Offline
        } else if self.queue.is_empty() {
            QueueState::Idle
        } else {
            QueueState::Processing
        }
    }

    /// Block until something that affects the resolved state changes.
    /// Returns false once shutdown is requested.
    async fn wait_for_change(&mut self) -> bool {
        tokio::select! {
            _ = self.channels.shutdown.recv() => false,
            changed = self.channels.paused_rx.changed() => changed.is_ok(),
            changed = self.channels.online_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
                // The online signal is the only thing that clears the latch.
                if *self.channels.online_rx.borrow() {
                    self.offline_latched = false;
                    self.consecutive_failures = 0;
                    tracing::info!("connectivity restored, resuming delivery");
                }
                true
            }
            _ = self.channels.wake.notified() => true,
        }
    }

    /// Deliver the head of the queue. Returns false once shutdown is
    /// requested (it can fire while sleeping out a retry backoff).
    async fn process_next(&mut self) -> bool {
        let Some(message) = self.queue.pop() else {
            return true;
        };
        // Ownership marker: a clear that runs while this message is in
        // flight bumps the epoch, and its terminal transition must then
        // neither be counted nor requeued.
        let epoch = self.stats.epoch();
        self.publish_size();

        if message.is_expired(Utc::now()) {
            self.expire(message, epoch).await;
            return true;
        }

        let started = Instant::now();
        let result = self.transport.deliver(&message).await;
        let elapsed = started.elapsed();
        metrics::DELIVERY_DURATION_SECONDS.observe(elapsed.as_secs_f64());

        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.offline_latched = false;
                self.backoff.reset();
                self.complete(message, elapsed, epoch).await;
                true
            }
            Err(err) => {
                if let Some(delay) = self.handle_failure(message, err, epoch).await {
                    tokio::select! {
                        _ = self.channels.shutdown.recv() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                true
            }
        }
    }

    async fn complete(&mut self, message: Message, elapsed: Duration, epoch: u64) {
        if let Err(e) = self.store.delete(message.id).await {
            tracing::warn!(error = %e, id = %message.id, "failed to remove delivered message from store");
        }
        if self.stats.epoch() != epoch {
            tracing::debug!(id = %message.id, "delivery finished after a clear, not counted");
            return;
        }
        self.stats.record_sent(elapsed);
        metrics::QUEUE_SENT_TOTAL.inc();
        tracing::debug!(
            id = %message.id,
            elapsed_ms = elapsed.as_millis() as u64,
            "message delivered"
        );
    }

    async fn expire(&mut self, mut message: Message, epoch: u64) {
        message.status = MessageStatus::Expired;
        if let Err(e) = self.store.delete(message.id).await {
            tracing::warn!(error = %e, id = %message.id, "failed to remove expired message from store");
        }
        if self.stats.epoch() != epoch {
            return;
        }
        self.stats.record_expired(1);
        metrics::QUEUE_EXPIRED_TOTAL.inc();
        tracing::debug!(id = %message.id, "dropped expired message");
    }

    /// Record a failed attempt. Returns the backoff delay to sleep before
    /// the next attempt, or None when no retry should be scheduled.
    async fn handle_failure(
        &mut self,
        mut message: Message,
        err: DeliveryError,
        epoch: u64,
    ) -> Option<Duration> {
        if self.stats.epoch() != epoch {
            tracing::debug!(id = %message.id, "message removed by a concurrent clear, dropped");
            return None;
        }

        if err.is_connectivity() {
            // An outage says nothing about the message itself: its retry
            // budget stays intact and it goes straight back to the queue.
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.config.offline_failure_threshold {
                self.offline_latched = true;
                tracing::warn!(
                    failures = self.consecutive_failures,
                    "connectivity lost, queue going offline"
                );
            }
            tracing::debug!(
                id = %message.id,
                error = %err,
                "delivery blocked by connectivity, message requeued"
            );
            if let Err(e) = self.queue.reinsert(message) {
                tracing::error!(error = %e, "failed to requeue message after outage");
            }
            self.publish_size();
            return if self.offline_latched {
                None
            } else {
                Some(self.backoff.next_delay())
            };
        }

        self.consecutive_failures = 0;
        message.attempts += 1;

        if message.attempts >= self.config.max_attempts {
            message.status = MessageStatus::Failed;
            tracing::warn!(
                id = %message.id,
                attempts = message.attempts,
                error = %err,
                "message exhausted its delivery attempts"
            );
            self.persist(&message).await;
            if !self.discard_if_cleared(&message, epoch).await {
                self.stats.record_failed();
                metrics::QUEUE_FAILED_TOTAL.inc();
                self.failed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(message);
            }
            None
        } else {
            tracing::debug!(
                id = %message.id,
                attempts = message.attempts,
                error = %err,
                "delivery attempt failed, message requeued"
            );
            self.persist(&message).await;
            if self.discard_if_cleared(&message, epoch).await {
                return None;
            }
            if let Err(e) = self.queue.reinsert(message) {
                tracing::error!(error = %e, "failed to requeue message for retry");
            }
            self.publish_size();
            Some(self.backoff.next_delay())
        }
    }

    /// A clear may land while `persist` is writing the record back; in that
    /// case the write is rolled back and the message dropped.
    async fn discard_if_cleared(&mut self, message: &Message, epoch: u64) -> bool {
        if self.stats.epoch() == epoch {
            return false;
        }
        if let Err(e) = self.store.delete(message.id).await {
            tracing::warn!(error = %e, id = %message.id, "failed to drop record written during clear");
        }
        true
    }

    /// Write the updated record back to the store, retrying transient
    /// failures. Repeated failures latch the queue into the `Error` state.
    async fn persist(&mut self, message: &Message) {
        for attempt in 1..=PERSIST_RETRY_LIMIT {
            match self.store.put(message).await {
                Ok(()) => return,
                Err(e) if attempt < PERSIST_RETRY_LIMIT => {
                    tracing::warn!(error = %e, attempt, "store write failed, retrying");
                    tokio::time::sleep(PERSIST_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        id = %message.id,
                        "store writes failing persistently, queue entering error state"
                    );
                    self.errored = true;
                }
            }
        }
    }

    fn set_state(&self, state: QueueState) {
        self.channels.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = ?current, to = ?state, "queue state changed");
                *current = state;
                true
            }
        });
    }

    fn publish_size(&self) {
        let len = self.queue.len();
        self.channels.size_tx.send_if_modified(|current| {
            if *current == len {
                false
            } else {
                *current = len;
                true
            }
        });
        metrics::QUEUE_DEPTH.set(len as i64);
    }
}
