//! Queue facade.
//!
//! [`OfflineQueue`] is the single entry point hosts interact with: it owns
//! the store, the in-memory priority queue, the failed set and the spawned
//! processing loop, and exposes the control surface (enqueue, pause/resume,
//! requeue, cleanup, clear) plus observable state and size streams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::error::{QueueError, Result};
use crate::message::{Message, MessageStatus, Priority};
use crate::metrics;
use crate::processor::{DeliveryTransport, LoopChannels, ProcessingLoop, QueueState};
use crate::queue::PriorityQueue;
use crate::stats::{ProcessingStats, StatsSnapshot};
use crate::store::{create_store, MessageStore};

/// Coarse queue counts for host status displays.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatus {
    /// Pending messages awaiting delivery
    pub total: usize,
    /// Pending messages in the high-priority band
    pub high_priority: usize,
    /// Messages retained in the failed set
    pub failed: usize,
    /// Messages delivered since startup (or the last clear)
    pub sent: u64,
}

/// A durable, priority-ordered outbound message queue with background
/// delivery.
pub struct OfflineQueue {
    store: Arc<dyn MessageStore>,
    queue: Arc<PriorityQueue>,
    failed: Arc<Mutex<Vec<Message>>>,
    stats: Arc<ProcessingStats>,
    settings: QueueSettings,
    paused_tx: watch::Sender<bool>,
    online_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<QueueState>,
    size_tx: Arc<watch::Sender<usize>>,
    size_rx: watch::Receiver<usize>,
    wake: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl OfflineQueue {
    /// Build the store, recover any persisted messages and spawn the
    /// processing loop.
    pub async fn open(
        settings: QueueSettings,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Result<Self> {
        let store = create_store(&settings.store).await?;
        let queue = Arc::new(PriorityQueue::new(settings.queue.max_size));
        let failed = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(ProcessingStats::default());

        Self::recover(store.as_ref(), &queue, &failed, &stats).await?;

        let (paused_tx, paused_rx) = watch::channel(false);
        let (online_tx, online_rx) = watch::channel(true);
        let (state_tx, state_rx) = watch::channel(QueueState::Idle);
        let (size_tx, size_rx) = watch::channel(queue.len());
        let size_tx = Arc::new(size_tx);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let wake = Arc::new(Notify::new());

        metrics::QUEUE_DEPTH.set(queue.len() as i64);

        let channels = LoopChannels {
            state_tx,
            size_tx: size_tx.clone(),
            paused_rx,
            online_rx,
            wake: wake.clone(),
            shutdown: shutdown_rx,
        };
        let processing = ProcessingLoop::new(
            store.clone(),
            queue.clone(),
            failed.clone(),
            stats.clone(),
            transport,
            settings.delivery.clone(),
            channels,
        );
        let handle = tokio::spawn(processing.run());

        Ok(Self {
            store,
            queue,
            failed,
            stats,
            settings,
            paused_tx,
            online_tx,
            state_rx,
            size_tx,
            size_rx,
            wake,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        })
    }

    async fn recover(
        store: &dyn MessageStore,
        queue: &PriorityQueue,
        failed: &Mutex<Vec<Message>>,
        stats: &ProcessingStats,
    ) -> Result<()> {
        let records = store.list_all().await.map_err(QueueError::Persistence)?;
        if records.is_empty() {
            return Ok(());
        }

        let mut pending = Vec::new();
        let mut failed_records = Vec::new();
        let mut stale = Vec::new();
        for record in records {
            match record.status {
                MessageStatus::Pending => pending.push(record),
                MessageStatus::Failed => failed_records.push(record),
                // Terminal leftovers from an interrupted shutdown
                MessageStatus::Sent | MessageStatus::Expired => stale.push(record.id),
            }
        }

        for id in stale {
            if let Err(e) = store.delete(id).await {
                tracing::warn!(error = %e, id = %id, "failed to drop stale record during recovery");
            }
        }

        let pending_count = pending.len();
        let failed_count = failed_records.len();
        queue.recover(pending);
        failed_records.sort_by_key(|m| m.created_at);
        failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(failed_records);
        stats.record_recovered(pending_count as u64, failed_count as u64);

        tracing::info!(
            pending = pending_count,
            failed = failed_count,
            "recovered persisted messages"
        );
        Ok(())
    }

    /// Enqueue a payload for background delivery. The configured default TTL
    /// is applied when one is set. Returns the assigned message id.
    pub async fn enqueue(&self, payload: impl Into<String>, priority: Priority) -> Result<Uuid> {
        let mut builder = Message::builder(payload).priority(priority);
        if self.settings.delivery.default_ttl_seconds > 0 {
            builder = builder.ttl_seconds(self.settings.delivery.default_ttl_seconds);
        }
        self.enqueue_message(builder.build()).await
    }

    /// Enqueue a pre-built message (full control over ttl and expiry).
    ///
    /// The message is persisted before it becomes visible to the processing
    /// loop, so an accepted enqueue survives a crash.
    pub async fn enqueue_message(&self, message: Message) -> Result<Uuid> {
        self.ensure_open()?;
        let id = message.id;

        self.store.put(&message).await?;
        if let Err(e) = self.queue.insert(message) {
            // Roll the persisted record back so the store mirrors the queue.
            if let Err(del) = self.store.delete(id).await {
                tracing::warn!(error = %del, id = %id, "failed to roll back rejected enqueue");
            }
            if matches!(e, QueueError::CapacityExceeded { .. }) {
                metrics::QUEUE_REJECTED_TOTAL.inc();
                tracing::warn!(id = %id, "enqueue rejected, queue at capacity");
            }
            return Err(e);
        }

        self.stats.record_enqueued();
        metrics::QUEUE_ENQUEUED_TOTAL.inc();
        self.publish_size();
        self.wake.notify_one();
        tracing::debug!(id = %id, "message enqueued");
        Ok(id)
    }

    /// Coarse counts for status displays.
    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            total: self.queue.len(),
            high_priority: self.queue.high_priority_len(),
            failed: self.failed_len(),
            sent: self.stats.total_sent(),
        }
    }

    /// Full statistics snapshot.
    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot(self.queue.len(), self.failed_len())
    }

    /// Suspend delivery. Idempotent; pending messages are retained.
    pub fn pause_processing(&self) {
        let changed = self.paused_tx.send_if_modified(|paused| {
            if *paused {
                false
            } else {
                *paused = true;
                true
            }
        });
        if changed {
            tracing::info!("queue processing paused");
        }
    }

    /// Resume delivery. Idempotent.
    pub fn resume_processing(&self) {
        let changed = self.paused_tx.send_if_modified(|paused| {
            if *paused {
                *paused = false;
                true
            } else {
                false
            }
        });
        if changed {
            self.wake.notify_one();
            tracing::info!("queue processing resumed");
        }
    }

    /// Feed the host's connectivity signal to the processing loop. Sending
    /// `true` also clears an offline latch caused by repeated delivery
    /// failures, so it is not deduplicated.
    pub fn set_online(&self, online: bool) {
        let _ = self.online_tx.send(online);
    }

    /// Move the entire failed set back to pending with a fresh attempt
    /// budget. Returns how many messages were requeued.
    pub async fn requeue_failed(&self) -> Result<usize> {
        self.ensure_open()?;
        let mut remaining: VecDeque<Message> = {
            let mut failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *failed).into()
        };

        let mut moved = 0usize;
        while let Some(original) = remaining.pop_front() {
            let mut message = original.clone();
            message.attempts = 0;
            message.status = MessageStatus::Pending;

            if let Err(e) = self.store.put(&message).await {
                // Put this one and the rest back untouched.
                let mut failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
                failed.push(original);
                failed.extend(remaining);
                drop(failed);
                self.finish_requeue(moved);
                return Err(e.into());
            }
            if let Err(e) = self.queue.reinsert(message) {
                tracing::error!(error = %e, "failed to requeue message");
                continue;
            }
            moved += 1;
        }

        self.finish_requeue(moved);
        Ok(moved)
    }

    fn finish_requeue(&self, moved: usize) {
        if moved > 0 {
            self.stats.record_requeued(moved as u64);
            self.publish_size();
            self.wake.notify_one();
            tracing::info!(count = moved, "requeued failed messages");
        }
    }

    /// Drop every pending or failed message past its expiry deadline.
    /// Returns how many messages were removed.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.ensure_open()?;
        let now = Utc::now();

        let expired_pending = self.queue.take_expired(now);
        let expired_failed: Vec<Message> = {
            let mut failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
            let (dead, live): (Vec<Message>, Vec<Message>) =
                std::mem::take(&mut *failed).into_iter().partition(|m| m.is_expired(now));
            *failed = live;
            dead
        };

        let pending_count = expired_pending.len();
        let count = pending_count + expired_failed.len();
        for message in expired_pending.iter().chain(expired_failed.iter()) {
            if let Err(e) = self.store.delete(message.id).await {
                tracing::warn!(error = %e, id = %message.id, "failed to drop expired message from store");
            }
        }

        if count > 0 {
            // Failed messages were already counted terminally; only pending
            // expirations add to the expired total (and its metric mirror).
            self.stats.record_expired(pending_count as u64);
            metrics::QUEUE_EXPIRED_TOTAL.inc_by(pending_count as u64);
            self.publish_size();
            tracing::info!(count, "removed expired messages");
        }
        Ok(count)
    }

    /// Remove everything: pending messages, the failed set, all persisted
    /// records and the statistics counters. Returns how many messages were
    /// dropped from the queues.
    pub async fn clear(&self) -> Result<usize> {
        self.ensure_open()?;
        // Reset first: the epoch bump stops an in-flight attempt from
        // recording or requeuing its message while the drains run.
        self.stats.reset();
        let drained = self.queue.drain().len();
        let failed = {
            let mut failed = self.failed.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *failed).len()
        };
        self.store.clear().await?;
        self.publish_size();
        tracing::info!(pending = drained, failed, "queue cleared");
        Ok(drained + failed)
    }

    /// Current queue state.
    pub fn state(&self) -> QueueState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<QueueState> {
        self.state_rx.clone()
    }

    /// State transitions as an async stream for reactive consumers.
    pub fn state_stream(&self) -> WatchStream<QueueState> {
        WatchStream::new(self.state_rx.clone())
    }

    /// Current pending-message count.
    pub fn size(&self) -> usize {
        self.queue.len()
    }

    /// Subscribe to queue size changes.
    pub fn size_receiver(&self) -> watch::Receiver<usize> {
        self.size_rx.clone()
    }

    /// Size changes as an async stream.
    pub fn size_stream(&self) -> WatchStream<usize> {
        WatchStream::new(self.size_rx.clone())
    }

    /// Stop the processing loop and wait for it to finish. Further calls on
    /// the queue return [`QueueError::Closed`]. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        self.wake.notify_one();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "processing loop terminated abnormally");
            }
        }
        tracing::info!("queue shut down");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    fn failed_len(&self) -> usize {
        self.failed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn publish_size(&self) {
        let len = self.queue.len();
        self.size_tx.send_if_modified(|current| {
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

impl Drop for OfflineQueue {
    fn drop(&mut self) {
        // Best effort: stop the loop if the host never called shutdown.
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use async_trait::async_trait;

    struct SilentTransport;

    #[async_trait]
    impl DeliveryTransport for SilentTransport {
        async fn deliver(&self, _message: &Message) -> std::result::Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn memory_settings() -> QueueSettings {
        QueueSettings::default()
    }

    #[tokio::test]
    async fn test_enqueue_while_paused_is_visible_in_status() {
        let queue = OfflineQueue::open(memory_settings(), Arc::new(SilentTransport))
            .await
            .unwrap();
        queue.pause_processing();

        queue.enqueue("a", Priority::High).await.unwrap();
        queue.enqueue("b", Priority::Low).await.unwrap();

        let status = queue.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.high_priority, 1);
        assert_eq!(status.failed, 0);

        assert!(queue.statistics().is_conserved());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_fail_closed() {
        let queue = OfflineQueue::open(memory_settings(), Arc::new(SilentTransport))
            .await
            .unwrap();
        queue.shutdown().await;

        let result = queue.enqueue("late", Priority::Normal).await;
        assert!(matches!(result, Err(QueueError::Closed)));
        assert!(matches!(queue.clear().await, Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_cleanup_counts_only_pending_expirations() {
        let queue = OfflineQueue::open(memory_settings(), Arc::new(SilentTransport))
            .await
            .unwrap();
        queue.pause_processing();

        let past = chrono::Utc::now() - chrono::Duration::milliseconds(1);
        queue
            .enqueue_message(Message::builder("dead pending").expires_at(past).build())
            .await
            .unwrap();

        // A failed message past its deadline was already counted terminally.
        let mut dead_failed = Message::builder("dead failed").expires_at(past).build();
        dead_failed.status = MessageStatus::Failed;
        queue
            .failed
            .lock()
            .unwrap()
            .push(dead_failed);

        let metric_before = metrics::QUEUE_EXPIRED_TOTAL.get();
        let removed = queue.cleanup_expired().await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(queue.statistics().total_expired, 1);
        assert_eq!(metrics::QUEUE_EXPIRED_TOTAL.get() - metric_before, 1);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_resets_counters() {
        let queue = OfflineQueue::open(memory_settings(), Arc::new(SilentTransport))
            .await
            .unwrap();
        queue.pause_processing();
        queue.enqueue("a", Priority::Normal).await.unwrap();
        queue.enqueue("b", Priority::Normal).await.unwrap();

        let removed = queue.clear().await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(queue.size(), 0);

        let stats = queue.statistics();
        assert_eq!(stats.total_enqueued, 0);
        assert_eq!(stats.current_queue_size, 0);
        queue.shutdown().await;
    }
}
