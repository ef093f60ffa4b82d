//! End-to-end tests for the queue facade and processing loop using an
//! in-memory store and a scripted transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use offline_queue::{
    BackoffConfig, DeliveryError, DeliveryTransport, Message, OfflineQueue, Priority, QueueError,
    QueueSettings, QueueState,
};

#[derive(Default)]
struct TestTransport {
    delivered: Mutex<Vec<String>>,
    fail_connectivity: AtomicBool,
    fail_rejected: AtomicBool,
    attempts: AtomicU64,
    delay_ms: AtomicU64,
}

impl TestTransport {
    fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }

    fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn set_connectivity_failure(&self, failing: bool) {
        self.fail_connectivity.store(failing, Ordering::SeqCst);
    }

    fn set_rejecting(&self, rejecting: bool) {
        self.fail_rejected.store(rejecting, Ordering::SeqCst);
    }

    fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeliveryTransport for TestTransport {
    async fn deliver(&self, message: &Message) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_connectivity.load(Ordering::SeqCst) {
            return Err(DeliveryError::Offline("link down".into()));
        }
        if self.fail_rejected.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected("not accepted".into()));
        }
        self.delivered.lock().unwrap().push(message.payload.clone());
        Ok(())
    }
}

fn test_settings() -> QueueSettings {
    let mut settings = QueueSettings::default();
    settings.queue.max_size = 100;
    settings.delivery.max_attempts = 3;
    settings.delivery.backoff = BackoffConfig {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
        jitter_factor: 0.0,
    };
    settings
}

async fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_delivery_respects_priority_then_fifo() {
    let transport = Arc::new(TestTransport::default());
    let queue = OfflineQueue::open(test_settings(), transport.clone())
        .await
        .unwrap();

    // Enqueue while paused so ordering is decided by the queue, not timing.
    queue.pause_processing();
    queue.enqueue("A", Priority::Low).await.unwrap();
    queue.enqueue("B", Priority::High).await.unwrap();
    queue.enqueue("C", Priority::Normal).await.unwrap();
    queue.resume_processing();

    wait_for(|| queue.statistics().total_sent == 3).await;
    assert_eq!(transport.delivered(), vec!["B", "C", "A"]);
    assert!(queue.statistics().is_conserved());

    queue.shutdown().await;
}

#[tokio::test]
async fn test_pause_resume_loses_and_duplicates_nothing() {
    let transport = Arc::new(TestTransport::default());
    let queue = OfflineQueue::open(test_settings(), transport.clone())
        .await
        .unwrap();

    queue.pause_processing();
    queue.pause_processing(); // idempotent
    for i in 0..5 {
        queue
            .enqueue(format!("m{}", i), Priority::Normal)
            .await
            .unwrap();
    }
    assert_eq!(queue.size(), 5);
    assert_eq!(transport.delivered().len(), 0);

    queue.resume_processing();
    queue.resume_processing(); // idempotent

    wait_for(|| queue.statistics().total_sent == 5).await;
    let delivered = transport.delivered();
    assert_eq!(delivered.len(), 5);
    let unique: std::collections::HashSet<&String> = delivered.iter().collect();
    assert_eq!(unique.len(), 5);
    assert!(queue.statistics().is_conserved());

    queue.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_message_waits_for_manual_requeue() {
    let transport = Arc::new(TestTransport::default());
    transport.set_rejecting(true);
    let queue = OfflineQueue::open(test_settings(), transport.clone())
        .await
        .unwrap();

    queue.enqueue("stubborn", Priority::Normal).await.unwrap();

    wait_for(|| queue.status().failed == 1).await;
    assert_eq!(transport.attempts(), 3);
    assert_eq!(queue.size(), 0);
    assert!(queue.statistics().is_conserved());

    // No further attempts happen on their own.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.attempts(), 3);

    transport.set_rejecting(false);
    let moved = queue.requeue_failed().await.unwrap();
    assert_eq!(moved, 1);

    wait_for(|| queue.statistics().total_sent == 1).await;
    assert_eq!(queue.status().failed, 0);
    assert_eq!(transport.delivered(), vec!["stubborn"]);
    assert!(queue.statistics().is_conserved());

    queue.shutdown().await;
}

#[tokio::test]
async fn test_connectivity_failures_latch_offline_until_signal() {
    let transport = Arc::new(TestTransport::default());
    transport.set_connectivity_failure(true);

    let mut settings = test_settings();
    settings.delivery.max_attempts = 10;
    settings.delivery.offline_failure_threshold = 2;
    let queue = OfflineQueue::open(settings, transport.clone())
        .await
        .unwrap();

    queue.enqueue("payload", Priority::Normal).await.unwrap();

    wait_for(|| queue.state() == QueueState::Offline).await;
    let attempts_when_offline = transport.attempts();
    assert!(attempts_when_offline >= 2);

    // No delivery happens while offline, even though the queue is non-empty.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.attempts(), attempts_when_offline);

    transport.set_connectivity_failure(false);
    queue.set_online(true);

    wait_for(|| queue.statistics().total_sent == 1).await;
    wait_for(|| queue.state() == QueueState::Idle).await;
    assert!(queue.statistics().is_conserved());

    queue.shutdown().await;
}

#[tokio::test]
async fn test_outage_does_not_consume_retry_budget() {
    let transport = Arc::new(TestTransport::default());
    transport.set_connectivity_failure(true);
    // Shipped defaults: the latch fires on the same failure count as the
    // attempt budget, and the in-flight message must still survive.
    let queue = OfflineQueue::open(test_settings(), transport.clone())
        .await
        .unwrap();

    queue.enqueue("held back", Priority::Normal).await.unwrap();
    wait_for(|| queue.state() == QueueState::Offline).await;

    assert_eq!(queue.status().failed, 0);
    assert_eq!(queue.size(), 1);

    transport.set_connectivity_failure(false);
    queue.set_online(true);

    wait_for(|| queue.statistics().total_sent == 1).await;
    assert_eq!(transport.delivered(), vec!["held back"]);
    assert!(queue.statistics().is_conserved());

    queue.shutdown().await;
}

#[tokio::test]
async fn test_clear_during_inflight_delivery_keeps_counters_consistent() {
    let transport = Arc::new(TestTransport::default());
    transport.set_delay(Duration::from_millis(200));
    let queue = OfflineQueue::open(test_settings(), transport.clone())
        .await
        .unwrap();

    queue.enqueue("slow", Priority::Normal).await.unwrap();
    wait_for(|| transport.attempts() == 1).await;

    queue.clear().await.unwrap();

    // Let the in-flight attempt finish; it must not be recorded against
    // the fresh counters.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = queue.statistics();
    assert_eq!(stats.total_enqueued, 0);
    assert_eq!(stats.total_sent, 0);
    assert!(stats.is_conserved());

    queue.shutdown().await;
}

#[tokio::test]
async fn test_capacity_rejects_new_enqueues() {
    let transport = Arc::new(TestTransport::default());
    let mut settings = test_settings();
    settings.queue.max_size = 2;
    let queue = OfflineQueue::open(settings, transport.clone())
        .await
        .unwrap();

    queue.pause_processing();
    queue.enqueue("a", Priority::Normal).await.unwrap();
    queue.enqueue("b", Priority::Normal).await.unwrap();

    let result = queue.enqueue("c", Priority::High).await;
    assert!(matches!(result, Err(QueueError::CapacityExceeded { .. })));
    assert_eq!(queue.size(), 2);
    assert!(queue.statistics().is_conserved());

    queue.shutdown().await;
}

#[tokio::test]
async fn test_cleanup_expired_removes_dead_messages() {
    let transport = Arc::new(TestTransport::default());
    let queue = OfflineQueue::open(test_settings(), transport.clone())
        .await
        .unwrap();

    queue.pause_processing();
    let dead = Message::builder("dead")
        .expires_at(chrono::Utc::now() - chrono::Duration::milliseconds(1))
        .build();
    queue.enqueue_message(dead).await.unwrap();
    queue.enqueue("live", Priority::Normal).await.unwrap();
    assert_eq!(queue.size(), 2);

    let removed = queue.cleanup_expired().await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(queue.size(), 1);

    let stats = queue.statistics();
    assert_eq!(stats.total_expired, 1);
    assert!(stats.is_conserved());

    queue.resume_processing();
    wait_for(|| queue.statistics().total_sent == 1).await;
    assert_eq!(transport.delivered(), vec!["live"]);

    queue.shutdown().await;
}

#[tokio::test]
async fn test_clear_empties_queue_and_resets_statistics() {
    let transport = Arc::new(TestTransport::default());
    let queue = OfflineQueue::open(test_settings(), transport.clone())
        .await
        .unwrap();

    queue.pause_processing();
    for i in 0..3 {
        queue
            .enqueue(format!("m{}", i), Priority::Normal)
            .await
            .unwrap();
    }

    let removed = queue.clear().await.unwrap();
    assert_eq!(removed, 3);
    assert_eq!(queue.size(), 0);

    let stats = queue.statistics();
    assert_eq!(stats.total_enqueued, 0);
    assert_eq!(stats.total_sent, 0);
    assert_eq!(stats.success_rate, 0.0);
    assert!(stats.is_conserved());

    // Clearing again is a no-op.
    assert_eq!(queue.clear().await.unwrap(), 0);

    queue.shutdown().await;
}

#[tokio::test]
async fn test_state_and_size_are_observable() {
    let transport = Arc::new(TestTransport::default());
    let queue = OfflineQueue::open(test_settings(), transport.clone())
        .await
        .unwrap();

    let size_rx = queue.size_receiver();
    let state_rx = queue.state_receiver();

    queue.pause_processing();
    wait_for(|| *state_rx.borrow() == QueueState::Paused).await;

    queue.enqueue("payload", Priority::Normal).await.unwrap();
    wait_for(|| *size_rx.borrow() == 1).await;

    queue.resume_processing();
    wait_for(|| queue.statistics().total_sent == 1).await;
    wait_for(|| *size_rx.borrow() == 0).await;
    wait_for(|| *state_rx.borrow() == QueueState::Idle).await;

    queue.shutdown().await;
}

#[tokio::test]
async fn test_state_and_snapshot_serialize() {
    let transport = Arc::new(TestTransport::default());
    let queue = OfflineQueue::open(test_settings(), transport.clone())
        .await
        .unwrap();

    assert_eq!(
        serde_json::to_value(QueueState::Idle).unwrap(),
        serde_json::json!("idle")
    );

    queue.pause_processing();
    queue.enqueue("payload", Priority::High).await.unwrap();

    let snapshot = serde_json::to_value(queue.statistics()).unwrap();
    assert_eq!(snapshot["total_enqueued"], 1);
    assert_eq!(snapshot["current_queue_size"], 1);

    queue.shutdown().await;
}
