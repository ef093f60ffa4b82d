//! Prometheus metrics for the offline queue.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
    TextEncoder,
};

lazy_static! {
    /// Messages accepted into the queue
    pub static ref QUEUE_ENQUEUED_TOTAL: IntCounter = register_int_counter!(
        "offline_queue_enqueued_total",
        "Total number of messages accepted into the queue"
    )
    .unwrap();

    /// Messages rejected at the capacity bound
    pub static ref QUEUE_REJECTED_TOTAL: IntCounter = register_int_counter!(
        "offline_queue_rejected_total",
        "Total number of enqueue attempts rejected because the queue was full"
    )
    .unwrap();

    /// Messages delivered successfully
    pub static ref QUEUE_SENT_TOTAL: IntCounter = register_int_counter!(
        "offline_queue_sent_total",
        "Total number of messages delivered successfully"
    )
    .unwrap();

    /// Messages that exhausted their delivery attempts
    pub static ref QUEUE_FAILED_TOTAL: IntCounter = register_int_counter!(
        "offline_queue_failed_total",
        "Total number of messages that exhausted their delivery attempts"
    )
    .unwrap();

    /// Messages dropped because their TTL elapsed
    pub static ref QUEUE_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        "offline_queue_expired_total",
        "Total number of messages dropped after their TTL elapsed"
    )
    .unwrap();

    /// Current number of pending messages
    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "offline_queue_depth",
        "Current number of pending messages in the queue"
    )
    .unwrap();

    /// Delivery attempt latency
    pub static ref DELIVERY_DURATION_SECONDS: Histogram = register_histogram!(
        "offline_queue_delivery_duration_seconds",
        "Time spent in a single delivery attempt",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap();
}

/// Render all registered metrics in the Prometheus text format.
pub fn encode() -> Result<String, prometheus::Error> {
    let metric_families = prometheus::gather();
    TextEncoder::new().encode_to_string(&metric_families)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_encode() {
        QUEUE_ENQUEUED_TOTAL.inc();
        QUEUE_DEPTH.set(3);
        DELIVERY_DURATION_SECONDS.observe(0.02);

        let output = encode().unwrap();
        assert!(output.contains("offline_queue_enqueued_total"));
        assert!(output.contains("offline_queue_depth"));
    }
}
