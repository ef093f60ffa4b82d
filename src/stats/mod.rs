//! Processing statistics.
//!
//! Passive counters updated by the processing loop on terminal transitions
//! (and by the facade on accepted enqueues). Monotonic for the process
//! lifetime; reset only by an explicit queue clear.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Window over which queue throughput is measured
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// Monotonic counters for the queue's lifecycle events.
#[derive(Debug, Default)]
pub struct ProcessingStats {
    total_enqueued: AtomicU64,
    total_sent: AtomicU64,
    total_failed: AtomicU64,
    total_expired: AtomicU64,
    processing_time_total_ms: AtomicU64,
    processing_time_samples: AtomicU64,
    /// Bumped by `reset`; work that started before a clear carries the old
    /// value and must not be recorded against the fresh counters
    epoch: AtomicU64,
    /// Timestamps of recent terminal transitions, for throughput
    window: Mutex<VecDeque<Instant>>,
}

impl ProcessingStats {
    pub fn record_enqueued(&self) {
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Account for messages restored from the persistent store so the
    /// conservation invariant holds after a restart. Recovered failed
    /// messages re-enter already counted as failed.
    pub fn record_recovered(&self, pending: u64, failed: u64) {
        self.total_enqueued
            .fetch_add(pending + failed, Ordering::Relaxed);
        self.total_failed.fetch_add(failed, Ordering::Relaxed);
    }

    /// A manual requeue grants a failed message a fresh intake: it was
    /// already counted under `total_failed`, so it re-enters the books as a
    /// new admission.
    pub fn record_requeued(&self, count: u64) {
        self.total_enqueued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_sent(&self, elapsed: Duration) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        self.processing_time_total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.processing_time_samples.fetch_add(1, Ordering::Relaxed);
        self.record_terminal(1);
    }

    pub fn record_failed(&self) {
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        self.record_terminal(1);
    }

    pub fn record_expired(&self, count: u64) {
        self.total_expired.fetch_add(count, Ordering::Relaxed);
        self.record_terminal(count);
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent.load(Ordering::Relaxed)
    }

    /// Current accounting epoch. Callers snapshot this when they take
    /// ownership of a message and compare before recording its terminal
    /// transition.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn record_terminal(&self, count: u64) {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..count {
            window.push_back(now);
        }
        Self::trim_window(&mut window, now);
    }

    fn trim_window(window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) > THROUGHPUT_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Take a consistent snapshot, combining the counters with the current
    /// queue sizes supplied by the facade.
    pub fn snapshot(&self, current_queue_size: usize, failed_queue_size: usize) -> StatsSnapshot {
        let total_enqueued = self.total_enqueued.load(Ordering::Relaxed);
        let total_sent = self.total_sent.load(Ordering::Relaxed);
        let samples = self.processing_time_samples.load(Ordering::Relaxed);
        let total_ms = self.processing_time_total_ms.load(Ordering::Relaxed);

        let throughput = {
            let now = Instant::now();
            let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            Self::trim_window(&mut window, now);
            window.len() as f64 / THROUGHPUT_WINDOW.as_secs_f64()
        };

        StatsSnapshot {
            total_enqueued,
            total_sent,
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_expired: self.total_expired.load(Ordering::Relaxed),
            current_queue_size,
            failed_queue_size,
            success_rate: if total_enqueued > 0 {
                total_sent as f64 / total_enqueued as f64
            } else {
                0.0
            },
            average_processing_time_ms: if samples > 0 {
                total_ms as f64 / samples as f64
            } else {
                0.0
            },
            queue_throughput: throughput,
        }
    }

    /// Zero every counter. Only the explicit clear path calls this. The
    /// epoch is bumped first so concurrent recorders holding the old epoch
    /// stop before the counters are zeroed.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.total_enqueued.store(0, Ordering::Relaxed);
        self.total_sent.store(0, Ordering::Relaxed);
        self.total_failed.store(0, Ordering::Relaxed);
        self.total_expired.store(0, Ordering::Relaxed);
        self.processing_time_total_ms.store(0, Ordering::Relaxed);
        self.processing_time_samples.store(0, Ordering::Relaxed);
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Snapshot of queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_enqueued: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_expired: u64,
    pub current_queue_size: usize,
    pub failed_queue_size: usize,
    /// total_sent / total_enqueued, 0.0 when nothing has been enqueued
    pub success_rate: f64,
    /// Cumulative mean over successful delivery attempts
    pub average_processing_time_ms: f64,
    /// Terminal transitions per second over the last 60 seconds
    pub queue_throughput: f64,
}

impl StatsSnapshot {
    /// Conservation invariant: every admission is accounted for exactly once.
    /// Messages retained in the failed set are already counted under
    /// `total_failed` (`failed_queue_size` is the retained subset of it), and
    /// a manual requeue counts as a fresh admission.
    pub fn is_conserved(&self) -> bool {
        self.total_enqueued
            == self.total_sent
                + self.total_failed
                + self.total_expired
                + self.current_queue_size as u64
    }
}
