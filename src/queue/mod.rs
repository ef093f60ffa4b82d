//! Priority queue core.
//!
//! Maintains the in-memory working set of PENDING messages, ordered by
//! (priority descending, creation time ascending) with FIFO within a band.
//! All operations go through a single mutex so concurrent enqueuers cannot
//! interleave and break the ordering invariant.
//!
//! Capacity bounds new admissions only: [`PriorityQueue::insert`] rejects a
//! message once `max_size` is reached, while [`PriorityQueue::reinsert`]
//! (retries, manual requeue, recovery) always succeeds because those messages
//! were already accepted and persisted.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::QueueError;
use crate::message::{Message, Priority};

const BANDS: usize = 3;

fn band_index(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

struct Inner {
    bands: [VecDeque<Message>; BANDS],
    ids: HashSet<Uuid>,
}

impl Inner {
    fn insert(&mut self, message: Message) -> Result<(), QueueError> {
        if !self.ids.insert(message.id) {
            return Err(QueueError::DuplicateMessage(message.id));
        }

        // Keep each band sorted by creation time; equal timestamps keep
        // insertion order (FIFO tie-break).
        let band = &mut self.bands[band_index(message.priority)];
        let mut idx = band.len();
        while idx > 0 && band[idx - 1].created_at > message.created_at {
            idx -= 1;
        }
        band.insert(idx, message);
        Ok(())
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Ordered working set of pending messages.
pub struct PriorityQueue {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl PriorityQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                bands: std::array::from_fn(|_| VecDeque::new()),
                ids: HashSet::new(),
            }),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The queue holds no partially-applied state across panics; a
        // poisoned guard is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a newly accepted message, subject to the capacity bound.
    pub fn insert(&self, message: Message) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.len() >= self.max_size {
            return Err(QueueError::CapacityExceeded { size: inner.len() });
        }
        inner.insert(message)
    }

    /// Re-insert a message that was accepted earlier (retry, requeue,
    /// recovery). Not subject to the capacity bound.
    pub fn reinsert(&self, message: Message) -> Result<(), QueueError> {
        self.lock().insert(message)
    }

    /// Remove and return the head: highest priority, oldest first.
    pub fn pop(&self) -> Option<Message> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        for band in inner.bands.iter_mut() {
            if let Some(message) = band.pop_front() {
                inner.ids.remove(&message.id);
                return Some(message);
            }
        }
        None
    }

    /// Non-destructive read of the head.
    pub fn peek(&self) -> Option<Message> {
        let inner = self.lock();
        inner
            .bands
            .iter()
            .find_map(|band| band.front())
            .cloned()
    }

    /// Remove a specific message by id.
    pub fn remove(&self, id: Uuid) -> Option<Message> {
        let mut inner = self.lock();
        if !inner.ids.remove(&id) {
            return None;
        }
        for band in inner.bands.iter_mut() {
            if let Some(pos) = band.iter().position(|m| m.id == id) {
                return band.remove(pos);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn high_priority_len(&self) -> usize {
        self.lock().bands[band_index(Priority::High)].len()
    }

    /// Remove and return everything (clear path).
    pub fn drain(&self) -> Vec<Message> {
        let mut inner = self.lock();
        inner.ids.clear();
        let mut drained = Vec::new();
        for band in inner.bands.iter_mut() {
            drained.extend(band.drain(..));
        }
        drained
    }

    /// Remove and return every message past its expiry deadline.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<Message> {
        let mut inner = self.lock();
        let mut expired = Vec::new();
        for band in inner.bands.iter_mut() {
            let (dead, live): (Vec<Message>, Vec<Message>) =
                band.drain(..).partition(|m| m.is_expired(now));
            *band = live.into();
            expired.extend(dead);
        }
        for message in &expired {
            inner.ids.remove(&message.id);
        }
        expired
    }

    /// Rebuild the queue from recovered records. Sorts into canonical order
    /// first; the store's iteration order is never trusted.
    pub fn recover(&self, mut messages: Vec<Message>) {
        messages.sort_by(|a, b| {
            b.priority
                .as_weight()
                .cmp(&a.priority.as_weight())
                .then(a.created_at.cmp(&b.created_at))
        });
        let mut inner = self.lock();
        for message in messages {
            if let Err(e) = inner.insert(message) {
                tracing::warn!(error = %e, "skipping duplicate record during recovery");
            }
        }
    }
}
