//! In-memory message store using DashMap.
//!
//! Records are lost on process restart; intended for tests and for hosts that
//! opt out of durability.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::Message;

use super::MessageStore;

/// Non-durable store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<Uuid, Message>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn put(&self, message: &Message) -> Result<(), StoreError> {
        self.records.insert(message.id, message.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.records.remove(&id).is_some())
    }

    async fn list_all(&self) -> Result<Vec<Message>, StoreError> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let removed = self.records.len();
        self.records.clear();
        Ok(removed)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
