//! Persistent storage for queued messages.
//!
//! A message counts as durably queued only once [`MessageStore::put`] has
//! acknowledged. The in-memory queue is rebuilt from [`MessageStore::list_all`]
//! on startup; recovery re-sorts the records and never trusts store iteration
//! order.

mod factory;
mod memory;
mod sqlite;

pub use factory::create_store;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::Message;

/// Durable record storage keyed by message id.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or replace the full record for a message.
    async fn put(&self, message: &Message) -> Result<(), StoreError>;

    /// Fetch a message by id.
    async fn get(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    /// Remove a message. Returns whether a record was deleted.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// List every stored message.
    async fn list_all(&self) -> Result<Vec<Message>, StoreError>;

    /// Remove all messages. Returns the number of records deleted.
    async fn clear(&self) -> Result<usize, StoreError>;

    /// Backend name for logging
    fn backend_type(&self) -> &'static str;
}
