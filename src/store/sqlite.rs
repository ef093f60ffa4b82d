//! SQLite-backed message store.
//!
//! Records survive process restarts. The table carries an index matching the
//! queue's ordering key so recovery reads come back in dequeue order, though
//! the queue core re-sorts regardless.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::{Message, MessageStatus, Priority};

use super::MessageStore;

const CREATE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    priority INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL
)";

const CREATE_INDEX: &str = "
CREATE INDEX IF NOT EXISTS idx_messages_priority_created
ON messages (priority DESC, created_at ASC)";

/// Durable store backed by a local SQLite file.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a store at the given file path.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        Self::connect(options).await
    }

    /// Open an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // A single connection keeps the in-memory database alive and is
        // plenty for a single-process queue.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_INDEX).execute(&pool).await?;

        Ok(Self { pool })
    }

    fn decode_row(row: &SqliteRow) -> Result<Message, StoreError> {
        let id: String = row.try_get("id")?;
        let id = Uuid::parse_str(&id)
            .map_err(|e| StoreError::Corrupt(format!("invalid message id {}: {}", id, e)))?;

        let priority: i64 = row.try_get("priority")?;
        let priority = Priority::from_weight(priority as u8);

        let created_ms: i64 = row.try_get("created_at")?;
        let created_at = DateTime::from_timestamp_millis(created_ms)
            .ok_or_else(|| StoreError::Corrupt(format!("invalid created_at {}", created_ms)))?;

        let expires_ms: Option<i64> = row.try_get("expires_at")?;
        let expires_at = match expires_ms {
            Some(ms) => Some(
                DateTime::from_timestamp_millis(ms)
                    .ok_or_else(|| StoreError::Corrupt(format!("invalid expires_at {}", ms)))?,
            ),
            None => None,
        };

        let status: String = row.try_get("status")?;
        let status = MessageStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status {}", status)))?;

        Ok(Message {
            id,
            payload: row.try_get("payload")?,
            priority,
            created_at,
            expires_at,
            attempts: row.try_get::<i64, _>("attempts")? as u32,
            status,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn put(&self, message: &Message) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages (id, payload, priority, created_at, expires_at, attempts, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 payload = excluded.payload,
                 priority = excluded.priority,
                 created_at = excluded.created_at,
                 expires_at = excluded.expires_at,
                 attempts = excluded.attempts,
                 status = excluded.status",
        )
        .bind(message.id.to_string())
        .bind(&message.payload)
        .bind(message.priority.as_weight() as i64)
        .bind(message.created_at.timestamp_millis())
        .bind(message.expires_at.map(|t| t.timestamp_millis()))
        .bind(message.attempts as i64)
        .bind(message.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::decode_row(&r)).transpose()
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query("SELECT * FROM messages ORDER BY priority DESC, created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::decode_row).collect()
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM messages").execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    fn backend_type(&self) -> &'static str {
        "sqlite"
    }
}
