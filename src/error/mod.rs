use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the persistent store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Errors returned by a [`DeliveryTransport`](crate::processor::DeliveryTransport).
///
/// Connectivity-class errors drive the queue towards the `Offline` state;
/// everything else only consumes the message's retry budget.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("no connectivity: {0}")]
    Offline(String),

    #[error("delivery timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("delivery rejected by transport: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// Whether this failure indicates a connectivity problem rather than a
    /// problem with the message itself.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Offline(_) | Self::Timeout(_))
    }
}

/// Top-level error type for queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("queue capacity exceeded ({size} messages)")]
    CapacityExceeded { size: usize },

    #[error("duplicate message id {0}")]
    DuplicateMessage(Uuid),

    #[error("queue is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, QueueError>;
