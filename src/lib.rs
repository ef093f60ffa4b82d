//! Durable offline message queue with priority ordering and background
//! delivery.
//!
//! Messages are persisted before they become visible to the delivery loop,
//! survive process restarts, and are delivered in (priority descending,
//! creation time ascending) order through a host-supplied
//! [`DeliveryTransport`]. The host drives connectivity and pause/resume
//! signals and can observe queue state and size as watch streams.
//!
//! ```no_run
//! use std::sync::Arc;
//! use offline_queue::{OfflineQueue, Priority, QueueSettings};
//!
//! # async fn example(transport: Arc<dyn offline_queue::DeliveryTransport>) -> offline_queue::Result<()> {
//! let queue = OfflineQueue::open(QueueSettings::default(), transport).await?;
//! queue.enqueue("hello", Priority::High).await?;
//! # Ok(())
//! # }
//! ```

// Infrastructure layer (shared components)
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Domain layer
pub mod message;
pub mod queue;
pub mod stats;
pub mod store;

// Application layer
pub mod facade;
pub mod processor;

pub use config::{DeliveryConfig, QueueConfig, QueueSettings, StoreConfig};
pub use error::{DeliveryError, QueueError, Result, StoreError};
pub use facade::{OfflineQueue, QueueStatus};
pub use message::{Message, MessageBuilder, MessageStatus, Priority};
pub use processor::{BackoffConfig, DeliveryTransport, QueueState};
pub use stats::StatsSnapshot;
pub use store::MessageStore;
