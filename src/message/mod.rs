use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority levels for queued messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority, can be delayed
    Low,
    /// Normal priority (default)
    #[default]
    Normal,
    /// High priority, should be delivered promptly
    High,
}

impl Priority {
    /// Get numeric value for priority comparison
    pub fn as_weight(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
        }
    }

    /// Recover a priority from its stored weight
    pub fn from_weight(weight: u8) -> Self {
        match weight {
            3.. => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_weight().cmp(&other.as_weight())
    }
}

/// Lifecycle status of a queued message.
///
/// `Sent`, `Failed` and `Expired` are terminal: once reached, the only way
/// back is an explicit `requeue_failed` call on the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MessageStatus::Pending),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            "expired" => Some(MessageStatus::Expired),
            _ => None,
        }
    }
}

/// A unit of outbound data owned by the queue until it reaches a terminal
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, generated at enqueue time
    pub id: Uuid,
    /// Opaque payload
    pub payload: String,
    /// Priority band
    pub priority: Priority,
    /// When the message was created
    pub created_at: DateTime<Utc>,
    /// Expiry deadline (None = never expires)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Number of delivery attempts so far
    pub attempts: u32,
    /// Lifecycle status
    pub status: MessageStatus,
}

impl Message {
    /// Create a new pending message with the given payload and priority
    pub fn new(payload: impl Into<String>, priority: Priority) -> Self {
        Self::builder(payload).priority(priority).build()
    }

    /// Create a builder for full control over ttl and expiry
    pub fn builder(payload: impl Into<String>) -> MessageBuilder {
        MessageBuilder::new(payload)
    }

    /// Check if the message is past its expiry deadline
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(deadline) => now > deadline,
            None => false,
        }
    }
}

/// Builder for queued messages
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    payload: String,
    priority: Priority,
    ttl_seconds: Option<u64>,
    expires_at: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            priority: Priority::default(),
            ttl_seconds: None,
            expires_at: None,
        }
    }

    /// Set the priority band
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set time-to-live in seconds, counted from creation
    pub fn ttl_seconds(mut self, ttl: u64) -> Self {
        self.ttl_seconds = Some(ttl);
        self
    }

    /// Set an absolute expiry deadline (takes precedence over ttl)
    pub fn expires_at(mut self, deadline: DateTime<Utc>) -> Self {
        self.expires_at = Some(deadline);
        self
    }

    /// Build the message in the `Pending` state
    pub fn build(self) -> Message {
        let created_at = Utc::now();
        let expires_at = self
            .expires_at
            .or_else(|| self.ttl_seconds.map(|ttl| created_at + Duration::seconds(ttl as i64)));
        Message {
            id: Uuid::new_v4(),
            payload: self.payload,
            priority: self.priority,
            created_at,
            expires_at,
            attempts: 0,
            status: MessageStatus::Pending,
        }
    }
}
