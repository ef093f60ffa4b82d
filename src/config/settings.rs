use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::processor::BackoffConfig;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct QueueSettings {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Store backend ("memory" or "sqlite")
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Database file path for the sqlite backend
    #[serde(default = "default_store_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending messages
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum delivery attempts before a message is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Default time-to-live applied at enqueue, in seconds (0 = no expiry)
    #[serde(default)]
    pub default_ttl_seconds: u64,
    /// Consecutive connectivity failures before the queue goes offline
    #[serde(default = "default_offline_failure_threshold")]
    pub offline_failure_threshold: u32,
    /// Retry backoff between failed attempts
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_store_path() -> String {
    "offline-queue.db".to_string()
}

fn default_max_size() -> usize {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_offline_failure_threshold() -> u32 {
    3
}

impl QueueSettings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("store.backend", "memory")?
            .set_default("store.path", "offline-queue.db")?
            .set_default("queue.max_size", 1000)?
            .set_default("delivery.max_attempts", 3)?
            .set_default("delivery.default_ttl_seconds", 0)?
            .set_default("delivery.offline_failure_threshold", 3)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // STORE_BACKEND, STORE_PATH, QUEUE_MAX_SIZE, etc.
            .add_source(Environment::default().separator("_").try_parsing(true));

        builder.build()?.try_deserialize()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            default_ttl_seconds: 0,
            offline_failure_threshold: default_offline_failure_threshold(),
            backoff: BackoffConfig::default(),
        }
    }
}
