//! Exponential backoff for delivery retries and store write retries

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

/// Exponential backoff configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Exponential backoff calculator with jitter
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_delay_ms: u64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff with default configuration
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    /// Create a new exponential backoff with custom configuration
    pub fn with_config(config: BackoffConfig) -> Self {
        let initial = config.initial_delay_ms;
        Self {
            config,
            current_delay_ms: initial,
            attempt: 0,
        }
    }

    /// Get the next delay duration
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        // Calculate base delay with exponential growth
        let base_delay = self.current_delay_ms as f64 * self.config.multiplier;
        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        // Apply jitter only if jitter_factor > 0
        let final_delay = if self.config.jitter_factor > 0.0 {
            let jitter_range = capped_delay * self.config.jitter_factor;
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (capped_delay + jitter).max(1.0) as u64
        } else {
            capped_delay.max(1.0) as u64
        };

        self.current_delay_ms = final_delay;

        Duration::from_millis(final_delay)
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.current_delay_ms = self.config.initial_delay_ms;
        self.attempt = 0;
    }

    /// Get the current attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
