//! Tracing initialization for hosts embedding the queue.
//!
//! The filter is taken from `RUST_LOG` when set, defaulting to `info`.
//! Both initializers are safe to call more than once; later calls are no-ops.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize human-readable console logging.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Initialize JSON logging for hosts that ship logs to an aggregator.
pub fn init_json() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().json())
        .try_init();
}
