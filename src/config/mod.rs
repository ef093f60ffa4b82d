mod settings;

pub use settings::{DeliveryConfig, QueueConfig, QueueSettings, StoreConfig};
