//! Store backend factory

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::StoreError;

use super::memory::MemoryStore;
use super::sqlite::SqliteStore;
use super::MessageStore;

/// Create a message store based on configuration.
///
/// Returns the appropriate backend implementation based on the `backend`
/// setting:
/// - `"sqlite"`: Returns a [`SqliteStore`] at the configured path
/// - `"memory"` (default): Returns a [`MemoryStore`]
pub async fn create_store(settings: &StoreConfig) -> Result<Arc<dyn MessageStore>, StoreError> {
    match settings.backend.as_str() {
        "sqlite" => {
            tracing::info!(
                backend = "sqlite",
                path = %settings.path,
                "Creating SQLite message store"
            );
            Ok(Arc::new(SqliteStore::open(&settings.path).await?))
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory message store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
