//! Store selection

use crate::{EventStore, MemoryEventStore, NoopEventStore, SqliteEventStore, StorageError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Default row budget
pub const DEFAULT_MAX_ROWS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Database file for the sqlite backend
    pub path: String,
    /// Oldest rows are dropped past this count (0 = unbounded)
    pub max_rows: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: "data/diagnostics.sqlite".to_string(),
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

/// Build the configured store. A sqlite database that cannot be opened
/// degrades to the no-op store so diagnostics keep running.
pub async fn open_store(config: &StorageConfig) -> Arc<dyn EventStore> {
    match config.backend {
        StorageBackend::Disabled => Arc::new(NoopEventStore::new("disabled by configuration")),
        StorageBackend::Memory => Arc::new(MemoryEventStore::new(config.max_rows)),
        StorageBackend::Sqlite => {
            match SqliteEventStore::open(&config.path, config.max_rows as u64).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!("Event store unavailable at {}: {}", config.path, e);
                    Arc::new(NoopEventStore::new(unavailable(&e)))
                }
            }
        }
    }
}

fn unavailable(error: &StorageError) -> String {
    format!("sqlite unavailable: {}", error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_and_disabled() {
        let memory = open_store(&StorageConfig {
            backend: StorageBackend::Memory,
            ..Default::default()
        })
        .await;
        assert!(memory.enabled());
        assert!(memory.describe().starts_with("memory"));

        let disabled = open_store(&StorageConfig {
            backend: StorageBackend::Disabled,
            ..Default::default()
        })
        .await;
        assert!(!disabled.enabled());
    }

    #[tokio::test]
    async fn test_unopenable_sqlite_degrades_to_noop() {
        let store = open_store(&StorageConfig {
            backend: StorageBackend::Sqlite,
            path: "/proc/definitely/not/here.sqlite".to_string(),
            max_rows: 10,
        })
        .await;
        assert!(!store.enabled());
    }
}
