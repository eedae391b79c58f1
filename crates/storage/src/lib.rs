//! Storage Layer
//!
//! Append-only persistence for diagnostic timeline events behind the
//! [`EventStore`] seam: SQLite through sqlx, a bounded in-memory store and a
//! no-op store for deployments without persistence.

mod config;
mod memory;
mod sqlite;

pub use config::{open_store, StorageBackend, StorageConfig, DEFAULT_MAX_ROWS};
pub use memory::{MemoryEventStore, NoopEventStore};
pub use sqlite::SqliteEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diagnostics_timeline::{DiagnosticsSummary, SummaryOptions, TimelineEvent};
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence seam for timeline events
#[async_trait]
pub trait EventStore: Send + Sync {
    /// `false` for stores that drop everything
    fn enabled(&self) -> bool {
        true
    }

    /// Backend name and location, for logs
    fn describe(&self) -> String;

    /// Persist one event; an existing id is replaced
    async fn record(&self, event: &TimelineEvent) -> Result<(), StorageError>;

    /// Up to `limit` events, newest first
    async fn recent(&self, limit: usize) -> Result<Vec<TimelineEvent>, StorageError>;

    /// Delete events older than `before`, returning how many went
    async fn prune(&self, before: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Historical summary over the stored events, `None` without persistence
    async fn summarize(
        &self,
        options: &SummaryOptions,
    ) -> Result<Option<DiagnosticsSummary>, StorageError>;
}
