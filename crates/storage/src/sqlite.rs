//! SQLite event store
//!
//! One row per timeline event. The JSON payload is authoritative; the other
//! columns exist for indexing and ad-hoc queries.

use crate::{EventStore, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diagnostics_timeline::{
    format_timestamp, summarize, DiagnosticsSummary, EventKind, SummaryOptions, TimelineEvent,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS diagnostic_events (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        type TEXT NOT NULL,
        payload TEXT NOT NULL,
        operation TEXT,
        outcome TEXT,
        state TEXT,
        previous_state TEXT,
        attempt INTEGER,
        attempts_allowed INTEGER,
        duration_ms INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_diagnostic_events_created_at
        ON diagnostic_events(created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_diagnostic_events_type
        ON diagnostic_events(type)",
];

const INSERT: &str = "INSERT OR REPLACE INTO diagnostic_events (
        id, created_at, type, payload, operation, outcome, state,
        previous_state, attempt, attempts_allowed, duration_ms
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

/// Event store backed by a SQLite database
pub struct SqliteEventStore {
    pool: SqlitePool,
    max_rows: u64,
    location: String,
}

impl SqliteEventStore {
    /// Open (or create) the database file at `path` in WAL mode
    pub async fn open(path: impl AsRef<Path>, max_rows: u64) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        info!("Opened diagnostics event store at {}", path.display());
        Self::init(pool, max_rows, path.display().to_string()).await
    }

    /// Private in-memory database, gone when the store is dropped
    pub async fn in_memory(max_rows: u64) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // one connection that never expires, or the database goes with it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::init(pool, max_rows, ":memory:".to_string()).await
    }

    async fn init(pool: SqlitePool, max_rows: u64, location: String) -> Result<Self, StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            max_rows,
            location,
        })
    }

    pub async fn count(&self) -> Result<u64, StorageError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM diagnostic_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as u64)
    }

    async fn enforce_budget(&self) -> Result<(), StorageError> {
        if self.max_rows == 0 {
            return Ok(());
        }
        let total = self.count().await?;
        if total > self.max_rows {
            let excess = (total - self.max_rows) as i64;
            sqlx::query(
                "DELETE FROM diagnostic_events WHERE id IN (
                    SELECT id FROM diagnostic_events ORDER BY created_at ASC, rowid ASC LIMIT ?
                )",
            )
            .bind(excess)
            .execute(&self.pool)
            .await?;
            debug!("Row budget: dropped {} oldest events", excess);
        }
        Ok(())
    }

    fn decode(rows: Vec<String>) -> Vec<TimelineEvent> {
        rows.into_iter()
            .filter_map(|payload| match serde_json::from_str(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Skipping unreadable event payload: {}", e);
                    None
                }
            })
            .collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    fn describe(&self) -> String {
        format!("sqlite ({})", self.location)
    }

    async fn record(&self, event: &TimelineEvent) -> Result<(), StorageError> {
        let payload = serde_json::to_string(event)?;
        let query = sqlx::query(INSERT)
            .bind(event.id.as_str())
            .bind(event.created_at())
            .bind(event.type_name())
            .bind(payload);

        let query = match &event.kind {
            EventKind::Operation(op) => query
                .bind(Some(op.operation.as_str()))
                .bind(Some(op.outcome.as_str()))
                .bind(None::<&str>)
                .bind(None::<&str>)
                .bind(Some(i64::from(op.attempt)))
                .bind(Some(i64::from(op.attempts_allowed)))
                .bind(Some(op.duration_ms as i64)),
            EventKind::StateChange(change) => query
                .bind(None::<&str>)
                .bind(None::<&str>)
                .bind(Some(change.state.as_str()))
                .bind(Some(change.previous_state.as_str()))
                .bind(None::<i64>)
                .bind(None::<i64>)
                .bind(None::<i64>),
        };

        query.execute(&self.pool).await?;
        self.enforce_budget().await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<TimelineEvent>, StorageError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT payload FROM diagnostic_events ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(Self::decode(rows))
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM diagnostic_events WHERE created_at < ?")
            .bind(format_timestamp(&before))
            .execute(&self.pool)
            .await?;
        info!("Pruned {} events older than {}", result.rows_affected(), before);
        Ok(result.rows_affected())
    }

    async fn summarize(
        &self,
        options: &SummaryOptions,
    ) -> Result<Option<DiagnosticsSummary>, StorageError> {
        let since = options.since.as_ref().map(format_timestamp);
        let until = options.until.as_ref().map(format_timestamp);
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT payload FROM diagnostic_events
             WHERE (?1 IS NULL OR created_at >= ?1) AND (?2 IS NULL OR created_at <= ?2)
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(since.clone())
        .bind(until)
        .fetch_all(&self.pool)
        .await?;

        // last state change before the window seeds the connection state
        let mut payloads: Vec<String> = match &since {
            Some(since) => sqlx::query_scalar(
                "SELECT payload FROM diagnostic_events
                 WHERE type = 'state_change' AND created_at < ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            )
            .bind(since.as_str())
            .fetch_all(&self.pool)
            .await?,
            None => Vec::new(),
        };
        payloads.extend(rows);

        let events = Self::decode(payloads);
        Ok(Some(summarize(&events, options, Utc::now())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};
    use diagnostics_timeline::{
        DiagnosticState, EventIdGenerator, OperationEvent, OperationKind, Outcome,
        StateChangeEvent,
    };

    fn operation(ids: &mut EventIdGenerator, at: DateTime<Utc>, outcome: Outcome) -> TimelineEvent {
        ids.event(
            at,
            EventKind::Operation(OperationEvent {
                operation: OperationKind::ReadDtc,
                outcome,
                attempt: if outcome == Outcome::Failure { 3 } else { 1 },
                attempts_allowed: 3,
                duration_ms: 420,
                error: (outcome == Outcome::Failure).then(|| "Command timed out".to_string()),
            }),
        )
    }

    #[tokio::test]
    async fn test_record_and_recent() {
        let store = SqliteEventStore::in_memory(100).await.unwrap();
        let mut ids = EventIdGenerator::new();
        let now = Utc::now();
        let first = operation(&mut ids, now - Duration::seconds(2), Outcome::Failure);
        let change = ids.event(
            now - Duration::seconds(1),
            EventKind::StateChange(StateChangeEvent {
                state: DiagnosticState::Error,
                previous_state: DiagnosticState::Reading,
                reason: Some("Command timed out".into()),
            }),
        );
        store.record(&first).await.unwrap();
        store.record(&change).await.unwrap();

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], change);
        assert_eq!(recent[1], first);
        assert_eq!(store.recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_or_replace() {
        let store = SqliteEventStore::in_memory(100).await.unwrap();
        let mut ids = EventIdGenerator::new();
        let event = operation(&mut ids, Utc::now(), Outcome::Success);
        store.record(&event).await.unwrap();
        store.record(&event).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_row_budget() {
        let store = SqliteEventStore::in_memory(5).await.unwrap();
        let mut ids = EventIdGenerator::new();
        let start = Utc::now() - Duration::minutes(10);
        for i in 0..8 {
            store
                .record(&operation(&mut ids, start + Duration::seconds(i), Outcome::Success))
                .await
                .unwrap();
        }

        assert_eq!(store.count().await.unwrap(), 5);
        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.last().unwrap().at, (start + Duration::seconds(3)).trunc_subsecs(3));
    }

    #[tokio::test]
    async fn test_prune_before() {
        let store = SqliteEventStore::in_memory(0).await.unwrap();
        let mut ids = EventIdGenerator::new();
        let now = Utc::now();
        for days in [45, 31, 2] {
            store
                .record(&operation(&mut ids, now - Duration::days(days), Outcome::Success))
                .await
                .unwrap();
        }

        assert_eq!(store.prune(now - Duration::days(30)).await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_summarize_window() {
        let store = SqliteEventStore::in_memory(0).await.unwrap();
        let mut ids = EventIdGenerator::new();
        let now = Utc::now();
        store.record(&operation(&mut ids, now - Duration::days(10), Outcome::Success)).await.unwrap();
        store.record(&operation(&mut ids, now - Duration::hours(5), Outcome::Failure)).await.unwrap();
        store.record(&operation(&mut ids, now - Duration::hours(4), Outcome::Success)).await.unwrap();

        let summary = store.summarize(&SummaryOptions::default()).await.unwrap().unwrap();
        assert_eq!(summary.operations.total, 3);
        assert_eq!(summary.rolling.last_7_days.total, 2);
        assert_eq!(summary.rolling.last_30_days.total, 3);
        assert_eq!(summary.failures.by_error[0].error, "Command timed out");
        assert_eq!(summary.reliability.mean_time_to_recovery_ms, Some(3_600_000));

        let windowed = store
            .summarize(&SummaryOptions::since(now - Duration::days(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(windowed.range.total_events, 2);
        assert_eq!(windowed.failures.recent[0].attempt, 3);
    }

    #[tokio::test]
    async fn test_summary_window_keeps_earlier_connection_state() {
        let store = SqliteEventStore::in_memory(0).await.unwrap();
        let mut ids = EventIdGenerator::new();
        let now = Utc::now();
        let change = |ids: &mut EventIdGenerator, at, previous, state| {
            ids.event(
                at,
                EventKind::StateChange(StateChangeEvent {
                    state,
                    previous_state: previous,
                    reason: None,
                }),
            )
        };
        let connecting = change(
            &mut ids,
            now - Duration::hours(3),
            DiagnosticState::Disconnected,
            DiagnosticState::Connecting,
        );
        let ready = change(
            &mut ids,
            now - Duration::hours(2),
            DiagnosticState::Connecting,
            DiagnosticState::Ready,
        );
        store.record(&connecting).await.unwrap();
        store.record(&ready).await.unwrap();
        store.record(&operation(&mut ids, now - Duration::minutes(30), Outcome::Success)).await.unwrap();

        let summary = store
            .summarize(&SummaryOptions::since(now - Duration::hours(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.range.total_events, 1);
        assert_eq!(summary.operations.total, 1);
        assert_eq!(summary.connection.transitions, 0);
        assert_eq!(summary.connection.uptime_ratio, Some(1.0));
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = std::env::temp_dir().join(format!("diag-store-{}", std::process::id()));
        let path = dir.join("events.sqlite");
        let store = SqliteEventStore::open(&path, 10).await.unwrap();
        store
            .record(&operation(&mut EventIdGenerator::new(), Utc::now(), Outcome::Success))
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.describe().contains("events.sqlite"));

        store.close().await;
        let _ = std::fs::remove_dir_all(dir);
    }
}
