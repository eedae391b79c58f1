//! In-memory and no-op stores

use crate::{EventStore, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diagnostics_timeline::{summarize, DiagnosticsSummary, SummaryOptions, TimelineEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, info};

/// Event store held in process memory, bounded by a row budget
pub struct MemoryEventStore {
    events: Mutex<VecDeque<TimelineEvent>>,
    max_rows: usize,
}

impl MemoryEventStore {
    pub fn new(max_rows: usize) -> Self {
        info!("Creating in-memory event store ({} rows)", max_rows);
        Self {
            events: Mutex::new(VecDeque::new()),
            max_rows,
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn insert(&self, event: TimelineEvent) {
        let mut events = self.events.lock();
        events.retain(|existing| existing.id != event.id);

        // keep creation order
        let position = events
            .iter()
            .rposition(|existing| existing.at <= event.at)
            .map_or(0, |index| index + 1);
        events.insert(position, event);

        if self.max_rows > 0 {
            while events.len() > self.max_rows {
                events.pop_front();
            }
        }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_ROWS)
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    fn describe(&self) -> String {
        format!("memory (max {} rows)", self.max_rows)
    }

    async fn record(&self, event: &TimelineEvent) -> Result<(), StorageError> {
        self.insert(event.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<TimelineEvent>, StorageError> {
        Ok(self.events.lock().iter().rev().take(limit).cloned().collect())
    }

    async fn prune(&self, before: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut events = self.events.lock();
        let len = events.len();
        events.retain(|event| event.at >= before);
        let removed = (len - events.len()) as u64;
        debug!("Pruned {} events", removed);
        Ok(removed)
    }

    async fn summarize(
        &self,
        options: &SummaryOptions,
    ) -> Result<Option<DiagnosticsSummary>, StorageError> {
        let events: Vec<TimelineEvent> = self.events.lock().iter().cloned().collect();
        Ok(Some(summarize(&events, options, Utc::now())))
    }
}

/// Store for deployments without persistence
#[derive(Debug, Default)]
pub struct NoopEventStore {
    reason: String,
}

impl NoopEventStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl EventStore for NoopEventStore {
    fn enabled(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("noop ({})", self.reason)
    }

    async fn record(&self, _event: &TimelineEvent) -> Result<(), StorageError> {
        Ok(())
    }

    async fn recent(&self, _limit: usize) -> Result<Vec<TimelineEvent>, StorageError> {
        Ok(Vec::new())
    }

    async fn prune(&self, _before: DateTime<Utc>) -> Result<u64, StorageError> {
        Ok(0)
    }

    async fn summarize(
        &self,
        _options: &SummaryOptions,
    ) -> Result<Option<DiagnosticsSummary>, StorageError> {
        Ok(None)
    }
}
