//! Diagnostic Session Manager
//!
//! Runs named operations with a bounded retry budget, owns the session
//! state machine and records every outcome and transition to the timeline.
//! Timeline events are persisted through the configured [`EventStore`];
//! store failures are logged and otherwise ignored.

use crate::config::{RetryPolicy, SessionConfig};
use crate::error::SessionError;
use crate::insights::{build_insights, SessionInsights};
use crate::outcome::OperationOutcome;
use chrono::{DateTime, Utc};
use diagnostics_timeline::{
    DiagnosticState, DiagnosticsSummary, EventIdGenerator, EventKind, OperationEvent,
    OperationKind, Outcome, RingBuffer, StateChangeEvent, StatsTable, SummaryOptions,
    TimelineEvent,
};
use obd_driver::LinkState;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storage::EventStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Operation currently holding the session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveOperation {
    pub operation: OperationKind,
    pub attempt: u32,
    pub attempts_allowed: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    run: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub operation: OperationKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationTotals {
    pub success: u64,
    pub failure: u64,
    pub average_duration_ms: Option<u64>,
}

/// Point-in-time view of the session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: DiagnosticState,
    pub active_operation: Option<ActiveOperation>,
    pub last_error: Option<LastError>,
    pub operations: BTreeMap<OperationKind, OperationTotals>,
    pub last_event: Option<TimelineEvent>,
}

struct SessionInner {
    state: DiagnosticState,
    active: Option<ActiveOperation>,
    last_error: Option<LastError>,
    timeline: RingBuffer<TimelineEvent>,
    history: RingBuffer<TimelineEvent>,
    stats: StatsTable,
    ids: EventIdGenerator,
    runs: u64,
}

impl SessionInner {
    fn push(&mut self, kind: EventKind) -> TimelineEvent {
        let event = self.ids.event(Utc::now(), kind);
        match &event.kind {
            EventKind::Operation(op) => self.stats.record(op),
            EventKind::StateChange(_) => {
                self.history.push(event.clone());
            }
        }
        self.timeline.push(event.clone());
        event
    }

    fn transition(&mut self, next: DiagnosticState, reason: &str) -> Option<TimelineEvent> {
        let previous = self.state;
        if previous == next {
            return None;
        }
        self.state = next;
        info!("Diagnostic state {} -> {} ({})", previous, next, reason);
        Some(self.push(EventKind::StateChange(StateChangeEvent {
            state: next,
            previous_state: previous,
            reason: Some(reason.to_string()),
        })))
    }

    /// The run still owns the session
    fn owns(&self, run: u64) -> bool {
        self.active.as_ref().is_some_and(|active| active.run == run)
    }
}

/// Cloneable handle to one diagnostic session
#[derive(Clone)]
pub struct DiagnosticSessionManager {
    inner: Arc<Mutex<SessionInner>>,
    store: Arc<dyn EventStore>,
    config: SessionConfig,
}

impl DiagnosticSessionManager {
    pub fn new(config: SessionConfig, store: Arc<dyn EventStore>) -> Self {
        debug!(
            "Diagnostic session created (timeline {}, history {}, store {})",
            config.timeline_capacity,
            config.history_capacity,
            store.describe()
        );
        let inner = SessionInner {
            state: DiagnosticState::Disconnected,
            active: None,
            last_error: None,
            timeline: RingBuffer::new(config.timeline_capacity),
            history: RingBuffer::new(config.history_capacity),
            stats: StatsTable::new(),
            ids: EventIdGenerator::new(),
            runs: 0,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
            store,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> DiagnosticState {
        self.inner.lock().state
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.inner.lock().last_error.clone()
    }

    pub fn active_operation(&self) -> Option<ActiveOperation> {
        self.inner.lock().active.clone()
    }

    /// Run `task` until it succeeds or the attempt budget is spent.
    ///
    /// The task receives the 1-based attempt number. An `Err`, or an `Ok`
    /// whose [`OperationOutcome::failure`] is set, fails the attempt; failed
    /// attempt `n` waits `n * base_delay` before the next one.
    pub async fn run_operation<T, E, F, Fut>(
        &self,
        operation: OperationKind,
        policy: RetryPolicy,
        mut task: F,
    ) -> Result<T, SessionError>
    where
        T: OperationOutcome,
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let (run, event) = {
            let mut inner = self.inner.lock();
            if let Some(active) = &inner.active {
                return Err(SessionError::Busy {
                    requested: operation,
                    active: active.operation,
                });
            }
            inner.runs += 1;
            let run = inner.runs;
            inner.active = Some(ActiveOperation {
                operation,
                attempt: 1,
                attempts_allowed: policy.attempts,
                started_at: Utc::now(),
                run,
            });
            let reason = format!("{} started", operation);
            (run, inner.transition(operation.working_state(), &reason))
        };
        self.persist(event).await;

        let mut message = String::new();
        for attempt in 1..=policy.attempts {
            if let Some(active) = self.inner.lock().active.as_mut().filter(|a| a.run == run) {
                active.attempt = attempt;
            }

            match task(attempt).await {
                Ok(value) => match value.failure() {
                    None => {
                        self.complete(run, operation, attempt, policy, started).await;
                        return Ok(value);
                    }
                    Some(failure) => message = failure,
                },
                Err(e) => message = e.to_string(),
            }

            if attempt < policy.attempts {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{} attempt {}/{} failed: {}; retrying in {}ms",
                    operation,
                    attempt,
                    policy.attempts,
                    message,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
        }

        self.fail(run, operation, policy, started, &message).await;
        Err(SessionError::OperationFailed {
            operation,
            attempts: policy.attempts,
            message,
        })
    }

    async fn complete(
        &self,
        run: u64,
        operation: OperationKind,
        attempt: u32,
        policy: RetryPolicy,
        started: Instant,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let events = {
            let mut inner = self.inner.lock();
            let recorded = inner.push(EventKind::Operation(OperationEvent {
                operation,
                outcome: Outcome::Success,
                attempt,
                attempts_allowed: policy.attempts,
                duration_ms,
                error: None,
            }));
            let mut events = vec![recorded];
            if inner.owns(run) {
                inner.active = None;
                inner.last_error = None;
                events.extend(inner.transition(DiagnosticState::Ready, "operation completed"));
            }
            events
        };

        metrics::counter!("diagnostic_operations_total", "operation" => operation.as_str(), "outcome" => "success")
            .increment(1);
        metrics::histogram!("diagnostic_operation_duration_ms", "operation" => operation.as_str())
            .record(duration_ms as f64);
        info!("{} succeeded on attempt {} in {}ms", operation, attempt, duration_ms);

        for event in events {
            self.persist(Some(event)).await;
        }
    }

    async fn fail(
        &self,
        run: u64,
        operation: OperationKind,
        policy: RetryPolicy,
        started: Instant,
        message: &str,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let events = {
            let mut inner = self.inner.lock();
            let recorded = inner.push(EventKind::Operation(OperationEvent {
                operation,
                outcome: Outcome::Failure,
                attempt: policy.attempts,
                attempts_allowed: policy.attempts,
                duration_ms,
                error: Some(message.to_string()),
            }));
            inner.last_error = Some(LastError {
                operation,
                message: message.to_string(),
                at: recorded.at,
            });
            let mut events = vec![recorded];
            if inner.owns(run) {
                inner.active = None;
                events.extend(inner.transition(DiagnosticState::Error, message));
            }
            events
        };

        metrics::counter!("diagnostic_operations_total", "operation" => operation.as_str(), "outcome" => "failure")
            .increment(1);
        warn!(
            "{} failed after {} attempt(s): {}",
            operation, policy.attempts, message
        );

        for event in events {
            self.persist(Some(event)).await;
        }
    }

    /// Leave `error` for `ready`; no-op in any other state
    pub async fn acknowledge_error(&self) -> bool {
        let event = {
            let mut inner = self.inner.lock();
            if inner.state != DiagnosticState::Error {
                return false;
            }
            inner.last_error = None;
            inner.transition(DiagnosticState::Ready, "error acknowledged")
        };
        self.persist(event).await;
        true
    }

    /// Follow a connection state change
    pub async fn sync_with_link(&self, link: LinkState) {
        let event = {
            let mut inner = self.inner.lock();
            let current = inner.state;
            match link {
                LinkState::Ready => {
                    let idle = matches!(
                        current,
                        DiagnosticState::Disconnected
                            | DiagnosticState::Connecting
                            | DiagnosticState::Authenticating
                            | DiagnosticState::Error
                    );
                    if idle && inner.active.is_none() {
                        inner.transition(DiagnosticState::Ready, "link ready")
                    } else {
                        None
                    }
                }
                LinkState::Scanning(_) | LinkState::Connecting if !current.is_busy() => {
                    inner.transition(DiagnosticState::Connecting, "link connecting")
                }
                LinkState::Handshaking if !current.is_busy() => {
                    inner.transition(DiagnosticState::Authenticating, "adapter handshake")
                }
                LinkState::Scanning(_) | LinkState::Connecting | LinkState::Handshaking => None,
                LinkState::Idle | LinkState::Disconnected => {
                    inner.active = None;
                    inner.transition(DiagnosticState::Disconnected, "link down")
                }
            }
        };
        self.persist(event).await;
    }

    /// Keep the session in step with a connection's state channel
    pub fn spawn_link_sync(&self, mut link: watch::Receiver<LinkState>) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                let state = *link.borrow_and_update();
                session.sync_with_link(state).await;
                if link.changed().await.is_err() {
                    break;
                }
            }
            debug!("Link state channel closed");
        })
    }

    /// Events newer than `after`, oldest first (see [`RingBuffer::events_after`])
    pub fn timeline(&self, after: Option<&str>, limit: usize) -> Vec<TimelineEvent> {
        self.inner.lock().timeline.events_after(after, limit)
    }

    /// Recent state changes, oldest first
    pub fn history(&self) -> Vec<TimelineEvent> {
        self.inner.lock().history.to_vec()
    }

    pub fn metrics_snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            state: inner.state,
            active_operation: inner.active.clone(),
            last_error: inner.last_error.clone(),
            operations: inner
                .stats
                .snapshot()
                .into_iter()
                .map(|(kind, stats)| {
                    let totals = OperationTotals {
                        success: stats.success,
                        failure: stats.failure,
                        average_duration_ms: stats.average_duration_ms(),
                    };
                    (kind, totals)
                })
                .collect(),
            last_event: inner.timeline.last().cloned(),
        }
    }

    /// Rates, failure reasons and reliability over the in-memory timeline
    pub fn insights(&self, window: Option<Duration>) -> SessionInsights {
        let (timeline, history) = {
            let inner = self.inner.lock();
            (inner.timeline.to_vec(), inner.history.to_vec())
        };
        let window = window.or_else(|| self.config.insights_window());
        build_insights(&timeline, &history, window, Utc::now())
    }

    /// Summary over everything the store has persisted
    pub async fn historical_summary(
        &self,
        options: &SummaryOptions,
    ) -> Result<Option<DiagnosticsSummary>, SessionError> {
        Ok(self.store.summarize(options).await?)
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    async fn persist(&self, event: Option<TimelineEvent>) {
        let Some(event) = event else {
            return;
        };
        if !self.store.enabled() {
            return;
        }
        if let Err(e) = self.store.record(&event).await {
            warn!("Failed to persist diagnostic event {}: {}", event.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use storage::{MemoryEventStore, StorageError};

    fn session() -> (DiagnosticSessionManager, Arc<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::new(100));
        let manager = DiagnosticSessionManager::new(SessionConfig::default(), store.clone());
        (manager, store)
    }

    fn policy(attempts: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(base_ms))
    }

    fn operations(events: &[TimelineEvent]) -> Vec<OperationEvent> {
        events.iter().filter_map(|e| e.operation().cloned()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_linear_backoff() {
        let (manager, _) = session();
        let started = Instant::now();
        let mut attempts_at = Vec::new();

        let result: Result<Vec<obd_protocol::Dtc>, _> = manager
            .run_operation(OperationKind::ReadDtc, policy(3, 200), |attempt| {
                attempts_at.push((attempt, started.elapsed()));
                async { Err::<Vec<obd_protocol::Dtc>, _>("Command timed out") }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, SessionError::OperationFailed { attempts: 3, .. }));
        assert_eq!(err.message(), "Command timed out");

        let gaps: Vec<u128> = attempts_at.iter().map(|(_, at)| at.as_millis()).collect();
        assert_eq!(gaps, vec![0, 200, 600]);

        let ops = operations(&manager.timeline(None, 64));
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].outcome, Outcome::Failure);
        assert_eq!(ops[0].attempt, 3);
        assert_eq!(ops[0].attempts_allowed, 3);
        assert_eq!(manager.state(), DiagnosticState::Error);
        assert_eq!(manager.last_error().unwrap().message, "Command timed out");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry() {
        let (manager, store) = session();
        manager.sync_with_link(LinkState::Ready).await;

        let value = manager
            .run_operation(OperationKind::Status, policy(3, 100), |attempt| async move {
                if attempt < 2 {
                    Err("NO DATA".to_string())
                } else {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                }
            })
            .await;
        assert!(value.is_ok());
        assert_eq!(manager.state(), DiagnosticState::Ready);
        assert!(manager.last_error().is_none());

        let snapshot = manager.metrics_snapshot();
        let totals = snapshot.operations[&OperationKind::Status];
        assert_eq!(totals.success, 1);
        assert_eq!(totals.failure, 0);
        assert_eq!(totals.average_duration_ms, Some(150));
        assert!(snapshot.active_operation.is_none());

        // ready, reading, operation, ready
        let timeline = manager.timeline(None, 64);
        assert_eq!(timeline.len(), 4);
        let states: Vec<DiagnosticState> = timeline
            .iter()
            .filter_map(|e| e.state_change().map(|c| c.state))
            .collect();
        assert_eq!(
            states,
            vec![DiagnosticState::Ready, DiagnosticState::Reading, DiagnosticState::Ready]
        );
        assert_eq!(store.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_failure_flag_is_retried() {
        let (manager, _) = session();
        let mut calls = 0;
        let result = manager
            .run_operation(OperationKind::ClearDtc, policy(2, 10), |_| {
                calls += 1;
                async { Ok::<bool, String>(false) }
            })
            .await;

        assert_eq!(calls, 2);
        assert_eq!(result.unwrap_err().message(), "request not acknowledged");
        let history = manager.history();
        assert_eq!(
            history[0].state_change().unwrap().state,
            DiagnosticState::Clearing
        );
    }

    #[tokio::test]
    async fn test_acknowledge_error() {
        let (manager, _) = session();
        assert!(!manager.acknowledge_error().await);

        let _ = manager
            .run_operation(OperationKind::LiveData, policy(1, 0), |_| async {
                Err::<(), _>("boom")
            })
            .await;
        assert_eq!(manager.state(), DiagnosticState::Error);

        assert!(manager.acknowledge_error().await);
        assert_eq!(manager.state(), DiagnosticState::Ready);
        assert!(manager.last_error().is_none());
        assert!(!manager.acknowledge_error().await);
    }

    #[tokio::test]
    async fn test_busy_session_rejects() {
        let (manager, _) = session();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut release = Some(release_rx);
                manager
                    .run_operation(OperationKind::ReadDtc, policy(1, 0), move |_| {
                        let release = release.take();
                        async move {
                            if let Some(rx) = release {
                                let _ = rx.await;
                            }
                            Ok::<(), String>(())
                        }
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        while manager.active_operation().is_none() {
            tokio::task::yield_now().await;
        }

        let err = manager
            .run_operation(OperationKind::Status, policy(1, 0), |_| async { Ok::<(), String>(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Busy { active: OperationKind::ReadDtc, .. }
        ));

        release_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_link_sync_rules() {
        let (manager, _) = session();

        manager.sync_with_link(LinkState::Connecting).await;
        assert_eq!(manager.state(), DiagnosticState::Connecting);
        manager.sync_with_link(LinkState::Handshaking).await;
        assert_eq!(manager.state(), DiagnosticState::Authenticating);
        manager.sync_with_link(LinkState::Ready).await;
        assert_eq!(manager.state(), DiagnosticState::Ready);

        // ready while ready records nothing new
        let before = manager.timeline(None, 64).len();
        manager.sync_with_link(LinkState::Ready).await;
        assert_eq!(manager.timeline(None, 64).len(), before);

        manager.sync_with_link(LinkState::Disconnected).await;
        assert_eq!(manager.state(), DiagnosticState::Disconnected);
    }

    #[tokio::test]
    async fn test_link_sync_preserves_running_operation() {
        let (manager, _) = session();
        manager.sync_with_link(LinkState::Ready).await;

        let observer = manager.clone();
        let result = manager
            .run_operation(OperationKind::ReadDtc, policy(1, 0), move |_| {
                let observer = observer.clone();
                async move {
                    observer.sync_with_link(LinkState::Connecting).await;
                    observer.sync_with_link(LinkState::Ready).await;
                    assert_eq!(observer.state(), DiagnosticState::Reading);

                    observer.sync_with_link(LinkState::Disconnected).await;
                    assert!(observer.active_operation().is_none());
                    Ok::<(), String>(())
                }
            })
            .await;

        // the run lost the session: outcome recorded, state left alone
        assert!(result.is_ok());
        assert_eq!(manager.state(), DiagnosticState::Disconnected);
        assert_eq!(manager.metrics_snapshot().operations[&OperationKind::ReadDtc].success, 1);
    }

    #[tokio::test]
    async fn test_spawned_link_sync() {
        let (manager, _) = session();
        let (tx, rx) = watch::channel(LinkState::Idle);
        let task = manager.spawn_link_sync(rx);

        tx.send_replace(LinkState::Ready);
        while manager.state() != DiagnosticState::Ready {
            tokio::task::yield_now().await;
        }
        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeline_ring_does_not_touch_stats() {
        let store = Arc::new(MemoryEventStore::new(0));
        let config = SessionConfig {
            timeline_capacity: 4,
            ..Default::default()
        };
        let manager = DiagnosticSessionManager::new(config, store);
        for _ in 0..10 {
            manager
                .run_operation(OperationKind::Status, policy(1, 0), |_| async { Ok::<(), String>(()) })
                .await
                .unwrap();
        }

        assert_eq!(manager.timeline(None, 64).len(), 4);
        assert_eq!(manager.metrics_snapshot().operations[&OperationKind::Status].success, 10);
    }

    struct FailingStore;

    #[async_trait]
    impl EventStore for FailingStore {
        fn describe(&self) -> String {
            "failing".into()
        }

        async fn record(&self, _event: &TimelineEvent) -> Result<(), StorageError> {
            Err(StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
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

    #[tokio::test]
    async fn test_store_failures_are_swallowed() {
        let manager = DiagnosticSessionManager::new(SessionConfig::default(), Arc::new(FailingStore));
        let result = manager
            .run_operation(OperationKind::Status, policy(1, 0), |_| async { Ok::<(), String>(()) })
            .await;

        assert!(result.is_ok());
        assert_eq!(manager.timeline(None, 64).len(), 3);
        assert!(manager.historical_summary(&SummaryOptions::default()).await.unwrap().is_none());
    }
}
