//! Diagnostic service
//!
//! Binds one [`ObdDriver`] to one [`DiagnosticSessionManager`]: every
//! vehicle read goes through the session's retry loop and timeline, and the
//! session follows the driver's link state.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::insights::SessionInsights;
use crate::manager::{DiagnosticSessionManager, SessionSnapshot};
use crate::self_check::{run_self_check, SelfCheckReport};
use chrono::Utc;
use diagnostics_timeline::{DiagnosticsSummary, OperationKind, SummaryOptions, TimelineEvent};
use obd_driver::{CancelSignal, ConnectionSnapshot, LinkState, ObdDriver};
use obd_protocol::{Dtc, LiveData, ObdStatus};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use storage::EventStore;
use tokio::task::JoinHandle;
use tracing::info;

/// Connection and session state together
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub connection: ConnectionSnapshot,
    pub session: SessionSnapshot,
}

pub struct DiagnosticService {
    driver: ObdDriver,
    session: DiagnosticSessionManager,
    link_sync: JoinHandle<()>,
}

impl DiagnosticService {
    /// Must be called inside a tokio runtime
    pub fn new(driver: ObdDriver, store: Arc<dyn EventStore>, config: SessionConfig) -> Self {
        let session = DiagnosticSessionManager::new(config, store);
        let link_sync = session.spawn_link_sync(driver.link_state());
        Self {
            driver,
            session,
            link_sync,
        }
    }

    pub fn driver(&self) -> &ObdDriver {
        &self.driver
    }

    pub fn session(&self) -> &DiagnosticSessionManager {
        &self.session
    }

    pub async fn connect(&self, cancel: CancelSignal) -> Result<ConnectionSnapshot, SessionError> {
        let snapshot = self.driver.connect(cancel).await?;
        self.session.sync_with_link(LinkState::Ready).await;
        Ok(snapshot)
    }

    pub async fn disconnect(&self) {
        self.driver.disconnect();
        self.session.sync_with_link(LinkState::Disconnected).await;
    }

    pub async fn read_dtc(&self) -> Result<Vec<Dtc>, SessionError> {
        let policy = self.session.config().retry_policy();
        self.session
            .run_operation(OperationKind::ReadDtc, policy, |_| {
                let driver = self.driver.clone();
                async move { driver.read_dtc().await }
            })
            .await
    }

    pub async fn read_live_data(&self) -> Result<LiveData, SessionError> {
        let policy = self.session.config().retry_policy();
        self.session
            .run_operation(OperationKind::LiveData, policy, |_| {
                let driver = self.driver.clone();
                async move { driver.read_live_data().await }
            })
            .await
    }

    pub async fn read_status(&self) -> Result<ObdStatus, SessionError> {
        let policy = self.session.config().retry_policy();
        self.session
            .run_operation(OperationKind::Status, policy, |_| {
                let driver = self.driver.clone();
                async move { driver.read_status().await }
            })
            .await
    }

    /// Returns once the adapter acknowledged the clear
    pub async fn clear_dtc(&self) -> Result<(), SessionError> {
        let policy = self.session.config().retry_policy();
        self.session
            .run_operation(OperationKind::ClearDtc, policy, |_| {
                let driver = self.driver.clone();
                async move { driver.clear_dtc().await }
            })
            .await?;
        info!("Trouble codes cleared");
        Ok(())
    }

    pub async fn self_check(&self) -> Result<SelfCheckReport, SessionError> {
        let config = self.session.config();
        let policy = config.retry_policy();
        let attempts = config.self_check_attempts;
        let delay = Duration::from_millis(config.self_check_delay_ms);
        self.session
            .run_operation(OperationKind::SelfCheck, policy, |_| {
                let driver = self.driver.clone();
                async move {
                    Ok::<_, SessionError>(run_self_check(&driver, attempts, delay).await)
                }
            })
            .await
    }

    pub async fn acknowledge_error(&self) -> bool {
        self.session.acknowledge_error().await
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            connection: self.driver.snapshot(),
            session: self.session.metrics_snapshot(),
        }
    }

    pub fn timeline(&self, after: Option<&str>, limit: usize) -> Vec<TimelineEvent> {
        self.session.timeline(after, limit)
    }

    pub fn insights(&self, window: Option<Duration>) -> SessionInsights {
        self.session.insights(window)
    }

    /// Persisted summary; `None` when the store keeps nothing
    pub async fn historical_summary(
        &self,
        since: Option<chrono::DateTime<Utc>>,
    ) -> Result<Option<DiagnosticsSummary>, SessionError> {
        let options = SummaryOptions {
            since,
            ..Default::default()
        };
        self.session.historical_summary(&options).await
    }
}

impl Drop for DiagnosticService {
    fn drop(&mut self) {
        self.link_sync.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagnostics_timeline::{DiagnosticState, EventKind, Outcome};
    use obd_driver::transport::mock::{AdapterScript, MockLink, MockTransport};
    use obd_driver::DriverConfig;
    use storage::MemoryEventStore;

    fn driver(script: AdapterScript) -> ObdDriver {
        let config = DriverConfig {
            auto_reconnect: false,
            watchdog_interval_ms: 0,
            command_timeout_ms: 1000,
            ..Default::default()
        };
        ObdDriver::new(config, Arc::new(MockLink::new(MockTransport::new(script))))
    }

    fn service(script: AdapterScript) -> (DiagnosticService, Arc<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::new(100));
        let config = SessionConfig {
            attempts: 2,
            base_delay_ms: 100,
            self_check_attempts: 2,
            self_check_delay_ms: 50,
            ..Default::default()
        };
        (DiagnosticService::new(driver(script), store.clone(), config), store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_dtc_end_to_end() {
        let (service, store) = service(AdapterScript::default().reply("03", "43 01 33 00 00"));
        service.connect(CancelSignal::never()).await.unwrap();
        assert_eq!(service.session().state(), DiagnosticState::Ready);

        let codes = service.read_dtc().await.unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].code, "P0133");
        assert_eq!(service.session().state(), DiagnosticState::Ready);

        let timeline = service.timeline(None, 64);
        let op = timeline.iter().find_map(|e| e.operation()).unwrap();
        assert_eq!(op.operation, OperationKind::ReadDtc);
        assert_eq!(op.outcome, Outcome::Success);

        let persisted = store.recent(100).await.unwrap();
        assert!(persisted.iter().any(|e| e.operation().is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_connected_fails_after_retries() {
        let (service, _) = service(AdapterScript::default());
        let err = service.read_status().await.unwrap_err();
        match err {
            SessionError::OperationFailed { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(service.session().state(), DiagnosticState::Error);
        assert!(service.acknowledge_error().await);
        assert_eq!(service.session().state(), DiagnosticState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_recorded_as_failure() {
        let (service, _) = service(AdapterScript::default().silent("0101"));
        service.connect(CancelSignal::never()).await.unwrap();

        assert!(service.read_status().await.is_err());
        let failure = service
            .timeline(None, 64)
            .into_iter()
            .find(|e| e.is_failure())
            .unwrap();
        match failure.kind {
            EventKind::Operation(op) => {
                assert_eq!(op.attempt, 2);
                assert!(op.error.unwrap().contains("Timeout"));
            }
            EventKind::StateChange(_) => panic!("expected an operation event"),
        }
        assert_eq!(service.snapshot().session.state, DiagnosticState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_and_live_data() {
        let (service, _) = service(AdapterScript::default());
        service.connect(CancelSignal::never()).await.unwrap();

        service.clear_dtc().await.unwrap();
        let live = service.read_live_data().await.unwrap();
        assert_eq!(live.rpm, Some(1726.0));
        assert_eq!(live.speed, Some(60.0));

        let snapshot = service.snapshot();
        assert_eq!(snapshot.session.operations[&OperationKind::ClearDtc].success, 1);
        assert_eq!(snapshot.session.operations[&OperationKind::LiveData].success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_check_against_mock_adapter() {
        let (service, _) = service(AdapterScript::default());
        service.connect(CancelSignal::never()).await.unwrap();

        let report = service.self_check().await.unwrap();
        assert!(report.passed());
        assert_eq!(report.attempts_performed, 2);
        assert!(report.metrics.protocol.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_moves_session() {
        let (service, _) = service(AdapterScript::default());
        service.connect(CancelSignal::never()).await.unwrap();
        service.disconnect().await;
        assert_eq!(service.session().state(), DiagnosticState::Disconnected);
        assert!(service.historical_summary(None).await.unwrap().is_some());
    }
}
