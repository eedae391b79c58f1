//! Agent operations

use anyhow::Result;
use chrono::{Duration, Utc};
use clap::Subcommand;
use obd_session::DiagnosticService;
use serde_json::{json, Value};
use tracing::info;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Operation {
    /// Connect and print the connection snapshot
    Connect,
    /// Read stored trouble codes
    ReadDtc,
    /// Clear trouble codes and the MIL
    ClearDtc,
    /// MIL, stored code count and readiness monitors
    Status,
    /// Standard live data set
    LiveData,
    /// Repeated reads checked for consistency
    SelfCheck,
    /// Vehicle identification number
    Vin,
    /// Battery voltage at the adapter
    Voltage,
    /// Persisted summary; no adapter needed
    Summary {
        /// Only events from the last N days
        #[arg(long)]
        days: Option<i64>,
    },
}

impl Operation {
    pub fn needs_adapter(&self) -> bool {
        !matches!(self, Operation::Summary { .. })
    }
}

/// Run one operation; the JSON carries the result and session state
pub async fn execute(service: &DiagnosticService, operation: &Operation) -> Result<Value> {
    info!("Running {:?}", operation);
    let result = match operation {
        Operation::Connect => json!(service.driver().snapshot()),
        Operation::ReadDtc => json!(service.read_dtc().await?),
        Operation::ClearDtc => {
            service.clear_dtc().await?;
            json!({ "cleared": true })
        }
        Operation::Status => json!(service.read_status().await?),
        Operation::LiveData => json!(service.read_live_data().await?),
        Operation::SelfCheck => json!(service.self_check().await?),
        Operation::Vin => json!({ "vin": service.driver().read_vin().await? }),
        Operation::Voltage => json!({ "voltage": service.driver().read_voltage().await? }),
        Operation::Summary { days } => {
            let since = days.map(|days| Utc::now() - Duration::days(days));
            json!(service.historical_summary(since).await?)
        }
    };

    Ok(json!({
        "result": result,
        "snapshot": service.snapshot(),
        "insights": service.insights(None),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_driver::transport::mock::{AdapterScript, MockLink, MockTransport};
    use obd_driver::{CancelSignal, DriverConfig, ObdDriver};
    use obd_session::SessionConfig;
    use std::sync::Arc;
    use storage::MemoryEventStore;

    async fn connected() -> DiagnosticService {
        let config = DriverConfig {
            auto_reconnect: false,
            watchdog_interval_ms: 0,
            ..Default::default()
        };
        let link = MockLink::new(MockTransport::new(
            AdapterScript::default().reply("03", "43 01 33 01 71"),
        ));
        let driver = ObdDriver::new(config, Arc::new(link));
        let service = DiagnosticService::new(
            driver,
            Arc::new(MemoryEventStore::new(100)),
            SessionConfig::default(),
        );
        service.connect(CancelSignal::never()).await.unwrap();
        service
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_dtc_output() {
        let service = connected().await;
        let output = execute(&service, &Operation::ReadDtc).await.unwrap();

        let codes = output["result"].as_array().unwrap();
        assert_eq!(codes.len(), 2);
        assert_eq!(codes[0]["code"], "P0133");
        assert_eq!(codes[1]["code"], "P0171");
        assert_eq!(output["snapshot"]["session"]["state"], "ready");
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_without_adapter() {
        let service = connected().await;
        execute(&service, &Operation::Status).await.unwrap();

        let operation = Operation::Summary { days: Some(7) };
        assert!(!operation.needs_adapter());
        let output = execute(&service, &operation).await.unwrap();
        assert!(output["result"].is_object());
    }
}
