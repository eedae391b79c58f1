//! Typed diagnostic reads over a managed adapter connection

use crate::ble::{BleCentral, BleLink};
use crate::cancel::CancelSignal;
use crate::config::{DriverConfig, LinkKind};
use crate::connection::{ConnectionManager, ConnectionSnapshot, LinkFactory};
use crate::error::{ConnectError, DriverError};
use crate::events::{DriverEvent, LinkState};
use crate::transport::SerialLink;
use obd_protocol::{
    check_adapter_reply, extract_mode01_payload, is_clear_acknowledged, parse_dtc_response,
    parse_status, parse_vin, parse_voltage, Dtc, DtcStatus, HybridData, HybridPid, LiveData,
    ObdError, ObdStatus, Pid, PidResponse,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

const READ_DTC: &str = "03";
const READ_PENDING_DTC: &str = "07";
const CLEAR_DTC: &str = "04";
const READ_STATUS: &str = "0101";
const READ_VOLTAGE: &str = "ATRV";
const READ_VIN: &str = "0902";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `NO DATA` means the vehicle does not support the request
fn is_no_data(error: &ObdError) -> bool {
    matches!(error, ObdError::AdapterReply(reply) if reply == "NO DATA")
}

/// ELM327-class OBD-II driver
#[derive(Clone)]
pub struct ObdDriver {
    manager: ConnectionManager,
}

impl ObdDriver {
    pub fn new(config: DriverConfig, link: Arc<dyn LinkFactory>) -> Self {
        Self {
            manager: ConnectionManager::new(config, link),
        }
    }

    /// Driver for a BLE adapter found through `central`
    pub fn ble(config: DriverConfig, central: Arc<dyn BleCentral>) -> Self {
        let link = BleLink::new(central, config.clone());
        Self::new(config, Arc::new(link))
    }

    /// Driver for a wired adapter on `config.serial_path`
    pub fn serial(config: DriverConfig) -> Self {
        let link = SerialLink::new(config.serial_path.clone(), config.baud_rate);
        Self::new(config, Arc::new(link))
    }

    /// Driver for the link configured in `config`. BLE needs a central.
    pub fn from_config(
        config: DriverConfig,
        central: Option<Arc<dyn BleCentral>>,
    ) -> Result<Self, ConnectError> {
        config.validate()?;
        match (config.link, central) {
            (LinkKind::Serial, _) => Ok(Self::serial(config)),
            (LinkKind::Ble, Some(central)) => Ok(Self::ble(config, central)),
            (LinkKind::Ble, None) => Err(ConnectError::InvalidConfig(
                "BLE link requested without a BLE central".to_string(),
            )),
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub async fn connect(&self, cancel: CancelSignal) -> Result<ConnectionSnapshot, DriverError> {
        Ok(self.manager.connect(cancel).await?)
    }

    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.manager.snapshot()
    }

    pub fn is_ready(&self) -> bool {
        self.manager.state().is_ready()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DriverEvent> {
        self.manager.subscribe_events()
    }

    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.manager.link_state()
    }

    /// Raw command; returns the sanitised reply frame
    pub async fn send_command(&self, command: &str) -> Result<String, DriverError> {
        let queue = self.manager.queue()?;
        Ok(queue.send(command).await?)
    }

    /// Stored trouble codes (Mode 03)
    pub async fn read_dtc(&self) -> Result<Vec<Dtc>, DriverError> {
        let frame = self.send_command(READ_DTC).await?;
        let codes = parse_dtc_response(&frame, DtcStatus::Current)?;
        info!("Read {} stored trouble codes", codes.len());
        Ok(codes)
    }

    /// Pending trouble codes (Mode 07)
    pub async fn read_pending_dtc(&self) -> Result<Vec<Dtc>, DriverError> {
        let frame = self.send_command(READ_PENDING_DTC).await?;
        Ok(parse_dtc_response(&frame, DtcStatus::Pending)?)
    }

    /// Clear trouble codes and the MIL (Mode 04); true when acknowledged
    pub async fn clear_dtc(&self) -> Result<bool, DriverError> {
        let frame = self.send_command(CLEAR_DTC).await?;
        check_adapter_reply(&frame)?;
        let cleared = is_clear_acknowledged(&frame);
        info!("Clear trouble codes acknowledged: {}", cleared);
        Ok(cleared)
    }

    /// MIL, stored code count and readiness monitors
    pub async fn read_status(&self) -> Result<ObdStatus, DriverError> {
        let frame = self.send_command(READ_STATUS).await?;
        Ok(parse_status(&frame)?)
    }

    /// One Mode 01 PID; `None` when the vehicle answers `NO DATA`
    pub async fn read_pid(&self, pid: u8) -> Result<Option<PidResponse>, DriverError> {
        let frame = self.send_command(&format!("01{:02X}", pid)).await?;
        let payload = match extract_mode01_payload(&frame, pid) {
            Ok(payload) => payload,
            Err(e) if is_no_data(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(PidResponse::decode(pid, payload, now_ms())?))
    }

    /// The live-data PID set. PIDs the vehicle cannot answer stay `None`;
    /// link failures abort the whole read.
    pub async fn read_live_data(&self) -> Result<LiveData, DriverError> {
        let mut data = LiveData::new(now_ms());
        for pid in Pid::LIVE_DATA {
            match self.read_pid(pid.as_hex()).await {
                Ok(Some(response)) => data.update_from_response(&response),
                Ok(None) => debug!("PID {:02X} not supported", pid.as_hex()),
                Err(DriverError::Protocol(e)) => debug!("PID {:02X} unreadable: {}", pid.as_hex(), e),
                Err(e) => return Err(e),
            }
        }
        Ok(data)
    }

    /// Hybrid powertrain vendor PIDs
    pub async fn read_hybrid(&self) -> Result<HybridData, DriverError> {
        let mut data = HybridData::default();
        for pid in HybridPid::ALL {
            let frame = self.send_command(&pid.request()).await?;
            let applied = extract_mode01_payload(&frame, pid.as_hex())
                .and_then(|payload| data.apply(pid, &payload));
            if let Err(e) = applied {
                debug!("Hybrid PID {:02X} unreadable: {}", pid.as_hex(), e);
            }
        }
        Ok(data)
    }

    /// Battery voltage as measured by the adapter
    pub async fn read_voltage(&self) -> Result<f64, DriverError> {
        let frame = self.send_command(READ_VOLTAGE).await?;
        Ok(parse_voltage(&frame)?)
    }

    pub async fn read_vin(&self) -> Result<String, DriverError> {
        let frame = self.send_command(READ_VIN).await?;
        Ok(parse_vin(&frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{AdapterScript, MockLink, MockTransport};

    async fn connected(script: AdapterScript) -> ObdDriver {
        let config = DriverConfig {
            auto_reconnect: false,
            watchdog_interval_ms: 0,
            ..Default::default()
        };
        let driver = ObdDriver::new(config, Arc::new(MockLink::new(MockTransport::new(script))));
        driver.connect(CancelSignal::never()).await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_not_connected() {
        let driver = ObdDriver::new(
            DriverConfig::default(),
            Arc::new(MockLink::new(MockTransport::new(AdapterScript::default()))),
        );
        assert_eq!(driver.read_dtc().await.unwrap_err(), DriverError::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_dtc() {
        let driver = connected(AdapterScript::default().reply("03", "43 01 33 00 00")).await;
        let codes = driver.read_dtc().await.unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].code, "P0133");
        assert!(codes[0].description.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_dtc_no_data_is_empty() {
        let driver = connected(AdapterScript::default().reply("03", "NO DATA")).await;
        assert!(driver.read_dtc().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_dtc() {
        let driver = connected(AdapterScript::default()).await;
        assert!(driver.clear_dtc().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_data_skips_unsupported_pids() {
        let driver = connected(AdapterScript::default().reply("0142", "NO DATA")).await;
        let data = driver.read_live_data().await.unwrap();
        assert_eq!(data.rpm, Some(1726.0));
        assert_eq!(data.speed, Some(60.0));
        assert_eq!(data.coolant_temp, Some(50.0));
        assert!(data.voltage.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_status_and_voltage() {
        let driver = connected(AdapterScript::default()).await;
        let status = driver.read_status().await.unwrap();
        assert!(!status.mil);
        assert_eq!(status.dtc_count, 0);
        assert!((driver.read_voltage().await.unwrap() - 12.6).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_hybrid() {
        let script = AdapterScript::default()
            .reply("01D2", "41 D2 80")
            .reply("01A4", "41 A4 03");
        let driver = connected(script).await;
        let data = driver.read_hybrid().await.unwrap();
        assert!((data.battery_soc.unwrap() - 50.2).abs() < 0.1);
        assert_eq!(data.gear_position.as_deref(), Some("D"));
        assert!(data.mg1_rpm.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_as_queue_error() {
        let driver = connected(AdapterScript::default().silent("0101")).await;
        let err = driver.read_status().await.unwrap_err();
        assert!(matches!(err, DriverError::Queue(ref e) if e.is_timeout()));
    }
}
