//! Driver configuration
//!
//! Fully resolved before the driver is built; nothing reads the environment
//! after construction.

use crate::error::ConnectError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default command timeout
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5000;

/// Time that must remain for the widened scan
const MIN_WIDENED_WINDOW_MS: u64 = 1500;

/// Physical link to the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Ble,
    Serial,
}

/// Configuration for one driver instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub link: LinkKind,

    /// Advertised name of the adapter
    pub device_name: String,
    /// Extra substrings that identify an adapter by name
    pub name_tokens: Vec<String>,
    /// MAC address or platform id of a known adapter
    pub device_address: Option<String>,
    pub service_uuid: String,
    pub tx_characteristic_uuid: String,
    pub rx_characteristic_uuid: String,
    /// Restrict the first scan phase to `service_uuid`
    pub filter_by_service: bool,

    /// Serial port device path (e.g., "/dev/ttyUSB0" or "COM3")
    pub serial_path: String,
    pub baud_rate: u32,

    pub command_timeout_ms: u64,
    /// `ATZ` can take noticeably longer than other commands
    pub reset_timeout_ms: u64,
    /// Settle time after `ATZ` before the rest of the init sequence
    pub post_reset_delay_ms: u64,
    /// Try the vendor extended-protocol command during the handshake
    pub extended_protocol: bool,
    /// Vendor command for the extended protocol (CAN-FD on KINGBOLEN units)
    pub extended_protocol_command: String,
    /// Command that reports the adapter firmware
    pub firmware_command: String,

    /// Total discovery budget for the first scan phase
    pub connect_timeout_ms: u64,
    /// Drop the service filter after this long; derived from the timeout
    /// when unset
    pub widen_after_ms: Option<u64>,
    /// Extra time granted to the widened scan; derived when unset
    pub second_phase_ms: Option<u64>,

    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    /// Idle period before the watchdog forces a reconnect; 0 disables it
    pub watchdog_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            link: LinkKind::Ble,
            device_name: "KINGBOLEN".to_string(),
            name_tokens: vec!["EDIAG".to_string(), "OBD".to_string(), "VCI".to_string()],
            device_address: None,
            service_uuid: "0000ffe0-0000-1000-8000-00805f9b34fb".to_string(),
            tx_characteristic_uuid: "0000ffe1-0000-1000-8000-00805f9b34fb".to_string(),
            rx_characteristic_uuid: "0000ffe1-0000-1000-8000-00805f9b34fb".to_string(),
            filter_by_service: true,
            serial_path: "/dev/ttyUSB0".to_string(),
            baud_rate: 38400,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            reset_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            post_reset_delay_ms: 1000,
            extended_protocol: true,
            extended_protocol_command: "AT#2".to_string(),
            firmware_command: "AT#1".to_string(),
            connect_timeout_ms: 15000,
            widen_after_ms: None,
            second_phase_ms: None,
            auto_reconnect: true,
            reconnect_delay_ms: 5000,
            watchdog_interval_ms: 15000,
        }
    }
}

impl DriverConfig {
    /// Reject settings the driver cannot run with
    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.command_timeout_ms == 0 || self.reset_timeout_ms == 0 {
            return Err(ConnectError::InvalidConfig(
                "command timeouts must be non-zero".to_string(),
            ));
        }
        if self.link == LinkKind::Ble && self.connect_timeout_ms == 0 {
            return Err(ConnectError::InvalidConfig(
                "connect_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.link == LinkKind::Serial && self.serial_path.is_empty() {
            return Err(ConnectError::InvalidConfig("serial_path is empty".to_string()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn post_reset_delay(&self) -> Duration {
        Duration::from_millis(self.post_reset_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn watchdog_interval(&self) -> Option<Duration> {
        (self.watchdog_interval_ms > 0).then(|| Duration::from_millis(self.watchdog_interval_ms))
    }

    /// Widen deadline: half the timeout, capped so that at least 1.5s of the
    /// first phase remain, falling back to 40% for very short timeouts
    pub fn widen_after(&self) -> Duration {
        let ms = self.widen_after_ms.unwrap_or_else(|| {
            let total = self.connect_timeout_ms;
            let capped = (total / 2).min(total.saturating_sub(MIN_WIDENED_WINDOW_MS));
            if capped == 0 {
                total * 2 / 5
            } else {
                capped
            }
        });
        Duration::from_millis(ms)
    }

    /// Deadline extension granted when the scan widens (40% of the timeout
    /// by default)
    pub fn second_phase(&self) -> Duration {
        Duration::from_millis(
            self.second_phase_ms
                .unwrap_or(self.connect_timeout_ms * 2 / 5),
        )
    }
}
