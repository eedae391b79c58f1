//! BLE capability set
//!
//! The driver never talks to a GATT stack directly. The surrounding
//! application picks a stack once at startup and injects it as a
//! [`BleCentral`]; [`BleLink`] runs discovery on top of it.

mod discovery;
pub mod mock;

pub use discovery::BleLink;

use crate::error::BleError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Bluetooth SIG base UUID suffix for 16-bit short UUIDs
const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// One advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Platform peripheral identifier
    pub id: String,
    pub name: Option<String>,
    /// MAC address when the platform exposes it
    pub address: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: String,
    pub properties: CharacteristicProperties,
}

/// Operations the driver needs from a BLE central
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Advertisement stream; only delivers while a scan is running
    fn advertisements(&self) -> broadcast::Receiver<Advertisement>;

    /// Start scanning, restricted to `service_filter` when non-empty
    async fn start_scan(&self, service_filter: &[String], allow_duplicates: bool)
        -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    async fn connect(&self, peripheral: &str) -> Result<(), BleError>;

    async fn disconnect(&self, peripheral: &str) -> Result<(), BleError>;

    /// Characteristics of `service` (all services when `None`) whose UUIDs
    /// are in `uuids`; every characteristic when `uuids` is empty
    async fn discover_characteristics(
        &self,
        peripheral: &str,
        service: Option<&str>,
        uuids: &[String],
    ) -> Result<Vec<Characteristic>, BleError>;

    /// Enable notifications and stream their values
    async fn subscribe(
        &self,
        peripheral: &str,
        characteristic: &str,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BleError>;

    async fn write(
        &self,
        peripheral: &str,
        characteristic: &str,
        bytes: &[u8],
        with_response: bool,
    ) -> Result<(), BleError>;

    /// Fires once when the peripheral drops the connection
    fn disconnect_notice(&self, peripheral: &str) -> oneshot::Receiver<()>;
}

/// Reduce a UUID to its 16-bit form when it sits on the SIG base UUID
pub fn short_uuid(uuid: &str) -> String {
    let lower = uuid.trim().to_ascii_lowercase();
    if let Some(head) = lower.strip_suffix(BASE_UUID_SUFFIX) {
        if head.len() == 8 && head.starts_with("0000") {
            return head[4..].to_string();
        }
    }
    if lower.len() == 4 {
        return lower;
    }
    lower.replace('-', "")
}

/// Compare UUIDs in short or full form
pub fn uuid_matches(a: &str, b: &str) -> bool {
    short_uuid(a) == short_uuid(b)
}

/// Normalise an address for comparison: lowercase, separators removed
pub fn normalize_address(address: &str) -> String {
    address
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid() {
        assert_eq!(short_uuid("0000FFE0-0000-1000-8000-00805F9B34FB"), "ffe0");
        assert_eq!(short_uuid("FFE1"), "ffe1");
        assert!(uuid_matches("ffe0", "0000ffe0-0000-1000-8000-00805f9b34fb"));
        assert!(!uuid_matches("ffe0", "ffe1"));
    }

    #[test]
    fn test_custom_uuid_kept_whole() {
        let custom = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
        assert_eq!(short_uuid(custom), "6e400001b5a3f393e0a9e50e24dcca9e");
        assert!(uuid_matches(custom, &custom.to_uppercase()));
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("AA:BB:CC:00:11:22"), "aabbcc001122");
    }
}
