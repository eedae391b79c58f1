//! Driver Error Types

use obd_protocol::ObdError;
use thiserror::Error;

/// Errors raised by the BLE capability
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("Bluetooth adapter unavailable: {0}")]
    Unavailable(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Connection to {0} failed")]
    ConnectFailed(String),

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("Characteristic discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

/// Errors raised by a byte link
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Failed to open link: {0}")]
    OpenFailed(String),

    #[error("Link not open")]
    NotOpen,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Link I/O error: {0}")]
    Io(String),

    #[error("BLE error: {0}")]
    Ble(#[from] BleError),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<tokio_serial::Error> for TransportError {
    fn from(err: tokio_serial::Error) -> Self {
        TransportError::OpenFailed(err.to_string())
    }
}

/// Why a queued command did not produce a frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Timeout waiting for response to {command} after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Write of {command} failed: {reason}")]
    WriteFailed { command: String, reason: String },

    #[error("Link closed before {0} completed")]
    LinkClosed(String),

    #[error("Command queue stopped")]
    Stopped,
}

impl QueueError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueueError::Timeout { .. })
    }
}

/// Why a connect call failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("No matching adapter found within {elapsed_ms}ms")]
    DiscoveryTimeout { elapsed_ms: u64 },

    #[error("TX/RX characteristics not found on {0}")]
    CharacteristicsNotFound(String),

    #[error("Handshake command {command} failed: {reason}")]
    Handshake { command: String, reason: String },

    #[error("Connect cancelled")]
    Cancelled,

    #[error("Invalid driver configuration: {0}")]
    InvalidConfig(String),

    #[error("BLE error: {0}")]
    Ble(#[from] BleError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors surfaced by the driver facade
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Adapter not connected")]
    NotConnected,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Protocol(#[from] ObdError),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}
