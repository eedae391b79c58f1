//! Link states and driver notifications

use serde::{Deserialize, Serialize};

/// Which scan the discovery cycle is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    /// Restricted to the adapter's service UUID
    Filtered,
    /// No service filter from the start
    Unfiltered,
    /// Filter dropped after the widen deadline
    Widened,
}

/// Connection manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "phase")]
pub enum LinkState {
    #[default]
    Idle,
    Scanning(ScanPhase),
    Connecting,
    Handshaking,
    Ready,
    Disconnected,
}

impl LinkState {
    pub fn is_ready(&self) -> bool {
        matches!(self, LinkState::Ready)
    }

    /// A connect cycle is in progress
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            LinkState::Scanning(_) | LinkState::Connecting | LinkState::Handshaking
        )
    }
}

/// Why a ready link went away
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum DisconnectReason {
    Requested,
    LinkLost,
    Watchdog,
    TransportError(String),
}

/// Telemetry broadcast by the driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum DriverEvent {
    ConnectAttempt { attempt: u64, reconnect: bool },
    ScanStarted { phase: ScanPhase },
    ScanWidened { after_ms: u64, extension_ms: u64 },
    PeripheralMatched { id: String, name: Option<String>, rssi: Option<i16> },
    Connected { device: String, reconnect: bool, duration_ms: u64 },
    ConnectFailed { error: String, reconnect: bool },
    Disconnected { reason: DisconnectReason },
    ReconnectScheduled { in_ms: u64 },
    WatchdogTrigger { idle_ms: u64 },
    CommandCompleted { command: String, duration_ms: u64 },
    CommandFailed { command: String, error: String },
}
