//! Connection health counters
//!
//! One [`ConnectionMetrics`] lives for the lifetime of a driver instance and
//! survives reconnects. Every update is mirrored to the `metrics` facade so
//! an installed exporter sees the same numbers.

use crate::error::QueueError;
use crate::events::ScanPhase;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

/// Metrics shared between the queue worker and the connection manager
pub type SharedMetrics = Arc<Mutex<ConnectionMetrics>>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionMetrics {
    pub commands_sent: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    pub commands_timed_out: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,

    pub total_success_latency_ms: u64,
    pub total_error_latency_ms: u64,
    /// Mean latency of successful commands
    pub average_latency_ms: f64,
    /// Mean latency of failed commands
    pub average_error_latency_ms: f64,

    pub last_command: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_command_completed_at: Option<DateTime<Utc>>,

    /// Commands queued or in flight
    pub queue_depth: usize,
    pub max_queue_depth: usize,

    pub connection_attempts: u64,
    pub last_connect_phase: Option<ScanPhase>,
    pub last_rssi: Option<i16>,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub reconnect_failures: u64,
    pub last_reconnect_duration_ms: Option<u64>,
    pub total_reconnect_duration_ms: u64,
    pub watchdog_triggers: u64,

    pub firmware_version: Option<String>,
    pub protocol: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_disconnect_at: Option<DateTime<Utc>>,

    /// Last successful command completion (or link ready), for the watchdog
    #[serde(skip)]
    pub last_activity: Option<Instant>,
}

impl ConnectionMetrics {
    pub fn shared() -> SharedMetrics {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn record_sent(&mut self, command: &str, bytes: usize) {
        self.commands_sent += 1;
        self.bytes_sent += bytes as u64;
        self.last_command = Some(command.to_string());
        metrics::counter!("obd_commands_total").increment(1);
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        metrics::counter!("obd_bytes_received_total").increment(bytes as u64);
    }

    /// Average divides by the success count after it is incremented
    pub fn record_success(&mut self, command: &str, latency_ms: u64) {
        self.commands_succeeded += 1;
        self.total_success_latency_ms += latency_ms;
        self.average_latency_ms =
            self.total_success_latency_ms as f64 / self.commands_succeeded as f64;
        self.last_command = Some(command.to_string());
        self.last_duration_ms = Some(latency_ms);
        self.last_command_completed_at = Some(Utc::now());
        self.last_activity = Some(Instant::now());
        metrics::histogram!("obd_command_latency_ms").record(latency_ms as f64);
    }

    pub fn record_failure(&mut self, command: &str, latency_ms: u64, error: &QueueError) {
        self.commands_failed += 1;
        if error.is_timeout() {
            self.commands_timed_out += 1;
            metrics::counter!("obd_command_timeouts_total").increment(1);
        }
        self.total_error_latency_ms += latency_ms;
        self.average_error_latency_ms =
            self.total_error_latency_ms as f64 / self.commands_failed as f64;
        self.last_command = Some(command.to_string());
        self.last_duration_ms = Some(latency_ms);
        self.last_error = Some(error.to_string());
        metrics::counter!("obd_command_failures_total").increment(1);
    }

    pub fn set_queue_depth(&mut self, depth: usize) {
        self.queue_depth = depth;
        self.max_queue_depth = self.max_queue_depth.max(depth);
        metrics::gauge!("obd_queue_depth").set(depth as f64);
    }

    pub fn record_connect_attempt(&mut self) {
        self.connection_attempts += 1;
    }

    pub fn record_ready(&mut self) {
        self.connected_at = Some(Utc::now());
        self.last_activity = Some(Instant::now());
    }

    pub fn record_disconnect(&mut self) {
        self.last_disconnect_at = Some(Utc::now());
        self.queue_depth = 0;
    }

    pub fn record_reconnect_attempt(&mut self) {
        self.reconnect_attempts += 1;
        metrics::counter!("obd_reconnect_attempts_total").increment(1);
    }

    pub fn record_reconnect_success(&mut self, duration_ms: u64) {
        self.reconnect_successes += 1;
        self.last_reconnect_duration_ms = Some(duration_ms);
        self.total_reconnect_duration_ms += duration_ms;
    }

    pub fn record_reconnect_failure(&mut self) {
        self.reconnect_failures += 1;
    }

    pub fn record_watchdog_trigger(&mut self) {
        self.watchdog_triggers += 1;
        metrics::counter!("obd_watchdog_triggers_total").increment(1);
    }

    /// Time since the last command completed, if any
    pub fn idle_for(&self) -> Option<std::time::Duration> {
        self.last_activity.map(|at| at.elapsed())
    }

    pub fn seconds_since_last_command(&self) -> Option<f64> {
        self.last_command_completed_at
            .map(|at| (Utc::now() - at).num_milliseconds() as f64 / 1000.0)
    }
}
