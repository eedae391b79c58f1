//! Session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Timeline ring size
    pub timeline_capacity: usize,
    /// State-change history ring size
    pub history_capacity: usize,
    /// Attempts per operation, including the first
    pub attempts: u32,
    /// Backoff unit; attempt `n` failing waits `n * base_delay_ms`
    pub base_delay_ms: u64,
    pub self_check_attempts: u32,
    pub self_check_delay_ms: u64,
    /// Window used by `insights` when none is given (0 = whole timeline)
    pub insights_window_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeline_capacity: 64,
            history_capacity: 32,
            attempts: 3,
            base_delay_ms: 250,
            self_check_attempts: 3,
            self_check_delay_ms: 500,
            insights_window_ms: 0,
        }
    }
}

impl SessionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_millis(self.base_delay_ms))
    }

    pub fn insights_window(&self) -> Option<Duration> {
        (self.insights_window_ms > 0).then(|| Duration::from_millis(self.insights_window_ms))
    }
}

/// Attempt budget with linear backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// Wait after failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        SessionConfig::default().retry_policy()
    }
}
