//! Adapter Self-Check
//!
//! Repeats status, live data and trouble-code reads a few times and checks
//! that every attempt succeeds and that successful attempts agree.

use crate::outcome::OperationOutcome;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use obd_driver::{DriverError, ObdDriver};
use obd_protocol::{Dtc, LiveData, ObdStatus};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Reads a self-check needs from the adapter
#[async_trait]
pub trait DiagnosticReader: Send + Sync {
    async fn read_status(&self) -> Result<ObdStatus, DriverError>;
    async fn read_live_data(&self) -> Result<LiveData, DriverError>;
    async fn read_dtc(&self) -> Result<Vec<Dtc>, DriverError>;
    /// Active vehicle protocol, when known
    fn protocol(&self) -> Option<String>;
}

#[async_trait]
impl DiagnosticReader for ObdDriver {
    async fn read_status(&self) -> Result<ObdStatus, DriverError> {
        ObdDriver::read_status(self).await
    }

    async fn read_live_data(&self) -> Result<LiveData, DriverError> {
        ObdDriver::read_live_data(self).await
    }

    async fn read_dtc(&self) -> Result<Vec<Dtc>, DriverError> {
        ObdDriver::read_dtc(self).await
    }

    fn protocol(&self) -> Option<String> {
        self.snapshot().metrics.protocol
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfCheckStep {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: Option<ObdStatus>,
    pub live_data: Option<LiveData>,
    pub dtc: Option<Vec<Dtc>>,
    pub errors: Vec<String>,
    pub protocol: Option<String>,
}

impl SelfCheckStep {
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }

    /// Readings with timestamps stripped and codes sorted
    fn fingerprint(&self) -> String {
        let live_data = self.live_data.clone().map(|mut data| {
            data.timestamp_ms = 0;
            data
        });
        let dtc = self.dtc.clone().map(|mut codes| {
            codes.sort_by(|a, b| a.code.cmp(&b.code));
            codes
        });
        serde_json::to_string(&(&self.status, &live_data, &dtc)).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    fn over(values: impl Iterator<Item = f64>) -> Option<Self> {
        values.fold(None, |range: Option<ValueRange>, value| {
            Some(match range {
                None => ValueRange { min: value, max: value },
                Some(r) => ValueRange {
                    min: r.min.min(value),
                    max: r.max.max(value),
                },
            })
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfCheckMetrics {
    pub rpm: Option<ValueRange>,
    pub coolant_temp_c: Option<ValueRange>,
    pub vehicle_speed_kmh: Option<ValueRange>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfCheckReport {
    pub attempts_planned: u32,
    pub attempts_performed: u32,
    pub passes: u32,
    pub fails: u32,
    /// All passing attempts produced identical readings
    pub consistent: bool,
    pub summary: String,
    pub steps: Vec<SelfCheckStep>,
    pub metrics: SelfCheckMetrics,
}

impl SelfCheckReport {
    pub fn passed(&self) -> bool {
        self.passes > 0 && self.fails == 0 && self.consistent
    }
}

impl OperationOutcome for SelfCheckReport {
    fn failure(&self) -> Option<String> {
        (!self.passed()).then(|| self.summary.clone())
    }
}

/// Run `attempts` rounds of reads, `delay` apart
pub async fn run_self_check(
    reader: &dyn DiagnosticReader,
    attempts: u32,
    delay: Duration,
) -> SelfCheckReport {
    let attempts = attempts.max(1);
    let mut steps = Vec::with_capacity(attempts as usize);

    for attempt in 1..=attempts {
        info!("Self-check attempt {}/{}", attempt, attempts);
        let started = Instant::now();
        let mut step = SelfCheckStep {
            attempt,
            started_at: Utc::now(),
            duration_ms: 0,
            status: None,
            live_data: None,
            dtc: None,
            errors: Vec::new(),
            protocol: reader.protocol(),
        };

        match reader.read_status().await {
            Ok(status) => step.status = Some(status),
            Err(e) => step.errors.push(format!("status: {}", e)),
        }
        match reader.read_live_data().await {
            Ok(data) => step.live_data = Some(data),
            Err(e) => step.errors.push(format!("liveData: {}", e)),
        }
        match reader.read_dtc().await {
            Ok(codes) => step.dtc = Some(codes),
            Err(e) => step.errors.push(format!("readDtc: {}", e)),
        }

        step.duration_ms = started.elapsed().as_millis() as u64;
        if step.passed() {
            info!("Self-check attempt {} passed in {}ms", attempt, step.duration_ms);
        } else {
            warn!("Self-check attempt {} failed: {}", attempt, step.errors.join("; "));
        }
        steps.push(step);

        if attempt < attempts && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    let passes = steps.iter().filter(|step| step.passed()).count() as u32;
    let fails = steps.len() as u32 - passes;
    let consistent = is_consistent(&steps);
    let summary = format!(
        "{} attempts: {} passed, {} failed. Consistency: {}",
        attempts,
        passes,
        fails,
        if consistent { "OK" } else { "MISMATCH" }
    );

    SelfCheckReport {
        attempts_planned: attempts,
        attempts_performed: steps.len() as u32,
        passes,
        fails,
        consistent,
        summary,
        metrics: collect_metrics(&steps),
        steps,
    }
}

fn is_consistent(steps: &[SelfCheckStep]) -> bool {
    let mut passing = steps.iter().filter(|step| step.passed());
    let Some(first) = passing.next() else {
        return true;
    };
    let baseline = first.fingerprint();
    passing.all(|step| step.fingerprint() == baseline)
}

fn collect_metrics(steps: &[SelfCheckStep]) -> SelfCheckMetrics {
    let samples: Vec<&LiveData> = steps
        .iter()
        .filter(|step| step.passed())
        .filter_map(|step| step.live_data.as_ref())
        .collect();
    let range = |field: fn(&LiveData) -> Option<f64>| {
        ValueRange::over(samples.iter().filter_map(|data| field(data)).filter(|v| v.is_finite()))
    };

    SelfCheckMetrics {
        rpm: range(|data| data.rpm),
        coolant_temp_c: range(|data| data.coolant_temp),
        vehicle_speed_kmh: range(|data| data.speed),
        protocol: steps
            .iter()
            .filter(|step| step.passed())
            .find_map(|step| step.protocol.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_driver::QueueError;
    use parking_lot::Mutex;

    /// Replays canned readings, one per call
    struct ScriptedReader {
        rpm: Mutex<Vec<f64>>,
        fail_status_on: Option<usize>,
        calls: Mutex<usize>,
    }

    impl ScriptedReader {
        fn new(rpm: Vec<f64>) -> Self {
            Self {
                rpm: Mutex::new(rpm),
                fail_status_on: None,
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl DiagnosticReader for ScriptedReader {
        async fn read_status(&self) -> Result<ObdStatus, DriverError> {
            let mut calls = self.calls.lock();
            *calls += 1;
            if self.fail_status_on == Some(*calls) {
                return Err(DriverError::Queue(QueueError::Timeout {
                    command: "0101".into(),
                    timeout_ms: 5000,
                }));
            }
            Ok(obd_protocol::parse_status("41 01 00 07 65 00").unwrap())
        }

        async fn read_live_data(&self) -> Result<LiveData, DriverError> {
            let mut data = LiveData::new(Utc::now().timestamp_millis() as u64);
            let mut rpm = self.rpm.lock();
            data.rpm = if rpm.is_empty() { None } else { Some(rpm.remove(0)) };
            data.coolant_temp = Some(90.0);
            Ok(data)
        }

        async fn read_dtc(&self) -> Result<Vec<Dtc>, DriverError> {
            Ok(Vec::new())
        }

        fn protocol(&self) -> Option<String> {
            Some("ISO 15765-4 CAN (11 bit, 500 kbaud)".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consistent_self_check_passes() {
        let reader = ScriptedReader::new(vec![800.0, 800.0, 800.0]);
        let started = Instant::now();
        let report = run_self_check(&reader, 3, Duration::from_millis(500)).await;

        assert!(report.passed());
        assert_eq!(report.passes, 3);
        assert_eq!(report.summary, "3 attempts: 3 passed, 0 failed. Consistency: OK");
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
        assert_eq!(report.metrics.rpm, Some(ValueRange { min: 800.0, max: 800.0 }));
        assert!(report.metrics.protocol.as_ref().unwrap().starts_with("ISO 15765-4"));
        assert_eq!(report.failure(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatch_flags_failure() {
        let reader = ScriptedReader::new(vec![800.0, 1200.0]);
        let report = run_self_check(&reader, 2, Duration::ZERO).await;

        assert!(!report.consistent);
        assert!(!report.passed());
        assert_eq!(report.metrics.rpm, Some(ValueRange { min: 800.0, max: 1200.0 }));
        assert!(report.failure().unwrap().ends_with("MISMATCH"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_is_reported() {
        let mut reader = ScriptedReader::new(vec![800.0; 3]);
        reader.fail_status_on = Some(2);
        let report = run_self_check(&reader, 3, Duration::ZERO).await;

        assert_eq!(report.passes, 2);
        assert_eq!(report.fails, 1);
        assert!(report.consistent);
        assert!(report.steps[1].errors[0].starts_with("status:"));
        assert!(!report.passed());
    }
}
