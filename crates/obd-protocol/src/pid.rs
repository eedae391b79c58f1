//! OBD-II PID Definitions and Response Parsing
//!
//! Defines the standard Mode 01 Parameter IDs (PIDs) as a formula table and
//! decodes raw payload bytes with it.

use crate::error::ObdError;
use serde::{Deserialize, Serialize};

/// Standard OBD-II PIDs for Mode 01 (current data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Monitor status since DTCs cleared (0x01)
    MonitorStatus = 0x01,
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Short-term fuel trim bank 1 (0x06)
    ShortFuelTrim = 0x06,
    /// Long-term fuel trim bank 1 (0x07)
    LongFuelTrim = 0x07,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Intake air temperature (0x0F)
    IntakeAirTemp = 0x0F,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Oxygen sensor voltage bank 1, sensor 1 (0x14)
    O2Voltage = 0x14,
    /// Fuel tank level (0x2F)
    FuelLevel = 0x2F,
    /// Control module voltage (0x42)
    ControlModuleVoltage = 0x42,
    /// Ambient air temperature (0x46)
    AmbientAirTemp = 0x46,
    /// Engine oil temperature (0x5C)
    OilTemp = 0x5C,
}

impl Pid {
    /// The set read by a live-data snapshot, in request order
    pub const LIVE_DATA: [Pid; 6] = [
        Pid::Rpm,
        Pid::CoolantTemp,
        Pid::IntakeAirTemp,
        Pid::Speed,
        Pid::ControlModuleVoltage,
        Pid::ThrottlePosition,
    ];

    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Mode 01 request text for this PID, e.g. `010C`
    pub fn request(&self) -> String {
        format!("01{:02X}", self.as_hex())
    }

    /// Get the number of response bytes for this PID
    pub fn response_bytes(&self) -> usize {
        lookup_pid(self.as_hex()).map_or(1, |spec| spec.byte_count)
    }
}

/// Decoding formula applied to the data bytes `A`, `B`, ...
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Formula {
    /// `A`
    Raw,
    /// `A - 40`
    Temperature,
    /// `A * 100 / 255`
    Percent,
    /// `(A - 128) * 100 / 128`
    FuelTrim,
    /// `A / divisor`
    ByteScaled(f64),
    /// `(A * 256 + B) / divisor`
    WordScaled(f64),
    /// `(A * 256 + B) - offset`
    WordOffset(f64),
}

impl Formula {
    /// Minimum number of data bytes the formula reads
    pub fn min_bytes(&self) -> usize {
        match self {
            Formula::WordScaled(_) | Formula::WordOffset(_) => 2,
            _ => 1,
        }
    }

    /// Apply the formula; callers guarantee `bytes.len() >= min_bytes()`
    pub fn apply(&self, bytes: &[u8]) -> f64 {
        let a = bytes[0] as f64;
        match *self {
            Formula::Raw => a,
            Formula::Temperature => a - 40.0,
            Formula::Percent => a * 100.0 / 255.0,
            Formula::FuelTrim => (a - 128.0) * 100.0 / 128.0,
            Formula::ByteScaled(divisor) => a / divisor,
            Formula::WordScaled(divisor) => (a * 256.0 + bytes[1] as f64) / divisor,
            Formula::WordOffset(offset) => (a * 256.0 + bytes[1] as f64) - offset,
        }
    }
}

/// One row of a PID decode table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidSpec {
    pub pid: u8,
    pub name: &'static str,
    pub unit: &'static str,
    pub byte_count: usize,
    pub formula: Formula,
}

/// Mode 01 decode table
pub const STANDARD_PIDS: &[PidSpec] = &[
    PidSpec { pid: 0x04, name: "engine_load", unit: "%", byte_count: 1, formula: Formula::Percent },
    PidSpec { pid: 0x05, name: "coolant_temp", unit: "°C", byte_count: 1, formula: Formula::Temperature },
    PidSpec { pid: 0x06, name: "short_fuel_trim", unit: "%", byte_count: 1, formula: Formula::FuelTrim },
    PidSpec { pid: 0x07, name: "long_fuel_trim", unit: "%", byte_count: 1, formula: Formula::FuelTrim },
    PidSpec { pid: 0x0B, name: "intake_manifold_pressure", unit: "kPa", byte_count: 1, formula: Formula::Raw },
    PidSpec { pid: 0x0C, name: "rpm", unit: "rpm", byte_count: 2, formula: Formula::WordScaled(4.0) },
    PidSpec { pid: 0x0D, name: "speed", unit: "km/h", byte_count: 1, formula: Formula::Raw },
    PidSpec { pid: 0x0F, name: "intake_air_temp", unit: "°C", byte_count: 1, formula: Formula::Temperature },
    PidSpec { pid: 0x10, name: "maf", unit: "g/s", byte_count: 2, formula: Formula::WordScaled(100.0) },
    PidSpec { pid: 0x11, name: "throttle_position", unit: "%", byte_count: 1, formula: Formula::Percent },
    PidSpec { pid: 0x14, name: "o2_voltage", unit: "V", byte_count: 2, formula: Formula::ByteScaled(200.0) },
    PidSpec { pid: 0x2F, name: "fuel_level", unit: "%", byte_count: 1, formula: Formula::Percent },
    PidSpec { pid: 0x42, name: "control_module_voltage", unit: "V", byte_count: 2, formula: Formula::WordScaled(1000.0) },
    PidSpec { pid: 0x46, name: "ambient_air_temp", unit: "°C", byte_count: 1, formula: Formula::Temperature },
    PidSpec { pid: 0x5C, name: "oil_temp", unit: "°C", byte_count: 1, formula: Formula::Temperature },
];

/// Find a PID in the standard table
pub fn lookup_pid(pid: u8) -> Option<&'static PidSpec> {
    STANDARD_PIDS.iter().find(|spec| spec.pid == pid)
}

/// Response from a PID query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidResponse {
    /// The PID that was queried
    pub pid: u8,
    /// Timestamp when the response was received (Unix ms)
    pub timestamp_ms: u64,
    /// Decoded value
    pub value: f64,
    /// Raw bytes from the response
    pub raw_bytes: Vec<u8>,
}

impl PidResponse {
    /// Decode raw payload bytes for `pid`.
    ///
    /// PIDs missing from the table decode best-effort to their first byte.
    pub fn decode(pid: u8, raw_bytes: Vec<u8>, timestamp_ms: u64) -> Result<Self, ObdError> {
        let value = Self::decode_value(pid, &raw_bytes)?;
        Ok(Self {
            pid,
            timestamp_ms,
            value,
            raw_bytes,
        })
    }

    fn decode_value(pid: u8, bytes: &[u8]) -> Result<f64, ObdError> {
        match lookup_pid(pid) {
            Some(spec) => {
                let needed = spec.formula.min_bytes();
                if bytes.len() < needed {
                    return Err(ObdError::ShortPayload {
                        pid,
                        expected: needed,
                        actual: bytes.len(),
                    });
                }
                Ok(spec.formula.apply(bytes))
            }
            None => bytes.first().map(|b| *b as f64).ok_or(ObdError::ShortPayload {
                pid,
                expected: 1,
                actual: 0,
            }),
        }
    }
}

/// Snapshot of the live-data PID set
///
/// A field is `None` when the vehicle answered `NO DATA` for that PID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveData {
    /// Timestamp (Unix ms)
    pub timestamp_ms: u64,
    /// Engine RPM
    pub rpm: Option<f64>,
    /// Coolant temperature (°C)
    pub coolant_temp: Option<f64>,
    /// Intake air temperature (°C)
    pub intake_temp: Option<f64>,
    /// Vehicle speed (km/h)
    pub speed: Option<f64>,
    /// Control module voltage (V)
    pub voltage: Option<f64>,
    /// Throttle position (%)
    pub throttle: Option<f64>,
}

impl LiveData {
    /// Create a new empty snapshot with the given timestamp
    pub fn new(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            ..Default::default()
        }
    }

    /// Update a field from a PID response
    pub fn update_from_response(&mut self, response: &PidResponse) {
        match response.pid {
            0x0C => self.rpm = Some(response.value),
            0x05 => self.coolant_temp = Some(response.value),
            0x0F => self.intake_temp = Some(response.value),
            0x0D => self.speed = Some(response.value),
            0x42 => self.voltage = Some(response.value),
            0x11 => self.throttle = Some(response.value),
            _ => {}
        }
    }

    /// True when no PID produced a value
    pub fn is_empty(&self) -> bool {
        self.rpm.is_none()
            && self.coolant_temp.is_none()
            && self.intake_temp.is_none()
            && self.speed.is_none()
            && self.voltage.is_none()
            && self.throttle.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(pid: u8, bytes: &[u8]) -> f64 {
        PidResponse::decode(pid, bytes.to_vec(), 0).unwrap().value
    }

    #[test]
    fn test_rpm_decode() {
        // 1A 2B => ((0x1A * 256) + 0x2B) / 4 = 6699/4 = 1674.75
        assert!((value(0x0C, &[0x1A, 0x2B]) - 1674.75).abs() < 0.01);
    }

    #[test]
    fn test_temperature_decode() {
        // 0x73 = 115, so temp = 115 - 40 = 75°C
        assert!((value(0x05, &[0x73]) - 75.0).abs() < 0.01);
        assert!((value(0x0F, &[0x28]) - 0.0).abs() < 0.01);
    }

    #[test]
    fn test_speed_and_voltage_decode() {
        assert!((value(0x0D, &[0x55]) - 85.0).abs() < 0.01);
        // 0x3138 = 12600 mV
        assert!((value(0x42, &[0x31, 0x38]) - 12.6).abs() < 0.01);
    }

    #[test]
    fn test_percent_decode() {
        assert!((value(0x11, &[0xFF]) - 100.0).abs() < 0.01);
        assert!((value(0x11, &[0x00]) - 0.0).abs() < 0.01);
    }

    #[test]
    fn test_fuel_trim_decode() {
        assert!((value(0x06, &[0x80]) - 0.0).abs() < 0.01);
        // 0x90 = 144, so trim = (144-128)*100/128 = 12.5%
        assert!((value(0x06, &[0x90]) - 12.5).abs() < 0.01);
    }

    #[test]
    fn test_unknown_pid_returns_first_byte() {
        assert!((value(0xA6, &[0x42, 0x01]) - 66.0).abs() < 0.01);
    }

    #[test]
    fn test_short_payload_is_error() {
        let err = PidResponse::decode(0x0C, vec![0x1A], 0).unwrap_err();
        assert_eq!(
            err,
            ObdError::ShortPayload {
                pid: 0x0C,
                expected: 2,
                actual: 1
            }
        );
        assert!(PidResponse::decode(0xA6, vec![], 0).is_err());
    }

    #[test]
    fn test_live_data_update() {
        let mut live = LiveData::new(10);
        assert!(live.is_empty());
        let rpm = PidResponse::decode(0x0C, vec![0x0B, 0xB8], 10).unwrap();
        live.update_from_response(&rpm);
        assert_eq!(live.rpm, Some(750.0));
        assert!(!live.is_empty());
    }

    #[test]
    fn test_request_text() {
        assert_eq!(Pid::Rpm.request(), "010C");
        assert_eq!(Pid::ControlModuleVoltage.request(), "0142");
        assert_eq!(Pid::Rpm.response_bytes(), 2);
    }
}
