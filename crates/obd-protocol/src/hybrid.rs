//! Vendor PID table for hybrid powertrain telemetry (Toyota-style)

use crate::error::ObdError;
use crate::pid::{Formula, PidSpec};
use serde::{Deserialize, Serialize};

/// Hybrid vendor PIDs, queried through Mode 01 like standard PIDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HybridPid {
    /// Traction battery state of charge
    BatterySoc = 0xD2,
    /// Motor-generator 1 speed
    Mg1Rpm = 0xD3,
    /// Motor-generator 2 speed
    Mg2Rpm = 0xD4,
    /// Transaxle fluid temperature
    TransmissionTemp = 0xE4,
    /// Shift lever position
    GearPosition = 0xA4,
    /// EGR valve position
    EgrPosition = 0xF0,
    /// Catalyst temperature (reported as a percentage of range)
    CatalystTemp = 0xF1,
}

const HYBRID_PIDS: &[PidSpec] = &[
    PidSpec { pid: 0xD2, name: "battery_soc", unit: "%", byte_count: 1, formula: Formula::Percent },
    PidSpec { pid: 0xD3, name: "mg1_rpm", unit: "rpm", byte_count: 2, formula: Formula::WordOffset(32768.0) },
    PidSpec { pid: 0xD4, name: "mg2_rpm", unit: "rpm", byte_count: 2, formula: Formula::WordOffset(32768.0) },
    PidSpec { pid: 0xE4, name: "trans_temp", unit: "°C", byte_count: 1, formula: Formula::Temperature },
    PidSpec { pid: 0xA4, name: "gear_position", unit: "", byte_count: 1, formula: Formula::Raw },
    PidSpec { pid: 0xF0, name: "egr_position", unit: "%", byte_count: 1, formula: Formula::Percent },
    PidSpec { pid: 0xF1, name: "catalyst_temp", unit: "%", byte_count: 1, formula: Formula::Percent },
];

impl HybridPid {
    /// All hybrid PIDs in request order
    pub const ALL: [HybridPid; 7] = [
        HybridPid::BatterySoc,
        HybridPid::Mg1Rpm,
        HybridPid::Mg2Rpm,
        HybridPid::TransmissionTemp,
        HybridPid::GearPosition,
        HybridPid::EgrPosition,
        HybridPid::CatalystTemp,
    ];

    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Mode 01 request text, e.g. `01D2`
    pub fn request(&self) -> String {
        format!("01{:02X}", self.as_hex())
    }

    /// Table row for this PID
    pub fn spec(&self) -> &'static PidSpec {
        let row = match self {
            HybridPid::BatterySoc => 0,
            HybridPid::Mg1Rpm => 1,
            HybridPid::Mg2Rpm => 2,
            HybridPid::TransmissionTemp => 3,
            HybridPid::GearPosition => 4,
            HybridPid::EgrPosition => 5,
            HybridPid::CatalystTemp => 6,
        };
        &HYBRID_PIDS[row]
    }

    /// Decode a numeric value from payload bytes
    pub fn decode(&self, bytes: &[u8]) -> Result<f64, ObdError> {
        let spec = self.spec();
        let needed = spec.formula.min_bytes();
        if bytes.len() < needed {
            return Err(ObdError::ShortPayload {
                pid: spec.pid,
                expected: needed,
                actual: bytes.len(),
            });
        }
        Ok(spec.formula.apply(bytes))
    }
}

/// Map the raw shift-lever byte to its label
pub fn gear_label(raw: u8) -> &'static str {
    match raw {
        0 => "P",
        1 => "R",
        2 => "N",
        3 => "D",
        4 => "B",
        _ => "Unknown",
    }
}

/// Decoded hybrid telemetry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HybridData {
    pub battery_soc: Option<f64>,
    pub mg1_rpm: Option<f64>,
    pub mg2_rpm: Option<f64>,
    pub trans_temp: Option<f64>,
    pub gear_position: Option<String>,
    pub egr_position: Option<f64>,
    pub catalyst_temp: Option<f64>,
}

impl HybridData {
    /// Fold one PID's payload into the snapshot
    pub fn apply(&mut self, pid: HybridPid, bytes: &[u8]) -> Result<(), ObdError> {
        if pid == HybridPid::GearPosition {
            let raw = bytes.first().ok_or(ObdError::ShortPayload {
                pid: pid.as_hex(),
                expected: 1,
                actual: 0,
            })?;
            self.gear_position = Some(gear_label(*raw).to_string());
            return Ok(());
        }

        let value = Some(pid.decode(bytes)?);
        match pid {
            HybridPid::BatterySoc => self.battery_soc = value,
            HybridPid::Mg1Rpm => self.mg1_rpm = value,
            HybridPid::Mg2Rpm => self.mg2_rpm = value,
            HybridPid::TransmissionTemp => self.trans_temp = value,
            HybridPid::EgrPosition => self.egr_position = value,
            HybridPid::CatalystTemp => self.catalyst_temp = value,
            HybridPid::GearPosition => {}
        }
        Ok(())
    }
}
