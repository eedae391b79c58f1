//! Readiness monitor decoding (Mode 01 PID 01, bytes B..D)
//!
//! A monitor is reported "not ready" when its bit is set, so every flag is
//! `(byte & mask) == 0`.

use serde::{Deserialize, Serialize};

/// Ignition type, bit 3 of byte B
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Spark,
    Compression,
}

/// Monitor completion flags (`true` = ready)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub engine: EngineKind,
    // continuous monitors
    pub misfire: bool,
    pub fuel_system: bool,
    pub components: bool,
    // non-continuous monitors
    pub catalyst: bool,
    pub heated_catalyst: bool,
    pub evap_system: bool,
    pub secondary_air: bool,
    pub ac_refrigerant: bool,
    pub oxygen_sensor: bool,
    pub oxygen_sensor_heater: bool,
    pub egr_system: bool,
}

impl Readiness {
    /// Number of monitors not yet complete
    pub fn incomplete_count(&self) -> usize {
        [
            self.misfire,
            self.fuel_system,
            self.components,
            self.catalyst,
            self.heated_catalyst,
            self.evap_system,
            self.secondary_air,
            self.ac_refrigerant,
            self.oxygen_sensor,
            self.oxygen_sensor_heater,
            self.egr_system,
        ]
        .iter()
        .filter(|ready| !**ready)
        .count()
    }
}

fn ready(byte: u8, mask: u8) -> bool {
    (byte & mask) == 0
}

/// Decode readiness from status bytes B, C and (optionally) D.
///
/// Spark engines carry the non-continuous monitors in C; compression
/// ignition engines use D with a different layout, and have no secondary
/// air or O2 heater monitors (reported ready).
pub fn decode_readiness(b: u8, c: u8, d: Option<u8>) -> Readiness {
    let engine = if b & 0x08 == 0 {
        EngineKind::Spark
    } else {
        EngineKind::Compression
    };

    let misfire = ready(b, 0x01);
    let fuel_system = ready(b, 0x02);
    let components = ready(b, 0x04);

    match engine {
        EngineKind::Spark => Readiness {
            engine,
            misfire,
            fuel_system,
            components,
            catalyst: ready(c, 0x01),
            heated_catalyst: ready(c, 0x02),
            evap_system: ready(c, 0x04),
            secondary_air: ready(c, 0x08),
            ac_refrigerant: ready(c, 0x10),
            oxygen_sensor: ready(c, 0x20),
            oxygen_sensor_heater: ready(c, 0x40),
            egr_system: ready(c, 0x80),
        },
        EngineKind::Compression => {
            let d = d.unwrap_or(c);
            Readiness {
                engine,
                misfire,
                fuel_system,
                components,
                catalyst: ready(d, 0x01),
                heated_catalyst: ready(d, 0x02),
                evap_system: ready(d, 0x04),
                secondary_air: true,
                ac_refrigerant: ready(d, 0x08),
                oxygen_sensor: ready(d, 0x10),
                oxygen_sensor_heater: true,
                egr_system: ready(d, 0x20),
            }
        }
    }
}
