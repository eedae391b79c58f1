//! Diagnostic Trouble Codes
//!
//! Bit-level decoding of Mode 03 code pairs, normalisation of code strings,
//! a small description table and a severity classifier.

use crate::error::ObdError;
use serde::{Deserialize, Serialize};

/// System group encoded in the top two bits of the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
}

impl DtcCategory {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    fn bits(&self) -> u8 {
        match self {
            DtcCategory::Powertrain => 0,
            DtcCategory::Chassis => 1,
            DtcCategory::Body => 2,
            DtcCategory::Network => 3,
        }
    }

    /// Code letter (`P`, `C`, `B`, `U`)
    pub fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'P' => Some(DtcCategory::Powertrain),
            'C' => Some(DtcCategory::Chassis),
            'B' => Some(DtcCategory::Body),
            'U' => Some(DtcCategory::Network),
            _ => None,
        }
    }
}

/// How urgently a code should be surfaced to the customer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcSeverity {
    Info,
    Warning,
    Critical,
}

/// Where the code was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcStatus {
    /// Stored code (Mode 03)
    Current,
    /// Pending code (Mode 07)
    Pending,
}

impl DtcStatus {
    /// Positive-response marker introducing each code in the reply
    pub fn response_marker(&self) -> &'static str {
        match self {
            DtcStatus::Current => "43",
            DtcStatus::Pending => "47",
        }
    }
}

/// A trouble code with its description and severity
///
/// Two codes are equal iff their normalised code strings match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dtc {
    pub code: String,
    pub description: Option<String>,
    pub severity: DtcSeverity,
    pub status: DtcStatus,
}

impl Dtc {
    pub fn new(code: &str, status: DtcStatus) -> Self {
        let code = normalize_dtc(code);
        Self {
            description: Some(describe_dtc(&code)),
            severity: severity_for(&code),
            code,
            status,
        }
    }

    /// Decode a raw byte pair
    pub fn from_bytes(a: u8, b: u8, status: DtcStatus) -> Self {
        Self::new(&decode_dtc(a, b), status)
    }
}

impl PartialEq for Dtc {
    fn eq(&self, other: &Self) -> bool {
        normalize_dtc(&self.code) == normalize_dtc(&other.code)
    }
}

impl Eq for Dtc {}

/// Decode a code pair: prefix from the top two bits of `a`, the remaining
/// 14 bits as four hex digits
pub fn decode_dtc(a: u8, b: u8) -> String {
    let category = DtcCategory::from_bits(a >> 6);
    let digits = (((a & 0x3F) as u16) << 8) | b as u16;
    format!("{}{:04X}", category.letter(), digits)
}

/// Encode a code string back into its byte pair
pub fn encode_dtc(code: &str) -> Result<(u8, u8), ObdError> {
    let normalized = normalize_dtc(code);
    let mut chars = normalized.chars();
    let category = chars
        .next()
        .and_then(DtcCategory::from_letter)
        .ok_or_else(|| ObdError::InvalidDtc(code.to_string()))?;
    let digits = chars.as_str();
    if digits.len() != 4 {
        return Err(ObdError::InvalidDtc(code.to_string()));
    }
    let value =
        u16::from_str_radix(digits, 16).map_err(|_| ObdError::InvalidDtc(code.to_string()))?;
    if value > 0x3FFF {
        return Err(ObdError::InvalidDtc(code.to_string()));
    }
    Ok(((category.bits() << 6) | (value >> 8) as u8, (value & 0xFF) as u8))
}

/// Normalise a code string: drop all whitespace, uppercase, and left-pad a
/// three-digit code to four digits (`p 133` becomes `P0133`)
pub fn normalize_dtc(code: &str) -> String {
    let compact: String = code
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect();

    let bytes = compact.as_bytes();
    let short_form = bytes.len() == 4
        && matches!(bytes[0], b'P' | b'B' | b'C' | b'U')
        && bytes[1..].iter().all(u8::is_ascii_digit);
    if short_form {
        format!("{}0{}", &compact[..1], &compact[1..])
    } else {
        compact
    }
}

/// Remove duplicate codes, keeping the first occurrence
pub fn dedup_dtcs(codes: Vec<Dtc>) -> Vec<Dtc> {
    let mut unique: Vec<Dtc> = Vec::with_capacity(codes.len());
    for dtc in codes {
        if !unique.contains(&dtc) {
            unique.push(dtc);
        }
    }
    unique
}

const DESCRIPTIONS: &[(&str, &str)] = &[
    ("P0100", "Mass air flow circuit malfunction"),
    ("P0101", "Mass air flow circuit range/performance"),
    ("P0102", "Mass air flow circuit low input"),
    ("P0103", "Mass air flow circuit high input"),
    ("P0106", "Manifold absolute pressure range/performance"),
    ("P0110", "Intake air temperature circuit malfunction"),
    ("P0113", "Intake air temperature circuit high input"),
    ("P0115", "Engine coolant temperature circuit malfunction"),
    ("P0117", "Engine coolant temperature circuit low input"),
    ("P0118", "Engine coolant temperature circuit high input"),
    ("P0120", "Throttle position sensor circuit malfunction"),
    ("P0121", "Throttle position sensor range/performance"),
    ("P0125", "Insufficient coolant temperature for closed loop fuel control"),
    ("P0128", "Coolant temperature below thermostat regulating temperature"),
    ("P0130", "O2 sensor circuit malfunction (bank 1, sensor 1)"),
    ("P0131", "O2 sensor circuit low voltage (bank 1, sensor 1)"),
    ("P0132", "O2 sensor circuit high voltage (bank 1, sensor 1)"),
    ("P0133", "O2 sensor circuit slow response (bank 1, sensor 1)"),
    ("P0134", "O2 sensor circuit no activity detected (bank 1, sensor 1)"),
    ("P0135", "O2 sensor heater circuit malfunction (bank 1, sensor 1)"),
    ("P0136", "O2 sensor circuit malfunction (bank 1, sensor 2)"),
    ("P0141", "O2 sensor heater circuit malfunction (bank 1, sensor 2)"),
    ("P0150", "O2 sensor circuit malfunction (bank 2, sensor 1)"),
    ("P0155", "O2 sensor heater circuit malfunction (bank 2, sensor 1)"),
    ("P0171", "System too lean (bank 1)"),
    ("P0172", "System too rich (bank 1)"),
    ("P0174", "System too lean (bank 2)"),
    ("P0175", "System too rich (bank 2)"),
    ("P0200", "Injector circuit malfunction"),
    ("P0201", "Injector circuit malfunction, cylinder 1"),
    ("P0202", "Injector circuit malfunction, cylinder 2"),
    ("P0203", "Injector circuit malfunction, cylinder 3"),
    ("P0204", "Injector circuit malfunction, cylinder 4"),
    ("P0300", "Random/multiple cylinder misfire detected"),
    ("P0301", "Cylinder 1 misfire detected"),
    ("P0302", "Cylinder 2 misfire detected"),
    ("P0303", "Cylinder 3 misfire detected"),
    ("P0304", "Cylinder 4 misfire detected"),
    ("P0305", "Cylinder 5 misfire detected"),
    ("P0306", "Cylinder 6 misfire detected"),
    ("P0400", "Exhaust gas recirculation flow malfunction"),
    ("P0401", "Exhaust gas recirculation flow insufficient"),
    ("P0402", "Exhaust gas recirculation flow excessive"),
    ("P0420", "Catalyst system efficiency below threshold (bank 1)"),
    ("P0430", "Catalyst system efficiency below threshold (bank 2)"),
    ("P0440", "Evaporative emission system malfunction"),
    ("P0442", "Evaporative emission system small leak detected"),
    ("P0446", "Evaporative emission vent control circuit malfunction"),
    ("P0455", "Evaporative emission system large leak detected"),
    ("P0456", "Evaporative emission system very small leak detected"),
    ("P0500", "Vehicle speed sensor malfunction"),
    ("P0505", "Idle air control system malfunction"),
    ("P0506", "Idle speed lower than expected"),
    ("P0507", "Idle speed higher than expected"),
    ("P0600", "Serial communication link malfunction"),
    ("P0601", "Control module memory checksum error"),
    ("P0603", "Control module keep-alive memory error"),
    ("P0606", "Control module processor fault"),
    ("P0700", "Transmission control system malfunction"),
    ("P0705", "Transmission range sensor circuit malfunction"),
    ("P0715", "Input/turbine speed sensor circuit malfunction"),
    ("P0720", "Output speed sensor circuit malfunction"),
    ("P0730", "Incorrect gear ratio"),
    ("P0740", "Torque converter clutch circuit malfunction"),
    ("P0750", "Shift solenoid A malfunction"),
    ("B0001", "Driver frontal stage 1 deployment control"),
    ("C0035", "Left front wheel speed sensor circuit"),
    ("C0040", "Right front wheel speed sensor circuit"),
    ("U0001", "High speed CAN communication bus"),
    ("U0100", "Lost communication with ECM/PCM"),
    ("U0101", "Lost communication with TCM"),
    ("U0102", "Lost communication with transfer case control module"),
    ("U0121", "Lost communication with ABS control module"),
];

/// Human-readable description; unknown codes fall back to their category
pub fn describe_dtc(code: &str) -> String {
    let normalized = normalize_dtc(code);
    if let Some((_, text)) = DESCRIPTIONS.iter().find(|(known, _)| *known == normalized) {
        return (*text).to_string();
    }

    let category = normalized
        .chars()
        .next()
        .and_then(DtcCategory::from_letter)
        .unwrap_or(DtcCategory::Powertrain);
    let family = match category {
        DtcCategory::Powertrain => "powertrain",
        DtcCategory::Chassis => "chassis",
        DtcCategory::Body => "body",
        DtcCategory::Network => "network",
    };
    format!("Generic {} code", family)
}

/// Classify a code by its fault family
pub fn severity_for(code: &str) -> DtcSeverity {
    let normalized = normalize_dtc(code);
    let (letter, digits) = match (normalized.get(..1), normalized.get(1..)) {
        (Some(letter), Some(digits)) => (letter, digits),
        _ => return DtcSeverity::Info,
    };
    let number = match digits.parse::<u16>() {
        Ok(n) if digits.len() == 4 => n,
        _ => return DtcSeverity::Info,
    };

    match (letter, number) {
        ("P", 300..=399) | ("P", 600..=619) => DtcSeverity::Critical,
        ("U", 100 | 101 | 102 | 121) => DtcSeverity::Critical,
        ("P", 420 | 430 | 171 | 172 | 174 | 175) => DtcSeverity::Warning,
        ("P", 130..=169) | ("P", 200..=208) | ("P", 700..=799) => DtcSeverity::Warning,
        _ => DtcSeverity::Info,
    }
}
