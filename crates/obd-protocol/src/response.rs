//! Interpretation of sanitised ELM327 reply frames
//!
//! Frames arrive with line breaks already folded into single spaces. The
//! helpers here tolerate spaces on or off and CAN headers on.

use crate::dtc::{dedup_dtcs, Dtc, DtcStatus};
use crate::error::ObdError;
use crate::readiness::{decode_readiness, Readiness};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Replies an adapter sends instead of data
const NEGATIVE_REPLIES: &[&str] = &[
    "NO DATA",
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUS INIT",
    "BUS BUSY",
    "BUS ERROR",
    "FB ERROR",
    "DATA ERROR",
    "BUFFER FULL",
    "STOPPED",
    "ERROR",
];

const CODES_PER_LINE: usize = 3;

/// Reject frames that carry an adapter-level negative reply
pub fn check_adapter_reply(frame: &str) -> Result<(), ObdError> {
    let trimmed = frame.trim();
    if trimmed.is_empty() {
        return Err(ObdError::InvalidResponse("empty reply".to_string()));
    }
    if trimmed == "?" {
        return Err(ObdError::AdapterReply("?".to_string()));
    }
    let upper = trimmed.to_ascii_uppercase();
    if let Some(reply) = NEGATIVE_REPLIES.iter().find(|reply| upper.contains(*reply)) {
        return Err(ObdError::AdapterReply((*reply).to_string()));
    }
    Ok(())
}

/// Tokens made only of hex digits; drops chatter like `SEARCHING...`
fn hex_tokens(frame: &str) -> Vec<&str> {
    frame
        .split_whitespace()
        .filter(|token| token.chars().all(|c| c.is_ascii_hexdigit()))
        .collect()
}

/// Uppercase hex with every byte starting at an even offset. An odd-length
/// token opens with a three-digit CAN identifier, which is dropped.
fn byte_aligned_hex(frame: &str) -> String {
    hex_tokens(frame)
        .into_iter()
        .map(|token| if token.len() % 2 == 1 { token.get(3..).unwrap_or("") } else { token })
        .collect::<String>()
        .to_ascii_uppercase()
}

fn hex_pairs(hex: &str) -> Vec<u8> {
    hex.as_bytes()
        .chunks_exact(2)
        .filter_map(|pair| std::str::from_utf8(pair).ok())
        .filter_map(|pair| u8::from_str_radix(pair, 16).ok())
        .collect()
}

/// Parse a Mode 03 (stored) or Mode 07 (pending) reply into trouble codes.
///
/// Each marker byte is followed by up to three two-byte codes; all-zero
/// pairs are padding. `NO DATA` is read as "no codes stored".
pub fn parse_dtc_response(frame: &str, status: DtcStatus) -> Result<Vec<Dtc>, ObdError> {
    match check_adapter_reply(frame) {
        Err(ObdError::AdapterReply(reply)) if reply == "NO DATA" => return Ok(Vec::new()),
        other => other?,
    }

    let compact = byte_aligned_hex(frame);
    let marker = status.response_marker();

    let mut codes = Vec::new();
    let mut found = false;
    let mut cursor = 0;
    while cursor + 6 <= compact.len() {
        if &compact[cursor..cursor + 2] != marker {
            cursor += 2;
            continue;
        }
        found = true;
        cursor += 2;
        // each reply line carries up to three code pairs
        for _ in 0..CODES_PER_LINE {
            if cursor + 4 > compact.len() {
                break;
            }
            if let [a, b] = hex_pairs(&compact[cursor..cursor + 4])[..] {
                if a != 0 || b != 0 {
                    codes.push(Dtc::from_bytes(a, b, status));
                }
            }
            cursor += 4;
        }
    }
    if !found {
        return Err(ObdError::InvalidResponse(format!(
            "no {} marker in {:?}",
            marker, frame
        )));
    }

    debug!("Parsed {} trouble codes from {:?}", codes.len(), frame);
    Ok(dedup_dtcs(codes))
}

/// Extract the data bytes following `41 <pid>` in a Mode 01 reply
pub fn extract_mode01_payload(frame: &str, pid: u8) -> Result<Vec<u8>, ObdError> {
    check_adapter_reply(frame)?;

    let tokens = hex_tokens(frame);
    let pid_hex = format!("{:02X}", pid);

    // Spaces on: search byte-aligned tokens
    if tokens.iter().all(|token| token.len() == 2) {
        let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
        return upper
            .windows(2)
            .position(|window| window[0] == "41" && window[1] == pid_hex)
            .map(|idx| upper[idx + 2..].concat())
            .map(|rest| hex_pairs(&rest))
            .ok_or(ObdError::PidNotInResponse(pid));
    }

    let compact = tokens.concat().to_ascii_uppercase();
    let needle = format!("41{}", pid_hex);
    compact
        .find(&needle)
        .map(|idx| hex_pairs(&compact[idx + needle.len()..]))
        .ok_or(ObdError::PidNotInResponse(pid))
}

/// Result of a Mode 01 PID 01 read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObdStatus {
    /// Malfunction indicator lamp lit
    pub mil: bool,
    /// Number of stored trouble codes
    pub dtc_count: u8,
    pub readiness: Readiness,
}

/// Parse the monitor status reply (`41 01 A B C D`)
pub fn parse_status(frame: &str) -> Result<ObdStatus, ObdError> {
    let payload = extract_mode01_payload(frame, 0x01)?;
    if payload.len() < 3 {
        return Err(ObdError::ShortPayload {
            pid: 0x01,
            expected: 4,
            actual: payload.len(),
        });
    }

    Ok(ObdStatus {
        mil: payload[0] & 0x80 != 0,
        dtc_count: payload[0] & 0x7F,
        readiness: decode_readiness(payload[1], payload[2], payload.get(3).copied()),
    })
}

/// A clear request is accepted when the reply carries `44` or `OK`
pub fn is_clear_acknowledged(frame: &str) -> bool {
    let upper = frame.to_ascii_uppercase();
    upper.contains("44") || upper.contains("OK")
}

/// Parse an `ATRV` reply such as `12.6V`
pub fn parse_voltage(frame: &str) -> Result<f64, ObdError> {
    let trimmed = frame.trim().trim_end_matches(['V', 'v']).trim();
    trimmed
        .parse::<f64>()
        .map_err(|_| ObdError::InvalidResponse(format!("voltage {:?}", frame)))
}

/// Parse a Mode 09 PID 02 reply into a 17-character VIN
pub fn parse_vin(frame: &str) -> Result<String, ObdError> {
    check_adapter_reply(frame)?;

    // keep byte tokens only, skipping CAN length headers and `0:` line tags
    let bytes: Vec<u8> = frame
        .split_whitespace()
        .filter(|token| token.len() == 2)
        .filter_map(|token| u8::from_str_radix(token, 16).ok())
        .collect();

    let mut vin = String::new();
    let mut idx = 0;
    while idx < bytes.len() {
        // `49 02 NN` restarts on every line; VINs never contain 'I'
        if bytes[idx] == 0x49 && bytes.get(idx + 1) == Some(&0x02) {
            idx += 3;
            continue;
        }
        let c = bytes[idx] as char;
        if c.is_ascii_alphanumeric() {
            vin.push(c);
        }
        idx += 1;
    }

    if vin.len() < 17 {
        return Err(ObdError::InvalidResponse(format!("VIN too short: {:?}", vin)));
    }
    Ok(vin[vin.len() - 17..].to_string())
}
