//! OBD-II Protocol Codec
//!
//! Pure, stateless decoding of ELM327-class adapter replies: Mode 01 PID
//! formulas (standard and hybrid vendor tables), Mode 03 trouble codes,
//! readiness monitors and the assorted AT-command replies used during a
//! diagnostic session. Nothing in this crate performs I/O.

mod dtc;
mod error;
mod hybrid;
mod pid;
mod protocol;
mod readiness;
mod response;

pub use dtc::{
    decode_dtc, dedup_dtcs, describe_dtc, encode_dtc, normalize_dtc, severity_for, Dtc,
    DtcCategory, DtcSeverity, DtcStatus,
};
pub use error::ObdError;
pub use hybrid::{HybridData, HybridPid};
pub use pid::{lookup_pid, Formula, LiveData, Pid, PidResponse, PidSpec, STANDARD_PIDS};
pub use protocol::ObdProtocol;
pub use readiness::{decode_readiness, EngineKind, Readiness};
pub use response::{
    check_adapter_reply, extract_mode01_payload, is_clear_acknowledged, parse_dtc_response,
    parse_status, parse_vin, parse_voltage, ObdStatus,
};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;

    /// Positive response marker for a request in `mode`
    pub const fn positive_response(mode: u8) -> u8 {
        mode + 0x40
    }
}
