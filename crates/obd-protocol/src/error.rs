//! OBD-II Error Types

use thiserror::Error;

/// Errors raised while interpreting adapter replies
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObdError {
    /// Adapter answered with a negative reply such as `NO DATA` or `?`
    #[error("Adapter reported: {0}")]
    AdapterReply(String),

    /// Reply could not be parsed
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Reply for a known PID carried fewer bytes than its formula needs
    #[error("PID {pid:02X} expects {expected} data bytes, got {actual}")]
    ShortPayload {
        pid: u8,
        expected: usize,
        actual: usize,
    },

    /// The reply did not contain the requested PID at all
    #[error("PID {0:02X} not present in response")]
    PidNotInResponse(u8),

    /// Malformed trouble code string
    #[error("Invalid trouble code: {0}")]
    InvalidDtc(String),

    /// Protocol number reported by the adapter is not recognised
    #[error("Protocol not supported: {0}")]
    UnsupportedProtocol(String),
}
