//! Session Error Types

use diagnostics_timeline::OperationKind;
use obd_driver::DriverError;
use storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{operation} failed after {attempts} attempt(s): {message}")]
    OperationFailed {
        operation: OperationKind,
        attempts: u32,
        message: String,
    },

    #[error("{requested} rejected: {active} is still running")]
    Busy {
        requested: OperationKind,
        active: OperationKind,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// Last error message of a failed operation
    pub fn message(&self) -> String {
        match self {
            SessionError::OperationFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
