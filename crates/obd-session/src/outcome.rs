//! Explicit failure flags on operation results

use obd_protocol::{Dtc, HybridData, LiveData, ObdStatus};

/// A task result that can carry a failure without being an `Err`.
///
/// The session treats `Some(message)` exactly like a returned error: the
/// attempt counts as failed and is retried.
pub trait OperationOutcome {
    fn failure(&self) -> Option<String> {
        None
    }
}

impl OperationOutcome for () {}
impl OperationOutcome for Vec<Dtc> {}
impl OperationOutcome for ObdStatus {}
impl OperationOutcome for HybridData {}
impl OperationOutcome for String {}

impl OperationOutcome for LiveData {
    fn failure(&self) -> Option<String> {
        self.is_empty()
            .then(|| "vehicle returned no live data".to_string())
    }
}

/// `clear_dtc` acknowledgement
impl OperationOutcome for bool {
    fn failure(&self) -> Option<String> {
        (!*self).then(|| "request not acknowledged".to_string())
    }
}
