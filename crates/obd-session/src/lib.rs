//! Diagnostic Session
//!
//! Runs named diagnostic operations against an adapter with bounded retry,
//! keeps the session state machine in step with the link, and records every
//! attempt and transition to the timeline and the event store.

mod config;
mod error;
mod insights;
mod manager;
mod outcome;
mod self_check;
mod service;

pub use config::{RetryPolicy, SessionConfig};
pub use error::SessionError;
pub use insights::{FailureInsight, OperationInsight, SessionInsights};
pub use manager::{
    ActiveOperation, DiagnosticSessionManager, LastError, OperationTotals, SessionSnapshot,
};
pub use outcome::OperationOutcome;
pub use self_check::{
    run_self_check, DiagnosticReader, SelfCheckMetrics, SelfCheckReport, SelfCheckStep,
    ValueRange,
};
pub use service::{DiagnosticService, ServiceSnapshot};
