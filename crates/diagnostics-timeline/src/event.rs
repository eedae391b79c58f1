//! Session states and timeline events

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Diagnostic session state
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Reading,
    Clearing,
    Error,
}

impl DiagnosticState {
    pub const ALL: [DiagnosticState; 7] = [
        DiagnosticState::Disconnected,
        DiagnosticState::Connecting,
        DiagnosticState::Authenticating,
        DiagnosticState::Ready,
        DiagnosticState::Reading,
        DiagnosticState::Clearing,
        DiagnosticState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticState::Disconnected => "disconnected",
            DiagnosticState::Connecting => "connecting",
            DiagnosticState::Authenticating => "authenticating",
            DiagnosticState::Ready => "ready",
            DiagnosticState::Reading => "reading",
            DiagnosticState::Clearing => "clearing",
            DiagnosticState::Error => "error",
        }
    }

    /// An operation owns the session
    pub fn is_busy(&self) -> bool {
        matches!(self, DiagnosticState::Reading | DiagnosticState::Clearing)
    }
}

impl fmt::Display for DiagnosticState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named diagnostic operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ReadDtc,
    LiveData,
    Status,
    SelfCheck,
    ClearDtc,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::ReadDtc,
        OperationKind::LiveData,
        OperationKind::Status,
        OperationKind::SelfCheck,
        OperationKind::ClearDtc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ReadDtc => "read_dtc",
            OperationKind::LiveData => "live_data",
            OperationKind::Status => "status",
            OperationKind::SelfCheck => "self_check",
            OperationKind::ClearDtc => "clear_dtc",
        }
    }

    /// State held while the operation runs
    pub fn working_state(&self) -> DiagnosticState {
        match self {
            OperationKind::ClearDtc => DiagnosticState::Clearing,
            _ => DiagnosticState::Reading,
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| format!("unknown operation: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// Result of one operation run (after all of its attempts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationEvent {
    pub operation: OperationKind,
    pub outcome: Outcome,
    pub attempt: u32,
    pub attempts_allowed: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeEvent {
    pub state: DiagnosticState,
    pub previous_state: DiagnosticState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Operation(OperationEvent),
    StateChange(StateChangeEvent),
}

/// Immutable timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TimelineEvent {
    pub fn operation(&self) -> Option<&OperationEvent> {
        match &self.kind {
            EventKind::Operation(event) => Some(event),
            EventKind::StateChange(_) => None,
        }
    }

    pub fn state_change(&self) -> Option<&StateChangeEvent> {
        match &self.kind {
            EventKind::StateChange(event) => Some(event),
            EventKind::Operation(_) => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.operation()
            .is_some_and(|op| op.outcome == Outcome::Failure)
    }

    pub fn is_success(&self) -> bool {
        self.operation()
            .is_some_and(|op| op.outcome == Outcome::Success)
    }

    /// Column value of the `type` discriminator
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            EventKind::Operation(_) => "operation",
            EventKind::StateChange(_) => "state_change",
        }
    }

    /// Storage timestamp, millisecond precision, lexically ordered
    pub fn created_at(&self) -> String {
        format_timestamp(&self.at)
    }
}

/// ISO-8601 with milliseconds and a `Z` suffix
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Issues `evt-<millis>-<seq>` ids and millisecond timestamps
#[derive(Debug, Default)]
pub struct EventIdGenerator {
    seq: u64,
}

impl EventIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self, at: &DateTime<Utc>) -> String {
        self.seq += 1;
        format!("evt-{}-{}", at.timestamp_millis(), self.seq)
    }

    /// Build an event stamped with `at` truncated to milliseconds
    pub fn event(&mut self, at: DateTime<Utc>, kind: EventKind) -> TimelineEvent {
        let at = at.trunc_subsecs(3);
        TimelineEvent {
            id: self.next_id(&at),
            at,
            kind,
        }
    }
}
