//! Session insights over the in-memory timeline

use chrono::{DateTime, Utc};
use diagnostics_timeline::{
    connection_summary, rank_reasons, ConnectionSummary, FailureReason, FailureRecord,
    OperationKind, Outcome, ReliabilitySummary, TimelineEvent,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Recent failures listed, newest first
const RECENT_FAILURES: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInsight {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub average_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInsight {
    pub total: u64,
    pub by_operation: BTreeMap<OperationKind, u64>,
    pub by_error: Vec<FailureReason>,
    pub recent: Vec<FailureRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInsights {
    pub generated_at: DateTime<Utc>,
    pub window_ms: Option<u64>,
    pub operations: BTreeMap<OperationKind, OperationInsight>,
    pub failures: FailureInsight,
    pub reliability: ReliabilitySummary,
    pub connection: ConnectionSummary,
}

pub(crate) fn build_insights(
    timeline: &[TimelineEvent],
    history: &[TimelineEvent],
    window: Option<Duration>,
    now: DateTime<Utc>,
) -> SessionInsights {
    let since = window
        .and_then(|w| chrono::Duration::from_std(w).ok())
        .map(|w| now - w);
    let in_window: Vec<TimelineEvent> = timeline
        .iter()
        .filter(|event| since.map_or(true, |since| event.at >= since))
        .cloned()
        .collect();

    let mut operations: BTreeMap<OperationKind, OperationInsight> = OperationKind::ALL
        .into_iter()
        .map(|kind| (kind, OperationInsight::default()))
        .collect();
    let mut durations: HashMap<OperationKind, (u64, u64)> = HashMap::new();
    let mut by_operation: BTreeMap<OperationKind, u64> =
        OperationKind::ALL.into_iter().map(|kind| (kind, 0)).collect();
    let mut reasons = HashMap::new();
    let mut failures = Vec::new();

    for event in &in_window {
        let Some(op) = event.operation() else {
            continue;
        };
        let entry = operations.entry(op.operation).or_default();
        entry.total += 1;
        match op.outcome {
            Outcome::Success => {
                entry.success += 1;
                let (sum, count) = durations.entry(op.operation).or_default();
                *sum += op.duration_ms;
                *count += 1;
            }
            Outcome::Failure => {
                entry.failure += 1;
                *by_operation.entry(op.operation).or_default() += 1;
                let reason = op.error.clone().unwrap_or_else(|| "unknown_failure".to_string());
                *reasons.entry(reason).or_insert(0) += 1;
                failures.push(FailureRecord {
                    id: event.id.clone(),
                    at: event.at,
                    operation: op.operation,
                    error: op.error.clone(),
                    attempt: op.attempt,
                    attempts_allowed: op.attempts_allowed,
                });
            }
        }
    }

    for (kind, entry) in operations.iter_mut() {
        if entry.total > 0 {
            entry.success_rate = entry.success as f64 / entry.total as f64;
            entry.failure_rate = entry.failure as f64 / entry.total as f64;
        }
        entry.average_duration_ms = durations
            .get(kind)
            .filter(|(_, count)| *count > 0)
            .map(|(sum, count)| (*sum as f64 / *count as f64).round() as u64);
    }

    let total = failures.len() as u64;
    let recent: Vec<FailureRecord> = failures.into_iter().rev().take(RECENT_FAILURES).collect();

    SessionInsights {
        generated_at: now,
        window_ms: window.map(|w| w.as_millis() as u64),
        operations,
        failures: FailureInsight {
            total,
            by_operation,
            by_error: rank_reasons(reasons),
            recent,
        },
        reliability: ReliabilitySummary::from_events(&in_window),
        connection: connection_summary(history, since, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use diagnostics_timeline::{
        DiagnosticState, EventKind, OperationEvent, StateChangeEvent,
    };

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn op(ms: i64, operation: OperationKind, error: Option<&str>) -> TimelineEvent {
        TimelineEvent {
            id: format!("evt-{}", ms),
            at: at(ms),
            kind: EventKind::Operation(OperationEvent {
                operation,
                outcome: if error.is_some() { Outcome::Failure } else { Outcome::Success },
                attempt: 1,
                attempts_allowed: 3,
                duration_ms: 300,
                error: error.map(str::to_string),
            }),
        }
    }

    fn change(ms: i64, previous: DiagnosticState, state: DiagnosticState) -> TimelineEvent {
        TimelineEvent {
            id: format!("evt-{}-s", ms),
            at: at(ms),
            kind: EventKind::StateChange(StateChangeEvent {
                state,
                previous_state: previous,
                reason: None,
            }),
        }
    }

    #[test]
    fn test_insights_window() {
        let timeline = vec![
            op(0, OperationKind::ReadDtc, Some("old failure")),
            op(60_000, OperationKind::ReadDtc, Some("timeout")),
            op(61_000, OperationKind::ReadDtc, None),
            op(62_000, OperationKind::Status, Some("NO DATA")),
            op(63_000, OperationKind::Status, Some("timeout")),
        ];
        let history = vec![
            change(0, DiagnosticState::Disconnected, DiagnosticState::Ready),
            change(62_000, DiagnosticState::Reading, DiagnosticState::Error),
        ];

        let insights = build_insights(&timeline, &history, Some(Duration::from_secs(10)), at(70_000));

        let read = &insights.operations[&OperationKind::ReadDtc];
        assert_eq!(read.total, 2);
        assert_eq!(read.success_rate, 0.5);
        assert_eq!(read.average_duration_ms, Some(300));

        assert_eq!(insights.failures.total, 3);
        assert_eq!(insights.failures.by_error[0].error, "timeout");
        assert_eq!(insights.failures.by_error[0].count, 2);
        assert_eq!(insights.failures.recent[0].id, "evt-63000");
        assert_eq!(insights.reliability.current_failure_streak, 2);
        assert_eq!(insights.reliability.mean_time_to_recovery_ms, Some(1000));

        // 2s ready then 8s error in the 10s window
        assert_eq!(insights.connection.uptime_ratio, Some(0.2));
        assert_eq!(insights.window_ms, Some(10_000));
    }
}
