//! Reliability Metrics
//!
//! MTBF, MTTR, failure streaks and connection-state occupancy, all computed
//! over a slice of timeline events ordered oldest first.

use crate::event::{DiagnosticState, TimelineEvent};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Mean gap between consecutive failures; needs at least two
pub fn mean_time_between_failures(events: &[TimelineEvent]) -> Option<u64> {
    let failures: Vec<i64> = events
        .iter()
        .filter(|event| event.is_failure())
        .map(|event| event.at.timestamp_millis())
        .collect();
    if failures.len() < 2 {
        return None;
    }

    let total: i64 = failures
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).max(0))
        .sum();
    Some((total as f64 / (failures.len() - 1) as f64).round() as u64)
}

/// Mean time from each failure to the first strictly later success
pub fn mean_time_to_recovery(events: &[TimelineEvent]) -> Option<u64> {
    let mut total = 0i64;
    let mut count = 0u32;

    for (index, failure) in events.iter().enumerate() {
        if !failure.is_failure() {
            continue;
        }
        let recovered = events[index + 1..]
            .iter()
            .find(|candidate| candidate.is_success() && candidate.at > failure.at);
        if let Some(success) = recovered {
            total += (success.at - failure.at).num_milliseconds();
            count += 1;
        }
    }

    (count > 0).then(|| (total as f64 / count as f64).round() as u64)
}

/// Failures since the most recent success
pub fn current_failure_streak(events: &[TimelineEvent]) -> u32 {
    let mut streak = 0;
    for event in events.iter().rev() {
        match event.operation() {
            Some(_) if event.is_failure() => streak += 1,
            Some(_) => break,
            None => continue,
        }
    }
    streak
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilitySummary {
    pub mean_time_between_failures_ms: Option<u64>,
    pub mean_time_to_recovery_ms: Option<u64>,
    pub current_failure_streak: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl ReliabilitySummary {
    pub fn from_events(events: &[TimelineEvent]) -> Self {
        Self {
            mean_time_between_failures_ms: mean_time_between_failures(events),
            mean_time_to_recovery_ms: mean_time_to_recovery(events),
            current_failure_streak: current_failure_streak(events),
            last_failure_at: events
                .iter()
                .rev()
                .find(|event| event.is_failure())
                .map(|event| event.at),
        }
    }
}

/// Time spent continuously in one state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSegment {
    pub state: DiagnosticState,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub transitions: u32,
    pub totals_by_state: BTreeMap<DiagnosticState, u64>,
    /// `ready` time over total observed time
    pub uptime_ratio: Option<f64>,
    pub segments: Vec<ConnectionSegment>,
}

impl ConnectionSummary {
    fn empty() -> Self {
        Self {
            transitions: 0,
            totals_by_state: DiagnosticState::ALL.into_iter().map(|s| (s, 0)).collect(),
            uptime_ratio: None,
            segments: Vec::new(),
        }
    }

    fn push(&mut self, state: DiagnosticState, from: DateTime<Utc>, to: DateTime<Utc>) {
        if to <= from {
            return;
        }
        let duration_ms = (to - from).num_milliseconds() as u64;
        *self.totals_by_state.entry(state).or_default() += duration_ms;
        self.segments.push(ConnectionSegment {
            state,
            since: from,
            until: to,
            duration_ms,
        });
    }
}

/// Rebuild state occupancy from state-change events.
///
/// The session is assumed `disconnected` before the first change. Changes
/// before `since` only seed the starting state; the last segment runs up to
/// `until`.
pub fn connection_summary(
    events: &[TimelineEvent],
    since: Option<DateTime<Utc>>,
    until: DateTime<Utc>,
) -> ConnectionSummary {
    let mut summary = ConnectionSummary::empty();
    let mut state = DiagnosticState::Disconnected;
    let mut cursor = since
        .or_else(|| events.first().map(|event| event.at))
        .unwrap_or(until);

    for event in events {
        let Some(change) = event.state_change() else {
            continue;
        };
        if event.at > until {
            break;
        }
        if since.is_some_and(|since| event.at < since) {
            state = change.state;
            continue;
        }

        summary.push(state, cursor, event.at);
        if change.previous_state != change.state {
            summary.transitions += 1;
        }
        state = change.state;
        cursor = event.at;
    }
    summary.push(state, cursor, until);

    if summary.segments.is_empty() {
        let start = since.unwrap_or(until).min(until);
        summary.segments.push(ConnectionSegment {
            state,
            since: start,
            until,
            duration_ms: (until - start).num_milliseconds().max(0) as u64,
        });
        *summary.totals_by_state.entry(state).or_default() +=
            (until - start).num_milliseconds().max(0) as u64;
    }

    let total: u64 = summary.totals_by_state.values().sum();
    if total > 0 {
        let ready = summary
            .totals_by_state
            .get(&DiagnosticState::Ready)
            .copied()
            .unwrap_or(0);
        summary.uptime_ratio = Some(ready as f64 / total as f64);
    }
    summary
}
