//! Historical Summary
//!
//! Aggregates a window of persisted timeline events into per-operation
//! totals, daily buckets, rolling 7/30 day windows and a trend verdict that
//! compares the two windows.

use crate::event::{OperationEvent, OperationKind, Outcome, TimelineEvent};
use crate::reliability::{connection_summary, ConnectionSummary, ReliabilitySummary};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Daily buckets kept when the caller does not say
pub const DEFAULT_MAX_DAYS: usize = 14;
/// Recent failures listed when the caller does not say
pub const DEFAULT_FAILURE_LIMIT: usize = 20;
/// Failure reasons listed per rolling window
pub const TOP_FAILURE_REASONS: usize = 10;

/// Fewer operations than this in either window gives `insufficient_data`
pub const TREND_MIN_OPERATIONS: u64 = 5;
pub const TREND_SUCCESS_RATE_THRESHOLD: f64 = 0.05;
pub const TREND_FAILURE_RATE_THRESHOLD: f64 = 0.05;
/// Change in average operations per day
pub const TREND_VOLUME_THRESHOLD: f64 = 1.0;

const UNKNOWN_FAILURE: &str = "unknown_failure";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryOptions {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub max_days: Option<usize>,
    pub failure_limit: Option<usize>,
}

impl SummaryOptions {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..Default::default()
        }
    }

    fn max_days(&self) -> usize {
        match self.max_days {
            Some(days) if days > 0 => days,
            _ => DEFAULT_MAX_DAYS,
        }
    }

    fn failure_limit(&self) -> usize {
        self.failure_limit.unwrap_or(DEFAULT_FAILURE_LIMIT)
    }

    fn contains(&self, at: &DateTime<Utc>) -> bool {
        self.since.map_or(true, |since| *at >= since) && self.until.map_or(true, |until| *at <= until)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeCounts {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
}

impl OutcomeCounts {
    fn add(&mut self, outcome: Outcome) {
        self.total += 1;
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::Failure => self.failure += 1,
        }
    }

    pub fn success_rate(&self) -> f64 {
        ratio(self.success, self.total)
    }

    pub fn failure_rate(&self) -> f64 {
        ratio(self.failure, self.total)
    }

    fn rated(&self) -> RatedCounts {
        RatedCounts {
            total: self.total,
            success: self.success,
            failure: self.failure,
            success_rate: self.success_rate(),
            failure_rate: self.failure_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatedCounts {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetrics {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub average_duration_ms: Option<u64>,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub p95_duration_ms: Option<u64>,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBucket {
    pub date: NaiveDate,
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub by_operation: BTreeMap<OperationKind, OutcomeCounts>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReason {
    pub error: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingWindow {
    pub window_days: u32,
    pub from: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub by_operation: BTreeMap<OperationKind, RatedCounts>,
    pub top_failures: Vec<FailureReason>,
}

impl RollingWindow {
    /// Window of `days` ending at `until`
    pub fn compute(events: &[&TimelineEvent], until: DateTime<Utc>, days: u32) -> Self {
        let from = until - Duration::days(i64::from(days.max(1)));
        let mut overall = OutcomeCounts::default();
        let mut by_operation: BTreeMap<OperationKind, OutcomeCounts> = OperationKind::ALL
            .into_iter()
            .map(|kind| (kind, OutcomeCounts::default()))
            .collect();
        let mut reasons = HashMap::new();

        for (event, op) in operations(events.iter().copied()) {
            if event.at < from || event.at > until {
                continue;
            }
            overall.add(op.outcome);
            by_operation.entry(op.operation).or_default().add(op.outcome);
            if op.outcome == Outcome::Failure {
                *reasons.entry(failure_reason(op)).or_insert(0) += 1;
            }
        }

        let mut top_failures = rank_reasons(reasons);
        top_failures.truncate(TOP_FAILURE_REASONS);

        Self {
            window_days: days,
            from,
            until,
            total: overall.total,
            success: overall.success,
            failure: overall.failure,
            success_rate: overall.success_rate(),
            failure_rate: overall.failure_rate(),
            by_operation: by_operation
                .into_iter()
                .map(|(kind, counts)| (kind, counts.rated()))
                .collect(),
            top_failures,
        }
    }

    /// Average operations per day over the window
    pub fn daily_volume(&self) -> f64 {
        if self.window_days == 0 {
            return 0.0;
        }
        self.total as f64 / f64::from(self.window_days)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendStatus {
    Improving,
    Stable,
    Regressing,
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trend {
    /// Change in average daily volume
    pub total_delta: f64,
    pub success_rate_delta: f64,
    pub failure_rate_delta: f64,
    pub status: TrendStatus,
    pub reason: String,
    /// 0.0 to 1.0
    pub confidence: f64,
}

impl Trend {
    /// Compare the recent window against the baseline
    pub fn compare(current: &RatedCounts, current_days: u32, baseline: &RatedCounts, baseline_days: u32) -> Self {
        let per_day = |total: u64, days: u32| {
            if days == 0 {
                0.0
            } else {
                total as f64 / f64::from(days)
            }
        };
        let total_delta = per_day(current.total, current_days) - per_day(baseline.total, baseline_days);
        let success_rate_delta = current.success_rate - baseline.success_rate;
        let failure_rate_delta = current.failure_rate - baseline.failure_rate;
        let (status, reason, confidence) = classify_trend(
            current.total,
            baseline.total,
            success_rate_delta,
            failure_rate_delta,
            total_delta,
        );
        Self {
            total_delta,
            success_rate_delta,
            failure_rate_delta,
            status,
            reason,
            confidence,
        }
    }

    pub fn between(current: &RollingWindow, baseline: &RollingWindow) -> Self {
        let totals = |window: &RollingWindow| RatedCounts {
            total: window.total,
            success: window.success,
            failure: window.failure,
            success_rate: window.success_rate,
            failure_rate: window.failure_rate,
        };
        Self::compare(&totals(current), current.window_days, &totals(baseline), baseline.window_days)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Classify a trend from window totals and deltas
pub fn classify_trend(
    current_total: u64,
    baseline_total: u64,
    success_rate_delta: f64,
    failure_rate_delta: f64,
    total_delta: f64,
) -> (TrendStatus, String, f64) {
    let event_support =
        clamp_unit((current_total + baseline_total) as f64 / (TREND_MIN_OPERATIONS * 2) as f64);
    let delta_support = clamp_unit(
        (success_rate_delta.abs() / TREND_SUCCESS_RATE_THRESHOLD)
            .max(failure_rate_delta.abs() / TREND_FAILURE_RATE_THRESHOLD)
            .max(total_delta.abs() / TREND_VOLUME_THRESHOLD),
    );
    let blended = round2((event_support + delta_support) / 2.0);

    let fewest = current_total.min(baseline_total);
    if fewest < TREND_MIN_OPERATIONS {
        return (
            TrendStatus::InsufficientData,
            format!(
                "Not enough data: {} operations in the smaller window, at least {} required",
                fewest, TREND_MIN_OPERATIONS
            ),
            round2(event_support / 2.0),
        );
    }

    let improving_by_success = success_rate_delta >= TREND_SUCCESS_RATE_THRESHOLD;
    let improving_by_failures = failure_rate_delta <= -TREND_FAILURE_RATE_THRESHOLD;
    let regressing_by_success = success_rate_delta <= -TREND_SUCCESS_RATE_THRESHOLD;
    let regressing_by_failures = failure_rate_delta >= TREND_FAILURE_RATE_THRESHOLD;
    let improving_by_volume = total_delta >= TREND_VOLUME_THRESHOLD;
    let regressing_by_volume = total_delta <= -TREND_VOLUME_THRESHOLD;

    if (improving_by_success || improving_by_failures) && !regressing_by_volume {
        let reason = if improving_by_success {
            format!("Success rate up {:.1} pp", success_rate_delta * 100.0)
        } else {
            format!("Failure rate down {:.1} pp", failure_rate_delta.abs() * 100.0)
        };
        return (TrendStatus::Improving, reason, blended);
    }

    if regressing_by_failures {
        let reason = format!("Failure rate up {:.1} pp", failure_rate_delta * 100.0);
        return (TrendStatus::Regressing, reason, blended);
    }
    if regressing_by_success {
        let reason = format!("Success rate down {:.1} pp", success_rate_delta.abs() * 100.0);
        return (TrendStatus::Regressing, reason, blended);
    }
    if regressing_by_volume {
        let reason = format!("Daily volume down {:.1} per day", total_delta.abs());
        return (TrendStatus::Regressing, reason, blended);
    }

    if improving_by_volume {
        let reason = format!("Daily volume up {:.1} per day", total_delta);
        return (TrendStatus::Improving, reason, blended);
    }

    (
        TrendStatus::Stable,
        "No significant change".to_string(),
        round2(event_support * 0.75),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendSummary {
    pub overall: Trend,
    pub by_operation: BTreeMap<OperationKind, Trend>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationsSummary {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub average_duration_ms: Option<u64>,
    pub p95_duration_ms: Option<u64>,
    pub by_operation: BTreeMap<OperationKind, OperationMetrics>,
    pub daily: Vec<DailyBucket>,
    pub trends: TrendSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub id: String,
    pub at: DateTime<Utc>,
    pub operation: OperationKind,
    pub error: Option<String>,
    pub attempt: u32,
    pub attempts_allowed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    pub total: u64,
    pub by_operation: BTreeMap<OperationKind, u64>,
    pub by_error: Vec<FailureReason>,
    /// Oldest first
    pub recent: Vec<FailureRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRange {
    pub since: Option<DateTime<Utc>>,
    /// Timestamp of the newest event in the window
    pub until: Option<DateTime<Utc>>,
    pub total_events: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingSummary {
    pub last_7_days: RollingWindow,
    pub last_30_days: RollingWindow,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSummary {
    pub captured_at: DateTime<Utc>,
    pub range: SummaryRange,
    pub operations: OperationsSummary,
    pub failures: FailureSummary,
    pub reliability: ReliabilitySummary,
    pub connection: ConnectionSummary,
    pub rolling: RollingSummary,
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn failure_reason(op: &OperationEvent) -> String {
    op.error
        .clone()
        .filter(|error| !error.is_empty())
        .unwrap_or_else(|| UNKNOWN_FAILURE.to_string())
}

/// Count descending, then error text ascending
pub fn rank_reasons(reasons: HashMap<String, u64>) -> Vec<FailureReason> {
    let mut ranked: Vec<FailureReason> = reasons
        .into_iter()
        .map(|(error, count)| FailureReason { error, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error.cmp(&b.error)));
    ranked
}

/// Nearest-rank percentile: index `ceil(p/100 * n) - 1` of the sorted values
pub fn percentile(values: &[u64], p: f64) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[index])
}

fn average(values: &[u64]) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    let total: u64 = values.iter().sum();
    Some((total as f64 / values.len() as f64).round() as u64)
}

fn operations<'a>(
    events: impl Iterator<Item = &'a TimelineEvent>,
) -> impl Iterator<Item = (&'a TimelineEvent, &'a OperationEvent)> {
    events.filter_map(|event| event.operation().map(|op| (event, op)))
}

#[derive(Default)]
struct DayAccumulator {
    overall: OutcomeCounts,
    by_operation: BTreeMap<OperationKind, OutcomeCounts>,
}

/// Summarize `events` (oldest first) as of `captured_at`
pub fn summarize(
    events: &[TimelineEvent],
    options: &SummaryOptions,
    captured_at: DateTime<Utc>,
) -> DiagnosticsSummary {
    let window: Vec<&TimelineEvent> = events.iter().filter(|e| options.contains(&e.at)).collect();

    let mut counts: BTreeMap<OperationKind, OutcomeCounts> = BTreeMap::new();
    let mut durations: BTreeMap<OperationKind, Vec<u64>> = BTreeMap::new();
    let mut last_event_at: BTreeMap<OperationKind, DateTime<Utc>> = BTreeMap::new();
    let mut days: BTreeMap<NaiveDate, DayAccumulator> = BTreeMap::new();
    let mut failures_by_operation: BTreeMap<OperationKind, u64> =
        OperationKind::ALL.into_iter().map(|kind| (kind, 0)).collect();
    let mut reasons = HashMap::new();
    let mut failed: Vec<FailureRecord> = Vec::new();

    for (event, op) in operations(window.iter().copied()) {
        counts.entry(op.operation).or_default().add(op.outcome);
        durations.entry(op.operation).or_default().push(op.duration_ms);
        last_event_at.insert(op.operation, event.at);

        let day = days.entry(event.at.date_naive()).or_default();
        day.overall.add(op.outcome);
        day.by_operation.entry(op.operation).or_default().add(op.outcome);

        if op.outcome == Outcome::Failure {
            *failures_by_operation.entry(op.operation).or_default() += 1;
            *reasons.entry(failure_reason(op)).or_insert(0) += 1;
            failed.push(FailureRecord {
                id: event.id.clone(),
                at: event.at,
                operation: op.operation,
                error: op.error.clone(),
                attempt: op.attempt,
                attempts_allowed: op.attempts_allowed,
            });
        }
    }

    let by_operation: BTreeMap<OperationKind, OperationMetrics> = OperationKind::ALL
        .into_iter()
        .map(|kind| {
            let count = counts.get(&kind).copied().unwrap_or_default();
            let samples = durations.get(&kind).map(Vec::as_slice).unwrap_or(&[]);
            let metrics = OperationMetrics {
                total: count.total,
                success: count.success,
                failure: count.failure,
                success_rate: count.success_rate(),
                failure_rate: count.failure_rate(),
                average_duration_ms: average(samples),
                min_duration_ms: samples.iter().min().copied(),
                max_duration_ms: samples.iter().max().copied(),
                p95_duration_ms: percentile(samples, 95.0),
                last_event_at: last_event_at.get(&kind).copied(),
            };
            (kind, metrics)
        })
        .collect();

    let mut overall = OutcomeCounts::default();
    for count in counts.values() {
        overall.total += count.total;
        overall.success += count.success;
        overall.failure += count.failure;
    }
    let all_durations: Vec<u64> = durations.values().flatten().copied().collect();

    let daily: Vec<DailyBucket> = days
        .into_iter()
        .rev()
        .take(options.max_days())
        .map(|(date, day)| DailyBucket {
            date,
            total: day.overall.total,
            success: day.overall.success,
            failure: day.overall.failure,
            success_rate: day.overall.success_rate(),
            failure_rate: day.overall.failure_rate(),
            by_operation: OperationKind::ALL
                .into_iter()
                .map(|kind| (kind, day.by_operation.get(&kind).copied().unwrap_or_default()))
                .collect(),
        })
        .collect();

    let last_7_days = RollingWindow::compute(&window, captured_at, 7);
    let last_30_days = RollingWindow::compute(&window, captured_at, 30);
    let trends = TrendSummary {
        overall: Trend::between(&last_7_days, &last_30_days),
        by_operation: OperationKind::ALL
            .into_iter()
            .map(|kind| {
                let current = last_7_days.by_operation.get(&kind).copied().unwrap_or_default();
                let baseline = last_30_days.by_operation.get(&kind).copied().unwrap_or_default();
                (kind, Trend::compare(&current, 7, &baseline, 30))
            })
            .collect(),
    };

    let recent_start = failed.len().saturating_sub(options.failure_limit());
    let recent = failed.split_off(recent_start);

    let owned: Vec<TimelineEvent> = window.iter().map(|event| (*event).clone()).collect();
    // state changes before `since` seed the starting connection state
    let connection_until = options.until.unwrap_or(captured_at);
    let connection_events: Vec<TimelineEvent> = events
        .iter()
        .filter(|e| e.at <= connection_until)
        .filter(|e| options.contains(&e.at) || e.state_change().is_some())
        .cloned()
        .collect();
    let summary = DiagnosticsSummary {
        captured_at,
        range: SummaryRange {
            since: options.since,
            until: window.last().map(|event| event.at),
            total_events: window.len(),
        },
        operations: OperationsSummary {
            total: overall.total,
            success: overall.success,
            failure: overall.failure,
            success_rate: overall.success_rate(),
            failure_rate: overall.failure_rate(),
            average_duration_ms: average(&all_durations),
            p95_duration_ms: percentile(&all_durations, 95.0),
            by_operation,
            daily,
            trends,
        },
        failures: FailureSummary {
            total: overall.failure,
            by_operation: failures_by_operation,
            by_error: rank_reasons(reasons),
            recent,
        },
        reliability: ReliabilitySummary::from_events(&owned),
        connection: connection_summary(&connection_events, options.since, connection_until),
        rolling: RollingSummary {
            last_7_days,
            last_30_days,
        },
    };

    debug!(
        "Summarized {} events ({} operations, trend {:?})",
        summary.range.total_events, summary.operations.total, summary.operations.trends.overall.status
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::fixtures::*;
    use crate::event::DiagnosticState;

    const DAY: i64 = 24 * 60 * 60 * 1000;

    fn capture() -> DateTime<Utc> {
        at(40 * DAY)
    }

    /// Operation `days_ago` days before capture
    fn run(days_ago: i64, offset: i64, outcome: Outcome, error: Option<&str>) -> TimelineEvent {
        op(40 * DAY - days_ago * DAY + offset, OperationKind::ReadDtc, outcome, error)
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<u64> = (1..=20).collect();
        assert_eq!(percentile(&values, 95.0), Some(19));
        assert_eq!(percentile(&[7], 95.0), Some(7));
        assert_eq!(percentile(&[], 95.0), None);
        assert_eq!(percentile(&[30, 10, 20], 50.0), Some(20));
    }

    #[test]
    fn test_trend_improving() {
        // 7 day window: 19/20 succeed; 30 day baseline: 32/40
        let mut events = Vec::new();
        for i in 0..20 {
            let outcome = if i == 0 { Outcome::Failure } else { Outcome::Success };
            events.push(run(3, i, outcome, Some("timeout")));
        }
        for i in 0..20 {
            let outcome = if i < 13 { Outcome::Success } else { Outcome::Failure };
            events.push(run(20, i, outcome, Some("no data")));
        }
        events.sort_by_key(|event| event.at);

        let summary = summarize(&events, &SummaryOptions::default(), capture());
        let rolling = &summary.rolling;
        assert!((rolling.last_7_days.success_rate - 0.95).abs() < 1e-9);
        assert!((rolling.last_30_days.success_rate - 0.80).abs() < 1e-9);

        let trend = &summary.operations.trends.overall;
        assert_eq!(trend.status, TrendStatus::Improving);
        assert_eq!(trend.confidence, 1.0);
        assert_eq!(
            summary.operations.trends.by_operation[&OperationKind::ReadDtc].status,
            TrendStatus::Improving
        );
        assert_eq!(
            summary.operations.trends.by_operation[&OperationKind::Status].status,
            TrendStatus::InsufficientData
        );
    }

    #[test]
    fn test_trend_regressing_on_failures() {
        let mut events = Vec::new();
        for i in 0..10 {
            let outcome = if i < 5 { Outcome::Failure } else { Outcome::Success };
            events.push(run(2, i, outcome, None));
        }
        for i in 0..30 {
            events.push(run(25, i, Outcome::Success, None));
        }
        events.sort_by_key(|event| event.at);

        let summary = summarize(&events, &SummaryOptions::default(), capture());
        let trend = &summary.operations.trends.overall;
        assert_eq!(trend.status, TrendStatus::Regressing);
        assert!(trend.reason.starts_with("Failure rate up"));
        assert_eq!(summary.rolling.last_7_days.top_failures[0].error, "unknown_failure");
    }

    #[test]
    fn test_trend_insufficient_and_stable() {
        let (status, _, confidence) = classify_trend(4, 40, 0.5, -0.5, 0.0);
        assert_eq!(status, TrendStatus::InsufficientData);
        assert_eq!(confidence, 0.5);

        let (status, _, confidence) = classify_trend(10, 40, 0.01, -0.01, 0.2);
        assert_eq!(status, TrendStatus::Stable);
        assert_eq!(confidence, 0.75);

        let (status, _, _) = classify_trend(10, 40, 0.2, -0.2, -1.5);
        assert_eq!(status, TrendStatus::Regressing);
    }

    #[test]
    fn test_daily_buckets_most_recent_first() {
        let events: Vec<TimelineEvent> = (0..5)
            .rev()
            .map(|days_ago| run(days_ago, 0, Outcome::Success, None))
            .collect();
        let options = SummaryOptions {
            max_days: Some(3),
            ..Default::default()
        };
        let summary = summarize(&events, &options, capture());

        assert_eq!(summary.operations.daily.len(), 3);
        assert!(summary.operations.daily[0].date > summary.operations.daily[1].date);
        assert_eq!(summary.operations.daily[0].date, capture().date_naive());
        assert_eq!(
            summary.operations.daily[0].by_operation[&OperationKind::ReadDtc].success,
            1
        );
    }

    #[test]
    fn test_failure_reasons_and_recent() {
        let events = vec![
            fail(0),
            op(10, OperationKind::Status, Outcome::Failure, Some("bus init")),
            op(20, OperationKind::Status, Outcome::Failure, Some("bus init")),
            op(30, OperationKind::LiveData, Outcome::Failure, Some("adapter busy")),
            ok(40),
        ];
        let options = SummaryOptions {
            failure_limit: Some(2),
            ..Default::default()
        };
        let summary = summarize(&events, &options, at(1000));

        let reasons: Vec<(&str, u64)> = summary
            .failures
            .by_error
            .iter()
            .map(|reason| (reason.error.as_str(), reason.count))
            .collect();
        assert_eq!(reasons, vec![("bus init", 2), ("adapter busy", 1), ("timeout", 1)]);
        assert_eq!(summary.failures.recent.len(), 2);
        assert_eq!(summary.failures.recent[1].operation, OperationKind::LiveData);
        assert_eq!(summary.failures.by_operation[&OperationKind::Status], 2);
        assert_eq!(summary.reliability.current_failure_streak, 0);
        assert_eq!(summary.operations.by_operation[&OperationKind::ReadDtc].p95_duration_ms, Some(100));
    }

    #[test]
    fn test_window_filter_and_connection() {
        let events = vec![
            change(0, DiagnosticState::Disconnected, DiagnosticState::Ready),
            ok(100),
            ok(5000),
        ];
        let options = SummaryOptions::since(at(1000));
        let summary = summarize(&events, &options, at(9000));

        assert_eq!(summary.range.total_events, 1);
        assert_eq!(summary.operations.total, 1);
        assert_eq!(summary.range.until, Some(at(5000)));
        // ready since before the window opened
        assert_eq!(summary.connection.uptime_ratio, Some(1.0));
        assert_eq!(summary.connection.transitions, 0);
        assert_eq!(summary.connection.totals_by_state[&DiagnosticState::Ready], 8000);
    }

    #[test]
    fn test_empty_summary() {
        let summary = summarize(&[], &SummaryOptions::default(), capture());
        assert_eq!(summary.operations.total, 0);
        assert_eq!(summary.operations.average_duration_ms, None);
        assert!(summary.operations.daily.is_empty());
        assert_eq!(summary.operations.trends.overall.status, TrendStatus::InsufficientData);
        assert_eq!(summary.reliability.mean_time_between_failures_ms, None);
    }
}
