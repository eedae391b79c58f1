//! Diagnostic Timeline
//!
//! Value types shared by the session manager and the event stores:
//! session states, timeline events, the bounded event ring, running
//! per-operation stats, reliability maths and the historical summarizer.

mod buffer;
mod event;
mod reliability;
mod stats;
mod summary;

pub use buffer::{RingBuffer, DEFAULT_CAPACITY};
pub use event::{
    format_timestamp, DiagnosticState, EventIdGenerator, EventKind, OperationEvent,
    OperationKind, Outcome, StateChangeEvent, TimelineEvent,
};
pub use reliability::{
    connection_summary, current_failure_streak, mean_time_between_failures,
    mean_time_to_recovery, ConnectionSegment, ConnectionSummary, ReliabilitySummary,
};
pub use stats::{OperationStats, StatsTable};
pub use summary::{
    classify_trend, percentile, rank_reasons, summarize, DailyBucket, DiagnosticsSummary,
    FailureReason, FailureRecord, FailureSummary, OperationMetrics, OperationsSummary,
    OutcomeCounts, RatedCounts, RollingSummary, RollingWindow, SummaryOptions, SummaryRange,
    Trend, TrendStatus, TrendSummary, DEFAULT_FAILURE_LIMIT, DEFAULT_MAX_DAYS,
};
