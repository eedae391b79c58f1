//! Running per-operation totals
//!
//! Fed once per recorded [`OperationEvent`]; never rebuilt from the ring, so
//! eviction leaves the totals untouched.

use crate::event::{OperationEvent, OperationKind, Outcome};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStats {
    pub success: u64,
    pub failure: u64,
    /// Summed duration of successful runs
    pub total_duration_ms: u64,
}

impl OperationStats {
    pub fn total(&self) -> u64 {
        self.success + self.failure
    }

    /// Mean successful duration, rounded
    pub fn average_duration_ms(&self) -> Option<u64> {
        if self.success == 0 {
            return None;
        }
        Some((self.total_duration_ms as f64 / self.success as f64).round() as u64)
    }
}

/// Stats for every [`OperationKind`]
#[derive(Debug, Clone, Default)]
pub struct StatsTable {
    entries: [OperationStats; 5],
}

impl StatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &OperationEvent) {
        let entry = &mut self.entries[event.operation.index()];
        match event.outcome {
            Outcome::Success => {
                entry.success += 1;
                entry.total_duration_ms += event.duration_ms;
            }
            Outcome::Failure => entry.failure += 1,
        }
    }

    pub fn get(&self, kind: OperationKind) -> OperationStats {
        self.entries[kind.index()]
    }

    pub fn snapshot(&self) -> BTreeMap<OperationKind, OperationStats> {
        OperationKind::ALL
            .into_iter()
            .map(|kind| (kind, self.get(kind)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(outcome: Outcome, duration_ms: u64) -> OperationEvent {
        OperationEvent {
            operation: OperationKind::Status,
            outcome,
            attempt: 1,
            attempts_allowed: 3,
            duration_ms,
            error: None,
        }
    }

    #[test]
    fn test_average_counts_successes_only() {
        let mut table = StatsTable::new();
        table.record(&event(Outcome::Success, 100));
        table.record(&event(Outcome::Success, 201));
        table.record(&event(Outcome::Failure, 5000));

        let stats = table.get(OperationKind::Status);
        assert_eq!(stats.success, 2);
        assert_eq!(stats.failure, 1);
        assert_eq!(stats.total(), 3);
        assert_eq!(stats.average_duration_ms(), Some(151));
        assert_eq!(table.get(OperationKind::ReadDtc).average_duration_ms(), None);
    }
}
