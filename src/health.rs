//! Counters and latencies observed from every stage.
//!
//! Recording is lock-free atomics only; the reporter never feeds back into
//! control flow.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Duplicate,
    InFlight,
    RetryScheduled,
    Succeeded,
    Retried,
    DeadLettered,
    ValidationFailed,
    Backpressure,
    WatcherError,
}

impl Outcome {
    pub const ALL: [Outcome; 10] = [
        Outcome::Accepted,
        Outcome::Duplicate,
        Outcome::InFlight,
        Outcome::RetryScheduled,
        Outcome::Succeeded,
        Outcome::Retried,
        Outcome::DeadLettered,
        Outcome::ValidationFailed,
        Outcome::Backpressure,
        Outcome::WatcherError,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::Duplicate => "duplicate",
            Outcome::InFlight => "in_flight",
            Outcome::RetryScheduled => "retry_scheduled",
            Outcome::Succeeded => "succeeded",
            Outcome::Retried => "retried",
            Outcome::DeadLettered => "dead_lettered",
            Outcome::ValidationFailed => "validation_failed",
            Outcome::Backpressure => "backpressure",
            Outcome::WatcherError => "watcher_error",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Ledger,
    Decode,
    Inference,
    Filter,
    Sink,
    EndToEnd,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Ledger,
        Stage::Decode,
        Stage::Inference,
        Stage::Filter,
        Stage::Sink,
        Stage::EndToEnd,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Stage::Ledger => "ledger",
            Stage::Decode => "decode",
            Stage::Inference => "inference",
            Stage::Filter => "filter",
            Stage::Sink => "sink",
            Stage::EndToEnd => "end_to_end",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct LatencyCell {
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyCell {
    fn record(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_us.load(Ordering::Relaxed);
        LatencySnapshot {
            count,
            mean_ms: if count == 0 {
                0.0
            } else {
                total as f64 / count as f64 / 1_000.0
            },
            max_ms: self.max_us.load(Ordering::Relaxed) as f64 / 1_000.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub outcomes: BTreeMap<&'static str, u64>,
    pub latencies: BTreeMap<&'static str, LatencySnapshot>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub retry_pending: usize,
}

impl HealthSnapshot {
    pub fn outcome(&self, outcome: Outcome) -> u64 {
        self.outcomes.get(outcome.label()).copied().unwrap_or(0)
    }
}

/// Observability collaborator that receives periodic snapshots.
pub trait HealthSink: Send + Sync {
    fn publish(&self, snapshot: &HealthSnapshot);
}

/// Writes each snapshot as one JSON log line.
pub struct LogHealthSink;

impl HealthSink for LogHealthSink {
    fn publish(&self, snapshot: &HealthSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(line) => log::info!("health {}", line),
            Err(err) => log::warn!("health snapshot not serializable: {}", err),
        }
    }
}

pub struct HealthReporter {
    outcomes: [AtomicU64; Outcome::ALL.len()],
    latencies: [LatencyCell; Stage::ALL.len()],
}

impl HealthReporter {
    pub fn new() -> Self {
        Self {
            outcomes: std::array::from_fn(|_| AtomicU64::new(0)),
            latencies: std::array::from_fn(|_| LatencyCell::default()),
        }
    }

    pub fn record(&self, outcome: Outcome) {
        self.outcomes[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, stage: Stage, elapsed: Duration) {
        self.latencies[stage.index()].record(elapsed);
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.outcomes[outcome.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(
        &self,
        queue_depth: usize,
        queue_capacity: usize,
        retry_pending: usize,
    ) -> HealthSnapshot {
        HealthSnapshot {
            outcomes: Outcome::ALL
                .iter()
                .map(|o| (o.label(), self.count(*o)))
                .collect(),
            latencies: Stage::ALL
                .iter()
                .map(|s| (s.label(), self.latencies[s.index()].snapshot()))
                .collect(),
            queue_depth,
            queue_capacity,
            retry_pending,
        }
    }
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_latencies_accumulate() {
        let health = HealthReporter::new();
        health.record(Outcome::Accepted);
        health.record(Outcome::Accepted);
        health.record(Outcome::DeadLettered);
        health.record_latency(Stage::Inference, Duration::from_millis(10));
        health.record_latency(Stage::Inference, Duration::from_millis(30));

        let snap = health.snapshot(3, 16, 1);
        assert_eq!(snap.outcome(Outcome::Accepted), 2);
        assert_eq!(snap.outcome(Outcome::DeadLettered), 1);
        assert_eq!(snap.outcome(Outcome::Succeeded), 0);
        let inference = &snap.latencies["inference"];
        assert_eq!(inference.count, 2);
        assert!((inference.mean_ms - 20.0).abs() < 1e-9);
        assert!((inference.max_ms - 30.0).abs() < 1e-9);
        assert_eq!(snap.queue_depth, 3);
    }

    #[test]
    fn snapshot_serializes_with_labels() {
        let snap = HealthReporter::new().snapshot(0, 4, 0);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["outcomes"]["retry_scheduled"], 0);
        assert_eq!(json["latencies"]["end_to_end"]["count"], 0);
        assert_eq!(json["queue_capacity"], 4);
    }
}
