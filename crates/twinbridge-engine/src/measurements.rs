//! Per-address traffic counters with an hourly sliding window.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use twinbridge_core::metrics::{ConnectionMetrics, MeasurementCounts};

const BUCKET_SECS: i64 = 3600;

/// Lifetime total plus hourly buckets covering the last `window_hours`.
#[derive(Clone, Debug)]
pub struct WindowedCounter {
    window_hours: u32,
    total: u64,
    buckets: VecDeque<(i64, u64)>,
}

impl WindowedCounter {
    pub fn new(window_hours: u32) -> Self {
        Self {
            window_hours: window_hours.max(1),
            total: 0,
            buckets: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>) {
        self.total = self.total.saturating_add(1);
        let hour = at.timestamp().div_euclid(BUCKET_SECS);
        match self.buckets.back_mut() {
            Some((last, count)) if *last == hour => *count = count.saturating_add(1),
            _ => self.buckets.push_back((hour, 1)),
        }
        self.prune(at);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn in_window(&self, now: DateTime<Utc>) -> u64 {
        let oldest = Self::oldest_hour(now, self.window_hours);
        self.buckets
            .iter()
            .filter(|(hour, _)| *hour >= oldest)
            .fold(0u64, |acc, (_, count)| acc.saturating_add(*count))
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let oldest = Self::oldest_hour(now, self.window_hours);
        while self.buckets.front().is_some_and(|(hour, _)| *hour < oldest) {
            self.buckets.pop_front();
        }
    }

    fn oldest_hour(now: DateTime<Utc>, window_hours: u32) -> i64 {
        now.timestamp().div_euclid(BUCKET_SECS) - i64::from(window_hours) + 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Outcome {
    Success,
    Failure,
    Dropped,
}

/// All counters of one worker.
#[derive(Debug)]
pub struct ConnectionMeasurements {
    window_hours: u32,
    counters: BTreeMap<(Direction, String, Outcome), WindowedCounter>,
}

pub type SharedMeasurements = Arc<Mutex<ConnectionMeasurements>>;

impl ConnectionMeasurements {
    pub fn new(window_hours: u32) -> Self {
        Self {
            window_hours,
            counters: BTreeMap::new(),
        }
    }

    pub fn shared(window_hours: u32) -> SharedMeasurements {
        Arc::new(Mutex::new(Self::new(window_hours)))
    }

    pub fn record(&mut self, direction: Direction, address: &str, outcome: Outcome, at: DateTime<Utc>) {
        self.counters
            .entry((direction, address.to_owned(), outcome))
            .or_insert_with(|| WindowedCounter::new(self.window_hours))
            .record(at);
    }

    pub fn reset(&mut self) {
        self.counters.clear();
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> ConnectionMetrics {
        let mut metrics = ConnectionMetrics::empty();
        for ((direction, address, outcome), counter) in &self.counters {
            let side = match direction {
                Direction::Inbound => &mut metrics.inbound,
                Direction::Outbound => &mut metrics.outbound,
            };
            let counts: &mut MeasurementCounts = side.entry(address.clone()).or_default();
            match outcome {
                Outcome::Success => {
                    counts.success = counter.total();
                    counts.success_in_window = counter.in_window(now);
                }
                Outcome::Failure => {
                    counts.failure = counter.total();
                    counts.failure_in_window = counter.in_window(now);
                }
                Outcome::Dropped => counts.dropped = counter.total(),
            }
        }
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn window_forgets_old_hours() {
        let mut counter = WindowedCounter::new(24);
        counter.record(t0());
        counter.record(t0() + Duration::minutes(10));
        assert_eq!(counter.in_window(t0() + Duration::hours(1)), 2);
        assert_eq!(counter.in_window(t0() + Duration::hours(25)), 0);
        assert_eq!(counter.total(), 2);
    }

    #[test]
    fn pruning_keeps_recent_buckets() {
        let mut counter = WindowedCounter::new(2);
        counter.record(t0());
        counter.record(t0() + Duration::hours(1));
        counter.record(t0() + Duration::hours(3));
        assert_eq!(counter.in_window(t0() + Duration::hours(3)), 1);
        assert_eq!(counter.total(), 3);
    }

    #[test]
    fn snapshot_splits_direction_and_outcome() {
        let mut m = ConnectionMeasurements::new(24);
        m.record(Direction::Outbound, "out/a", Outcome::Success, t0());
        m.record(Direction::Outbound, "out/a", Outcome::Success, t0());
        m.record(Direction::Outbound, "out/a", Outcome::Failure, t0());
        m.record(Direction::Outbound, "out/a", Outcome::Dropped, t0());
        m.record(Direction::Inbound, "in/q", Outcome::Success, t0());

        let snapshot = m.snapshot(t0());
        let out = snapshot.outbound["out/a"];
        assert_eq!((out.success, out.success_in_window, out.failure, out.dropped), (2, 2, 1, 1));
        assert_eq!(snapshot.inbound["in/q"].success, 1);

        m.reset();
        assert!(m.snapshot(t0()).is_empty());
    }
}
