use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outcome counts for one address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementCounts {
    pub success: u64,
    pub failure: u64,
    pub dropped: u64,
    /// Successes inside the sliding window.
    pub success_in_window: u64,
    pub failure_in_window: u64,
}

impl MeasurementCounts {
    pub fn merge(&mut self, other: &MeasurementCounts) {
        self.success = self.success.saturating_add(other.success);
        self.failure = self.failure.saturating_add(other.failure);
        self.dropped = self.dropped.saturating_add(other.dropped);
        self.success_in_window = self.success_in_window.saturating_add(other.success_in_window);
        self.failure_in_window = self.failure_in_window.saturating_add(other.failure_in_window);
    }
}

/// Per-address traffic of a connection, aggregated over its workers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub inbound: BTreeMap<String, MeasurementCounts>,
    pub outbound: BTreeMap<String, MeasurementCounts>,
}

impl ConnectionMetrics {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty() && self.outbound.is_empty()
    }

    pub fn merge(&mut self, other: &ConnectionMetrics) {
        for (address, counts) in &other.inbound {
            self.inbound.entry(address.clone()).or_default().merge(counts);
        }
        for (address, counts) in &other.outbound {
            self.outbound.entry(address.clone()).or_default().merge(counts);
        }
    }
}

/// Windowed consumed/published counts per address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub consumed: Vec<u64>,
    pub published: Vec<u64>,
}

impl UsageMetrics {
    pub fn new(consumed: Vec<u64>, published: Vec<u64>) -> Self {
        Self { consumed, published }
    }
}

impl From<&ConnectionMetrics> for UsageMetrics {
    fn from(metrics: &ConnectionMetrics) -> Self {
        Self {
            consumed: metrics.inbound.values().map(|c| c.success_in_window).collect(),
            published: metrics.outbound.values().map(|c| c.success_in_window).collect(),
        }
    }
}
