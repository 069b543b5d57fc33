//! Usage-based connection priority.

use std::time::Duration;

use futures::future::join_all;
use tracing::warn;

use twinbridge_core::commands::{ResponseKind, SupervisorCommand};
use twinbridge_core::headers::Headers;
use twinbridge_core::ids::ConnectionId;
use twinbridge_core::metrics::UsageMetrics;

use crate::supervisor::SupervisorHandle;

/// Saturating sum of windowed consumed plus published counts.
///
/// Every count is capped at `i32::MAX` before summing, so the result never
/// wraps and is never negative.
pub fn priority(metrics: &UsageMetrics) -> i32 {
    saturating_sum(&metrics.consumed).saturating_add(saturating_sum(&metrics.published))
}

fn saturating_sum(counts: &[u64]) -> i32 {
    counts
        .iter()
        .fold(0i32, |acc, &count| acc.saturating_add(i32::try_from(count).unwrap_or(i32::MAX)))
}

/// Asks supervisors for their metrics and turns them into priorities.
#[derive(Clone, Debug)]
pub struct PriorityEstimator {
    timeout: Duration,
}

impl PriorityEstimator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Priority of one connection; 0 when the supervisor does not answer in time.
    pub async fn estimate(&self, handle: &SupervisorHandle) -> i32 {
        match handle
            .ask(SupervisorCommand::RetrieveMetrics, Headers::new(), self.timeout)
            .await
        {
            Ok(response) => match response.kind {
                ResponseKind::Metrics(metrics) => priority(&UsageMetrics::from(&metrics)),
                other => {
                    warn!(connection_id = %handle.connection_id(), reply = ?other, "unexpected metrics reply");
                    0
                }
            },
            Err(failure) => {
                warn!(
                    connection_id = %handle.connection_id(),
                    error = %failure.error,
                    "metrics unavailable, using priority 0"
                );
                0
            }
        }
    }

    /// Highest priority first; ties ordered by id.
    pub async fn rank<'a>(&self, handles: impl IntoIterator<Item = &'a SupervisorHandle>) -> Vec<(ConnectionId, i32)> {
        let mut ranked = join_all(handles.into_iter().map(|handle| async move {
            (handle.connection_id().clone(), self.estimate(handle).await)
        }))
        .await;
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }
}
