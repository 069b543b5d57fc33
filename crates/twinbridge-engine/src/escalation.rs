//! Bounded-retry supervision for pool workers.
//!
//! Each failure either restarts the failed worker or escalates to the
//! connection supervisor. Counters are keyed per worker and reset when the
//! worker reports a successful start.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::{debug, warn};

use twinbridge_core::pool::WorkerFailure;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("retries until escalation must be >= 0, got {0}")]
    NegativeRetries(i64),
}

/// Failure counts since the last successful start, per key.
pub trait RestartCounterStore<K> {
    fn count(&self, key: &K) -> u32;
    fn increment(&mut self, key: &K) -> u32;
    fn reset(&mut self, key: &K);
}

#[derive(Debug)]
pub struct RestartCounters<K> {
    counts: HashMap<K, u32>,
}

impl<K> Default for RestartCounters<K> {
    fn default() -> Self {
        Self { counts: HashMap::new() }
    }
}

impl<K: Eq + Hash + Clone> RestartCounters<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&mut self, key: &K) {
        self.counts.remove(key);
    }
}

impl<K: Eq + Hash + Clone> RestartCounterStore<K> for RestartCounters<K> {
    fn count(&self, key: &K) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    fn increment(&mut self, key: &K) -> u32 {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn reset(&mut self, key: &K) {
        self.counts.remove(key);
    }
}

/// Outcome of handling one failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The worker was restarted; `attempt` is its failure count after this one.
    Restarted { attempt: u32 },
    /// Not handled locally; the supervisor must act.
    Escalate,
}

impl Decision {
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Restarted { .. })
    }
}

type FailureFilter = Arc<dyn Fn(&WorkerFailure) -> bool + Send + Sync>;

/// Restart up to `retries_until_escalate` times, then escalate.
#[derive(Clone)]
pub struct EscalationPolicy {
    retries_until_escalate: u32,
    applies_to: Option<FailureFilter>,
}

impl fmt::Debug for EscalationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EscalationPolicy")
            .field("retries_until_escalate", &self.retries_until_escalate)
            .field("filtered", &self.applies_to.is_some())
            .finish()
    }
}

impl EscalationPolicy {
    pub fn new(retries_until_escalate: i64) -> Result<Self, PolicyError> {
        if retries_until_escalate < 0 {
            return Err(PolicyError::NegativeRetries(retries_until_escalate));
        }
        Ok(Self {
            retries_until_escalate: u32::try_from(retries_until_escalate).unwrap_or(u32::MAX),
            applies_to: None,
        })
    }

    /// Escalate every failure.
    pub fn escalate() -> Self {
        Self {
            retries_until_escalate: 0,
            applies_to: None,
        }
    }

    /// Only failures accepted by `filter` are retried; others escalate at once.
    pub fn with_filter(mut self, filter: impl Fn(&WorkerFailure) -> bool + Send + Sync + 'static) -> Self {
        self.applies_to = Some(Arc::new(filter));
        self
    }

    pub fn retries_until_escalate(&self) -> u32 {
        self.retries_until_escalate
    }

    /// Handle one failure of `key`. `restart` runs only when handled locally.
    pub fn handle<K, S, R>(&self, counters: &mut S, key: &K, failure: &WorkerFailure, restart: R) -> Decision
    where
        K: fmt::Display,
        S: RestartCounterStore<K>,
        R: FnOnce(&K),
    {
        if let Some(filter) = &self.applies_to {
            if !filter(failure) {
                warn!(worker = %key, %failure, "failure outside policy, escalating");
                return Decision::Escalate;
            }
        }

        let count = counters.count(key);
        if count < self.retries_until_escalate {
            let attempt = counters.increment(key);
            debug!(
                worker = %key,
                %failure,
                attempt,
                max = self.retries_until_escalate,
                "restarting worker"
            );
            restart(key);
            Decision::Restarted { attempt }
        } else {
            warn!(
                worker = %key,
                %failure,
                failures = count,
                "worker retries exhausted, escalating"
            );
            Decision::Escalate
        }
    }
}
