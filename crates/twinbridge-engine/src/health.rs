//! Quorum health check over a worker pool.
//!
//! Every round the monitor broadcasts a [`Ping`] to the pool and collects
//! [`Pong`]s tagged with the same round. Only a round answered by all
//! expected workers before the timeout produces a [`PoolSnapshot`]; partial
//! rounds are discarded and the previous snapshot stays current.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Instrument, Span};

use twinbridge_core::pool::{PoolSnapshot, WorkerRef};

/// Liveness request for one round.
#[derive(Clone, Debug)]
pub struct Ping {
    pub round: u64,
    pub reply_to: mpsc::UnboundedSender<Pong>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pong {
    pub round: u64,
    pub worker: WorkerRef,
}

/// Consumer of complete snapshots.
pub trait SnapshotReceiver: Send + Sync + 'static {
    fn receive(&mut self, snapshot: PoolSnapshot);
}

impl SnapshotReceiver for mpsc::UnboundedSender<PoolSnapshot> {
    fn receive(&mut self, snapshot: PoolSnapshot) {
        let _ = self.send(snapshot);
    }
}

pub struct PoolHealthMonitor<R> {
    expected: usize,
    receiver: R,
    pool: broadcast::Sender<Ping>,
    interval: Duration,
    timeout: Duration,
}

impl<R: SnapshotReceiver> PoolHealthMonitor<R> {
    pub fn new(
        expected: usize,
        receiver: R,
        pool: broadcast::Sender<Ping>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            expected,
            receiver,
            pool,
            interval,
            timeout,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub fn spawn_instrumented(self, cancel: CancellationToken, span: Span) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel).instrument(span))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut round: u64 = 0;
        loop {
            round += 1;
            let started = Instant::now();

            let snapshot = tokio::select! {
                _ = cancel.cancelled() => break,
                snapshot = self.collect(round, started + self.timeout) => snapshot,
            };

            match snapshot {
                Some(snapshot) => {
                    trace!(round, workers = snapshot.len(), "pool snapshot complete");
                    self.receiver.receive(snapshot);
                }
                None => debug!(round, expected = self.expected, "health round incomplete"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(started + self.interval) => {}
            }
        }
        debug!(rounds = round, "health monitor stopped");
    }

    async fn collect(&self, round: u64, deadline: Instant) -> Option<PoolSnapshot> {
        let (reply_to, mut pongs) = mpsc::unbounded_channel();
        // No subscribers: nothing can answer this round.
        if self.pool.send(Ping { round, reply_to }).is_err() {
            sleep_until(deadline).await;
            return None;
        }

        let mut responders = BTreeSet::new();
        while responders.len() < self.expected {
            tokio::select! {
                _ = sleep_until(deadline) => return None,
                pong = pongs.recv() => match pong {
                    Some(pong) if pong.round == round => {
                        responders.insert(pong.worker);
                    }
                    Some(stale) => trace!(round, stale = stale.round, "ignoring stale pong"),
                    None => return None,
                },
            }
        }
        Some(PoolSnapshot::from_responders(round, responders))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;
    use twinbridge_core::ids::{ConnectionId, NodeId};

    const T: Duration = Duration::from_millis(200);
    const D: Duration = Duration::from_millis(100);

    fn worker(node: &str) -> WorkerRef {
        WorkerRef::new(NodeId::from_raw(node), ConnectionId::from_raw("conn-health"))
    }

    fn spawn_responder<F>(pool: &broadcast::Sender<Ping>, worker: WorkerRef, rounds_for: F)
    where
        F: Fn(u64) -> Vec<u64> + Send + 'static,
    {
        let mut rx = pool.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ping) => {
                        for round in rounds_for(ping.round) {
                            let _ = ping.reply_to.send(Pong {
                                round,
                                worker: worker.clone(),
                            });
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    fn monitor(
        expected: usize,
        pool: &broadcast::Sender<Ping>,
    ) -> (mpsc::UnboundedReceiver<PoolSnapshot>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        PoolHealthMonitor::new(expected, tx, pool.clone(), T, D).spawn(cancel.clone());
        (rx, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn full_quorum_delivers_sorted_snapshot() {
        let (pool, _) = broadcast::channel(16);
        let workers = vec![worker("node-c"), worker("node-a"), worker("node-b")];
        for w in &workers {
            spawn_responder(&pool, w.clone(), |r| vec![r]);
        }
        let (mut rx, _cancel) = monitor(3, &pool);

        let first = rx.recv().await.unwrap();
        let first_at = Instant::now();
        let mut sorted = workers.clone();
        sorted.sort();
        assert_eq!(first.round(), 1);
        assert_eq!(first.workers(), sorted.as_slice());

        let second = rx.recv().await.unwrap();
        assert_eq!(second.round(), 2);
        assert!(Instant::now() - first_at >= T);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_round_is_discarded() {
        let (pool, _) = broadcast::channel(16);
        spawn_responder(&pool, worker("node-1"), |r| vec![r]);
        spawn_responder(&pool, worker("node-2"), |r| vec![r]);
        spawn_responder(&pool, worker("node-3"), |r| if r == 1 { vec![] } else { vec![r] });
        let (mut rx, _cancel) = monitor(3, &pool);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.round(), 2);
        assert_eq!(first.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_pongs_do_not_fill_quorum() {
        let (pool, _) = broadcast::channel(16);
        spawn_responder(&pool, worker("node-1"), |r| vec![r, r]);
        spawn_responder(&pool, worker("node-2"), |_| vec![]);
        let (mut rx, _cancel) = monitor(2, &pool);

        let outcome = tokio::time::timeout(T * 5, rx.recv()).await;
        assert!(outcome.is_err(), "no snapshot expected, got {outcome:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pongs_are_ignored() {
        let (pool, _) = broadcast::channel(16);
        spawn_responder(&pool, worker("node-1"), |r| vec![r]);
        spawn_responder(&pool, worker("node-2"), |r| vec![r.saturating_sub(1)]);
        let (mut rx, _cancel) = monitor(2, &pool);

        let outcome = tokio::time::timeout(T * 5, rx.recv()).await;
        assert!(outcome.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_monitor() {
        let (pool, _) = broadcast::channel::<Ping>(16);
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = PoolHealthMonitor::new(1, tx, pool.clone(), T, D).spawn(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(T, handle).await.unwrap().unwrap();
    }
}
