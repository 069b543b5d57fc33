//! Worker pool of one open connection.

pub mod client;
pub mod loopback;
pub mod placement;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use twinbridge_core::errors::ConnectivityError;
use twinbridge_core::events::ClusterAnnouncement;
use twinbridge_core::headers::Headers;
use twinbridge_core::ids::NodeId;
use twinbridge_core::logs::LogEntry;
use twinbridge_core::metrics::ConnectionMetrics;
use twinbridge_core::model::Connection;
use twinbridge_core::pool::{PoolSnapshot, WorkerRef};
use twinbridge_settings::{ConnectionLogSettings, ConnectivitySettings};
use twinbridge_telemetry::MetricsRecorder;

use crate::cluster::ClusterBus;
use crate::health::{Ping, PoolHealthMonitor, SnapshotReceiver};
use client::{InstantiationError, OutboundMessage, WorkerFactory};
use worker::{spawn_worker, WorkerCommand, WorkerEvent, WorkerHandle, WorkerSpec};

/// Pool sizing and health-check timing.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub nodes: Vec<NodeId>,
    pub worker_mailbox: usize,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub logs: ConnectionLogSettings,
    pub window_hours: u32,
}

impl PoolConfig {
    pub fn from_settings(settings: &ConnectivitySettings) -> Self {
        Self {
            nodes: settings.cluster.nodes.iter().map(NodeId::from_raw).collect(),
            worker_mailbox: settings.supervisor.worker_mailbox_capacity,
            health_interval: settings.health.interval(),
            health_timeout: settings.health.timeout(),
            logs: settings.logs.clone(),
            window_hours: settings.priority.metrics_window_hours,
        }
    }
}

/// Shared collaborators of every pool a supervisor starts.
#[derive(Clone)]
pub(crate) struct PoolDeps {
    pub factory: Arc<dyn WorkerFactory>,
    pub config: PoolConfig,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    pub bus: ClusterBus,
    pub metrics: Arc<MetricsRecorder>,
}

/// Publishes complete snapshots to the pool and gossips membership changes.
struct PoolView {
    connection_id: String,
    snapshots: watch::Sender<Option<PoolSnapshot>>,
    bus: ClusterBus,
    metrics: Arc<MetricsRecorder>,
}

impl SnapshotReceiver for PoolView {
    fn receive(&mut self, snapshot: PoolSnapshot) {
        self.metrics.gauge_set(
            "pool.live_workers",
            &[("connection", self.connection_id.as_str())],
            snapshot.len() as f64,
        );
        let changed = self
            .snapshots
            .borrow()
            .as_ref()
            .map_or(true, |previous| previous.workers() != snapshot.workers());
        if changed {
            if let Some(first) = snapshot.workers().first() {
                self.bus.publish(ClusterAnnouncement::WorkersAnnounced {
                    connection_id: first.connection_id().clone(),
                    workers: snapshot.workers().to_vec(),
                });
            }
        }
        self.snapshots.send_replace(Some(snapshot));
    }
}

pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    snapshots: watch::Receiver<Option<PoolSnapshot>>,
    cancel: CancellationToken,
    // Kept so workers see the ping channel close when the pool is dropped.
    _pings: broadcast::Sender<Ping>,
}

impl WorkerPool {
    /// Create every client first, then spawn workers and the health monitor.
    /// A failing client creation leaves nothing running.
    pub(crate) fn start(
        connection: Arc<Connection>,
        headers: &Headers,
        deps: &PoolDeps,
    ) -> Result<Self, InstantiationError> {
        let id = connection.id().clone();
        let nodes = placement::assign_nodes(&id, connection.client_count() as usize, &deps.config.nodes);
        if nodes.is_empty() {
            return Err(InstantiationError(format!("no nodes available for {id}")));
        }

        let clients = nodes
            .iter()
            .map(|_| deps.factory.create(&connection, headers))
            .collect::<Result<Vec<_>, _>>()?;

        let (pings, _) = broadcast::channel(16);
        let workers: Vec<WorkerHandle> = nodes
            .into_iter()
            .zip(clients)
            .map(|(node, client)| {
                let spec = WorkerSpec {
                    worker: WorkerRef::new(node, id.clone()),
                    connection: connection.clone(),
                    headers: headers.clone(),
                    factory: deps.factory.clone(),
                    events: deps.events.clone(),
                    pings: pings.subscribe(),
                    mailbox: deps.config.worker_mailbox,
                    logs: deps.config.logs.clone(),
                    window_hours: deps.config.window_hours,
                    metrics: deps.metrics.clone(),
                };
                spawn_worker(spec, client)
            })
            .collect();

        let (snapshot_tx, snapshots) = watch::channel(None);
        let view = PoolView {
            connection_id: id.to_string(),
            snapshots: snapshot_tx,
            bus: deps.bus.clone(),
            metrics: deps.metrics.clone(),
        };
        let cancel = CancellationToken::new();
        PoolHealthMonitor::new(
            workers.len(),
            view,
            pings.clone(),
            deps.config.health_interval,
            deps.config.health_timeout,
        )
        .spawn_instrumented(cancel.clone(), tracing::debug_span!("health", connection_id = %id));

        info!(connection_id = %id, workers = workers.len(), "worker pool started");
        Ok(Self {
            workers,
            snapshots,
            cancel,
            _pings: pings,
        })
    }

    pub fn workers(&self) -> Vec<WorkerRef> {
        self.workers.iter().map(|w| w.worker().clone()).collect()
    }

    pub fn contains(&self, worker: &WorkerRef) -> bool {
        self.workers.iter().any(|w| w.worker() == worker)
    }

    pub fn snapshot(&self) -> Option<PoolSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Last snapshot covers every worker.
    pub fn is_complete(&self) -> bool {
        self.snapshots
            .borrow()
            .as_ref()
            .is_some_and(|s| s.len() == self.workers.len())
    }

    /// Resolves once a snapshot covering every worker is published. Callers
    /// bound the wait themselves.
    pub async fn completed(&self) -> Result<PoolSnapshot, ConnectivityError> {
        let expected = self.workers.len();
        let mut rx = self.snapshots.clone();
        let result = match rx.wait_for(|s| s.as_ref().is_some_and(|s| s.len() == expected)).await {
            Ok(snapshot) => snapshot
                .clone()
                .ok_or_else(|| ConnectivityError::unavailable("worker pool stopped before becoming healthy")),
            Err(_) => Err(ConnectivityError::unavailable("worker pool stopped before becoming healthy")),
        };
        result
    }

    /// Wait until a snapshot covering every worker is published.
    pub async fn wait_until_complete(&self, timeout: Duration) -> Result<PoolSnapshot, ConnectivityError> {
        tokio::time::timeout(timeout, self.completed())
            .await
            .map_err(|_| ConnectivityError::timed_out("worker pool health check", timeout))?
    }

    /// Hand `message` to the live worker chosen by `routing_key`.
    pub fn dispatch(&self, message: OutboundMessage, routing_key: &str) -> bool {
        let chosen = self.snapshots.borrow().as_ref().and_then(|s| s.select(routing_key).cloned());
        let Some(chosen) = chosen else {
            debug!(address = %message.address, "no live worker, dropping message");
            return false;
        };
        self.handle(&chosen)
            .is_some_and(|h| h.try_send(WorkerCommand::Publish(message)))
    }

    /// Ask `worker` to recreate its client. Delivery does not depend on how
    /// full its mailbox is.
    pub fn restart(&self, worker: &WorkerRef) -> bool {
        self.handle(worker).is_some_and(WorkerHandle::restart)
    }

    /// Close every worker and wait for all acknowledgements.
    pub async fn close(&self, timeout: Duration) -> Result<(), ConnectivityError> {
        tokio::time::timeout(timeout, join_all(self.workers.iter().map(WorkerHandle::close)))
            .await
            .map(|_| ())
            .map_err(|_| ConnectivityError::timed_out("closing workers", timeout))
    }

    /// Merged metrics of the workers that answer within `timeout`.
    pub async fn metrics(&self, timeout: Duration) -> ConnectionMetrics {
        let replies = join_all(self.workers.iter().map(|w| async move {
            tokio::time::timeout(timeout, w.metrics()).await.ok().flatten()
        }))
        .await;
        let mut merged = ConnectionMetrics::empty();
        for metrics in replies.iter().flatten() {
            merged.merge(metrics);
        }
        merged
    }

    pub async fn logs(&self, timeout: Duration) -> Vec<LogEntry> {
        let replies = join_all(self.workers.iter().map(|w| async move {
            tokio::time::timeout(timeout, w.logs()).await.ok().flatten()
        }))
        .await;
        replies.into_iter().flatten().flatten().collect()
    }

    pub fn reset_metrics(&self) {
        self.broadcast(|| WorkerCommand::ResetMetrics);
    }

    pub fn reset_logs(&self) {
        self.broadcast(|| WorkerCommand::ResetLogs);
    }

    pub fn enable_logs(&self, until: DateTime<Utc>) {
        self.broadcast(|| WorkerCommand::EnableLogs { until });
    }

    /// Stop the health monitor and drop the workers.
    pub fn stop(self) {
        debug!(workers = self.workers.len(), "stopping worker pool");
    }

    fn broadcast(&self, command: impl Fn() -> WorkerCommand) {
        for worker in &self.workers {
            worker.try_send(command());
        }
    }

    fn handle(&self, worker: &WorkerRef) -> Option<&WorkerHandle> {
        self.workers.iter().find(|w| w.worker() == worker)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinbridge_core::ids::ConnectionId;
    use twinbridge_core::model::{ConnectionType, Topic};

    use loopback::LoopbackFactory;

    fn deps(factory: LoopbackFactory, nodes: &[&str]) -> (PoolDeps, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let deps = PoolDeps {
            factory: Arc::new(factory),
            config: PoolConfig {
                nodes: nodes.iter().map(|n| NodeId::from_raw(*n)).collect(),
                worker_mailbox: 16,
                health_interval: Duration::from_millis(100),
                health_timeout: Duration::from_millis(50),
                logs: ConnectionLogSettings::default(),
                window_hours: 24,
            },
            events,
            bus: ClusterBus::new(16),
            metrics: Arc::new(MetricsRecorder::new()),
        };
        (deps, rx)
    }

    fn connection(clients: u32) -> Arc<Connection> {
        Arc::new(
            Connection::new(ConnectionId::from_raw("pool"), ConnectionType::Amqp091, "amqp://broker:5672")
                .with_client_count(clients),
        )
    }

    fn message() -> OutboundMessage {
        OutboundMessage {
            address: "out".into(),
            headers: Default::default(),
            topic: Topic::TwinEvents,
            entity_id: "ns:a".into(),
            action: "modified".into(),
            payload: serde_json::json!({"v": 1}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_complete_and_dispatches() {
        let factory = LoopbackFactory::new();
        let (deps, mut events) = deps(factory.clone(), &["node-1", "node-2"]);
        let pool = WorkerPool::start(connection(3), &Headers::new(), &deps).unwrap();

        let snapshot = pool.wait_until_complete(Duration::from_secs(1)).await.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert!(pool.is_complete());
        for _ in 0..3 {
            assert!(matches!(events.recv().await, Some(WorkerEvent::Started(_))));
        }

        assert!(pool.dispatch(message(), "ns:a"));
        let metrics = pool.metrics(Duration::from_millis(50)).await;
        assert_eq!(metrics.outbound["out"].success, 1);
        assert_eq!(factory.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_failure_spawns_nothing() {
        let factory = LoopbackFactory::new();
        factory.fail_next_creations(1);
        let (deps, _events) = deps(factory.clone(), &["node-1"]);
        assert!(WorkerPool::start(connection(2), &Headers::new(), &deps).is_err());
        assert_eq!(factory.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_worker_keeps_pool_incomplete_until_restarted() {
        let factory = LoopbackFactory::new();
        factory.fail_next_connects(1);
        let (deps, mut events) = deps(factory.clone(), &["node-1"]);
        let pool = WorkerPool::start(connection(1), &Headers::new(), &deps).unwrap();

        let failed = match events.recv().await {
            Some(WorkerEvent::Failed { worker, .. }) => worker,
            other => panic!("expected failure, got {other:?}"),
        };
        assert!(pool.wait_until_complete(Duration::from_millis(300)).await.is_err());

        assert!(pool.restart(&failed));
        assert_eq!(events.recv().await, Some(WorkerEvent::Started(failed)));
        assert!(pool.wait_until_complete(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_overtakes_a_full_mailbox() {
        let factory = LoopbackFactory::new();
        factory.fail_next_connects(1);
        let (mut deps, mut events) = deps(factory.clone(), &["node-1"]);
        deps.config.worker_mailbox = 1;
        let pool = WorkerPool::start(connection(1), &Headers::new(), &deps).unwrap();
        let worker = pool.workers().remove(0);

        let handle = pool.handle(&worker).unwrap();
        let mut queued = 0;
        while handle.try_send(WorkerCommand::Publish(message())) {
            queued += 1;
        }
        assert_eq!(queued, 1);

        assert!(pool.restart(&worker));
        assert!(matches!(events.recv().await, Some(WorkerEvent::Failed { .. })));
        assert_eq!(events.recv().await, Some(WorkerEvent::Started(worker)));
        assert_eq!(factory.created(), 2);
        assert!(pool.wait_until_complete(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_acks() {
        let factory = LoopbackFactory::new();
        let (deps, _events) = deps(factory.clone(), &["node-1"]);
        let pool = WorkerPool::start(connection(2), &Headers::new(), &deps).unwrap();
        pool.wait_until_complete(Duration::from_secs(1)).await.unwrap();

        pool.close(Duration::from_secs(1)).await.unwrap();
        assert_eq!(factory.disconnects(), 2);
        pool.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_close_times_out() {
        let factory = LoopbackFactory::new();
        let (deps, _events) = deps(factory.clone(), &["node-1"]);
        let pool = WorkerPool::start(connection(1), &Headers::new(), &deps).unwrap();
        pool.wait_until_complete(Duration::from_secs(1)).await.unwrap();

        factory.hang_on_disconnect(true);
        let err = pool.close(Duration::from_millis(100)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_are_gossiped() {
        let factory = LoopbackFactory::new();
        let (deps, _events) = deps(factory, &["node-1"]);
        let mut announcements = deps.bus.subscribe();
        let pool = WorkerPool::start(connection(1), &Headers::new(), &deps).unwrap();
        pool.wait_until_complete(Duration::from_secs(1)).await.unwrap();

        match announcements.recv().await.unwrap() {
            ClusterAnnouncement::WorkersAnnounced { workers, .. } => assert_eq!(workers, pool.workers()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
