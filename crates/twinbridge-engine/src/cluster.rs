//! Cluster announcements and the router cache fed by them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use twinbridge_core::events::ClusterAnnouncement;
use twinbridge_core::ids::ConnectionId;
use twinbridge_core::pool::WorkerRef;

/// Fan-out of [`ClusterAnnouncement`]s to every interested node component.
#[derive(Clone, Debug)]
pub struct ClusterBus {
    tx: broadcast::Sender<ClusterAnnouncement>,
}

impl ClusterBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Number of receivers reached; 0 when nobody listens.
    pub fn publish(&self, announcement: ClusterAnnouncement) -> usize {
        match self.tx.send(announcement) {
            Ok(n) => n,
            Err(_) => {
                debug!("no listeners for cluster announcement");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterAnnouncement> {
        self.tx.subscribe()
    }
}

/// Last announced workers per connection, for routing signals on any node.
#[derive(Clone, Default)]
pub struct RouterCache {
    entries: Arc<DashMap<ConnectionId, Vec<WorkerRef>>>,
}

impl RouterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, announcement: &ClusterAnnouncement) {
        match announcement {
            ClusterAnnouncement::WorkersAnnounced { connection_id, workers } => {
                self.entries.insert(connection_id.clone(), workers.clone());
            }
            ClusterAnnouncement::ConnectionDeleted { connection_id } => {
                self.entries.remove(connection_id);
            }
        }
    }

    pub fn workers(&self, connection_id: &ConnectionId) -> Vec<WorkerRef> {
        self.entries
            .get(connection_id)
            .map(|w| w.value().clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep the cache in sync with `bus` until cancelled.
    pub fn spawn_listener(&self, bus: &ClusterBus, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(announcement) => cache.apply(&announcement),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "router cache lagged behind cluster announcements");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}
