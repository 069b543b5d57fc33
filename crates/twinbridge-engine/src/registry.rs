//! Node-local registry: at most one live supervisor per connection id.
//!
//! Supervisors are spawned lazily on first use and recover from the journal
//! themselves. A passivation request removes exactly the incarnation that
//! sent it; the next command respawns the connection from the journal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use twinbridge_core::commands::{CommandResult, SupervisorCommand};
use twinbridge_core::headers::Headers;
use twinbridge_core::ids::ConnectionId;
use twinbridge_core::signal::Signal;
use twinbridge_store::{ConnectionJournal, StoreError};

use crate::cluster::RouterCache;
use crate::priority::PriorityEstimator;
use crate::supervisor::{ConnectionSupervisor, ParentMessage, SupervisorContext, SupervisorHandle};

pub struct ConnectionRegistry {
    ctx: Arc<SupervisorContext>,
    supervisors: Arc<DashMap<ConnectionId, SupervisorHandle>>,
    incarnations: AtomicU64,
    parent: mpsc::UnboundedSender<ParentMessage>,
    router_cache: RouterCache,
    cancel: CancellationToken,
}

impl ConnectionRegistry {
    /// Must be called inside a tokio runtime; spawns the passivation and
    /// router-cache listeners.
    pub fn new(ctx: SupervisorContext) -> Self {
        let ctx = Arc::new(ctx);
        let supervisors: Arc<DashMap<ConnectionId, SupervisorHandle>> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();
        let (parent, mut requests) = mpsc::unbounded_channel();

        let router_cache = RouterCache::new();
        router_cache.spawn_listener(&ctx.bus, cancel.clone());

        let map = supervisors.clone();
        let stop = cancel.clone();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        request = requests.recv() => match request {
                            Some(ParentMessage::Passivate { connection_id, incarnation, reason }) => {
                                let removed = map.remove_if(&connection_id, |_, h| h.incarnation() == incarnation);
                                match removed {
                                    Some((_, handle)) => {
                                        info!(%connection_id, incarnation, reason, "supervisor passivated");
                                        handle.stop().await;
                                    }
                                    None => debug!(%connection_id, incarnation, "stale passivation request"),
                                }
                            }
                            None => break,
                        },
                    }
                }
            }
            .instrument(tracing::info_span!("registry")),
        );

        Self {
            ctx,
            supervisors,
            incarnations: AtomicU64::new(0),
            parent,
            router_cache,
            cancel,
        }
    }

    pub fn context(&self) -> &SupervisorContext {
        &self.ctx
    }

    /// Live supervisor for `id`, spawning a new incarnation when there is none.
    pub fn handle(&self, id: &ConnectionId) -> SupervisorHandle {
        let mut entry = self
            .supervisors
            .entry(id.clone())
            .or_insert_with(|| self.spawn(id));
        if !entry.is_alive() {
            *entry = self.spawn(id);
        }
        entry.value().clone()
    }

    fn spawn(&self, id: &ConnectionId) -> SupervisorHandle {
        let incarnation = self.incarnations.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(connection_id = %id, incarnation, "spawning supervisor");
        ConnectionSupervisor::spawn(id.clone(), incarnation, self.ctx.clone(), self.parent.clone())
    }

    pub async fn ask(&self, id: &ConnectionId, command: SupervisorCommand, headers: Headers) -> CommandResult {
        let timeout = self.ctx.settings.supervisor.ask_timeout();
        self.handle(id).ask(command, headers, timeout).await
    }

    /// Forward `signal` to a running supervisor. Never spawns one.
    pub fn dispatch(&self, id: &ConnectionId, signal: Arc<Signal>) -> bool {
        self.supervisors
            .get(id)
            .is_some_and(|h| h.is_alive() && h.dispatch(signal))
    }

    /// Forward `signal` to every running supervisor; returns how many accepted it.
    pub fn broadcast(&self, signal: Signal) -> usize {
        let signal = Arc::new(signal);
        self.handles()
            .into_iter()
            .filter(|h| h.is_alive() && h.dispatch(signal.clone()))
            .count()
    }

    pub fn router_cache(&self) -> &RouterCache {
        &self.router_cache
    }

    pub fn is_live(&self, id: &ConnectionId) -> bool {
        self.supervisors.get(id).is_some_and(|h| h.is_alive())
    }

    pub fn live_count(&self) -> usize {
        self.supervisors.iter().filter(|e| e.value().is_alive()).count()
    }

    /// Spawn a supervisor for every journaled connection. Each recovers its
    /// own state and reopens itself when its desired status is open.
    pub fn recover_all(&self) -> Result<Vec<ConnectionId>, StoreError> {
        let ids = self.ctx.journal.connection_ids()?;
        for id in &ids {
            self.handle(id);
        }
        info!(connections = ids.len(), "connections recovered");
        Ok(ids)
    }

    /// Running connections ordered by descending usage priority.
    pub async fn prioritized(&self) -> Vec<(ConnectionId, i32)> {
        let estimator = PriorityEstimator::new(self.ctx.settings.priority.ask_timeout());
        let handles = self.handles();
        estimator.rank(&handles).await
    }

    /// Stop every supervisor and the background listeners.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = self.handles();
        self.supervisors.clear();
        join_all(handles.iter().map(SupervisorHandle::stop)).await;
        info!(stopped = handles.len(), "registry shut down");
    }

    fn handles(&self) -> Vec<SupervisorHandle> {
        self.supervisors.iter().map(|e| e.value().clone()).collect()
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use twinbridge_core::commands::ResponseKind;
    use twinbridge_core::errors::ConnectivityError;
    use twinbridge_core::model::{Connection, ConnectionType, Topic};
    use twinbridge_settings::ConnectivitySettings;
    use twinbridge_store::InMemoryJournal;

    use crate::pool::loopback::LoopbackFactory;
    use crate::validation::{CommandInterceptor, CommandKind};

    fn registry(interceptor: Option<Arc<dyn CommandInterceptor>>) -> ConnectionRegistry {
        let mut settings = ConnectivitySettings::default();
        settings.health.interval_ms = 100;
        settings.health.timeout_ms = 50;
        let ctx = SupervisorContext::new(settings, Arc::new(InMemoryJournal::new()), Arc::new(LoopbackFactory::new()))
            .unwrap();
        let ctx = match interceptor {
            Some(i) => ctx.with_interceptor(i),
            None => ctx,
        };
        ConnectionRegistry::new(ctx)
    }

    fn connection(id: &ConnectionId) -> Connection {
        Connection::new(id.clone(), ConnectionType::Mqtt, "tcp://broker:1883")
    }

    async fn until_passivated(registry: &ConnectionRegistry, id: &ConnectionId) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.is_live(id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn one_supervisor_per_id() {
        let registry = registry(None);
        let id = ConnectionId::from_raw("c-1");
        let a = registry.handle(&id);
        let b = registry.handle(&id);
        assert_eq!(a.incarnation(), b.incarnation());
        assert_eq!(registry.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_never_spawns() {
        let registry = registry(None);
        let signal = Arc::new(Signal::new(Topic::TwinEvents, "ns:thing"));
        assert!(!registry.dispatch(&ConnectionId::from_raw("unknown"), signal));
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn passivated_supervisor_respawns_from_journal() {
        let deny_open = |kind: CommandKind, _: &Connection, _: &Headers| -> Result<(), String> {
            match kind {
                CommandKind::Open => Err("maintenance window".to_string()),
                _ => Ok(()),
            }
        };
        let registry = registry(Some(Arc::new(deny_open)));
        let id = ConnectionId::from_raw("c-2");

        registry
            .ask(&id, SupervisorCommand::Create(connection(&id)), Headers::new())
            .await
            .unwrap();
        let failure = registry.ask(&id, SupervisorCommand::Open, Headers::new()).await.unwrap_err();
        assert_matches!(failure.error, ConnectivityError::ValidatorRejection(_));

        until_passivated(&registry, &id).await;
        let response = registry
            .ask(&id, SupervisorCommand::RetrieveConnection, Headers::new())
            .await
            .unwrap();
        assert_matches!(response.kind, ResponseKind::Connection(c) if c.revision() == 1);
        assert_eq!(registry.handle(&id).incarnation(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_all_spawns_journaled_connections() {
        let journal = Arc::new(InMemoryJournal::new());
        let ids = [ConnectionId::from_raw("r-1"), ConnectionId::from_raw("r-2")];
        for id in &ids {
            journal
                .append(
                    id,
                    1,
                    &twinbridge_core::events::ConnectionEvent::Created { connection: connection(id) },
                )
                .unwrap();
        }
        let ctx = SupervisorContext::new(ConnectivitySettings::default(), journal, Arc::new(LoopbackFactory::new()))
            .unwrap();
        let registry = ConnectionRegistry::new(ctx);

        assert_eq!(registry.recover_all().unwrap(), ids.to_vec());
        assert_eq!(registry.live_count(), 2);

        let ranked = registry.prioritized().await;
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|(_, p)| *p == 0));

        registry.shutdown().await;
        assert_eq!(registry.live_count(), 0);
    }
}
