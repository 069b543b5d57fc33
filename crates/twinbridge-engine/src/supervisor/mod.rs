//! Per-connection supervisor task.
//!
//! One task per connection id consumes an ordered mailbox, so commands for a
//! connection never interleave. The supervisor owns the current
//! [`Connection`] value and replaces it only by applying an event it has
//! just appended to the journal. Its phase is derived from that value:
//! none is uninitialized, otherwise the lifecycle and desired status decide.

pub mod context;
pub mod handle;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn, Instrument};

use twinbridge_core::commands::{
    CommandFailure, CommandResult, ConnectionStatusReport, LiveStatus, Response, ResponseKind, SupervisorCommand,
};
use twinbridge_core::errors::ConnectivityError;
use twinbridge_core::events::{ClusterAnnouncement, ConnectionEvent};
use twinbridge_core::headers::Headers;
use twinbridge_core::ids::ConnectionId;
use twinbridge_core::logs::{ConnectionLogs, LogCategory, LogLevel, LogType};
use twinbridge_core::metrics::ConnectionMetrics;
use twinbridge_core::model::{Connection, ConnectivityStatus};
use twinbridge_core::pool::WorkerRef;
use twinbridge_core::signal::Signal;
use twinbridge_store::{ConnectionJournal, SnapshotEntry};

use crate::connlog::{self, ConnectionLogger};
use crate::escalation::{Decision, RestartCounterStore, RestartCounters};
use crate::pool::client::ClientContext;
use crate::pool::worker::WorkerEvent;
use crate::pool::{PoolDeps, WorkerPool};
use crate::routing::{RoutingTable, SignalRouter};
use crate::validation::CommandKind;

pub use context::SupervisorContext;
pub(crate) use handle::SupervisorMessage;
pub use handle::{ParentMessage, SupervisorHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Open,
    Closed,
    Deleted,
}

type CommandOutcome = Result<ResponseKind, ConnectivityError>;

pub struct ConnectionSupervisor {
    id: ConnectionId,
    incarnation: u64,
    ctx: Arc<SupervisorContext>,
    parent: mpsc::UnboundedSender<ParentMessage>,
    deps: PoolDeps,
    connection: Option<Connection>,
    routing: Option<RoutingTable>,
    pool: Option<WorkerPool>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    restart_counters: RestartCounters<WorkerRef>,
    instantiation_failures: u32,
    logger: ConnectionLogger,
    router: SignalRouter,
    stop_at: Option<Instant>,
    passivating: bool,
}

impl ConnectionSupervisor {
    /// Spawn the supervisor task. It recovers from the journal before
    /// reading its mailbox.
    pub fn spawn(
        id: ConnectionId,
        incarnation: u64,
        ctx: Arc<SupervisorContext>,
        parent: mpsc::UnboundedSender<ParentMessage>,
    ) -> SupervisorHandle {
        let (tx, mailbox) = mpsc::channel(ctx.settings.supervisor.mailbox_capacity.max(1));
        let (events_tx, events) = mpsc::unbounded_channel();
        let span = tracing::info_span!(
            "supervisor",
            connection_id = %id,
            incarnation,
            node = %ctx.local_node,
        );
        let supervisor = Self {
            deps: PoolDeps {
                factory: ctx.factory.clone(),
                config: ctx.pool_config.clone(),
                events: events_tx,
                bus: ctx.bus.clone(),
                metrics: ctx.metrics.clone(),
            },
            logger: ConnectionLogger::new(&ctx.settings.logs),
            router: SignalRouter::with_metrics(ctx.metrics.clone()),
            id: id.clone(),
            incarnation,
            ctx,
            parent,
            connection: None,
            routing: None,
            pool: None,
            events,
            restart_counters: RestartCounters::new(),
            instantiation_failures: 0,
            stop_at: None,
            passivating: false,
        };
        tokio::spawn(supervisor.run(mailbox).instrument(span));
        SupervisorHandle::new(id, incarnation, tx)
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<SupervisorMessage>) {
        self.recover();
        while !self.passivating {
            let stop_at = self.stop_at;
            tokio::select! {
                message = mailbox.recv() => match message {
                    Some(SupervisorMessage::Command { command, headers, reply }) => {
                        let result = self.handle_command(command, headers).await;
                        let _ = reply.send(result);
                    }
                    Some(SupervisorMessage::Dispatch(signal)) => self.dispatch(&signal),
                    Some(SupervisorMessage::Shutdown) | None => break,
                },
                Some(event) = self.events.recv() => self.on_worker_event(event),
                _ = sleep_until(stop_at.unwrap_or_else(Instant::now)), if stop_at.is_some() => {
                    info!("deletion grace period elapsed");
                    self.request_passivation("connection deleted".to_string());
                }
            }
        }
        self.stop_pool();
        debug!("supervisor stopped");
    }

    fn phase(&self) -> Phase {
        match &self.connection {
            None => Phase::Uninitialized,
            Some(c) if c.is_deleted() => Phase::Deleted,
            Some(c) => match c.status() {
                ConnectivityStatus::Open => Phase::Open,
                ConnectivityStatus::Closed => Phase::Closed,
            },
        }
    }

    // ── recovery & persistence ──────────────────────────────────────────

    fn recover(&mut self) {
        let (snapshot, entries) = match self.ctx.journal.recover(&self.id) {
            Ok(recovered) => recovered,
            Err(e) => {
                error!(error = %e, "journal recovery failed");
                self.request_passivation(format!("recovery failed: {e}"));
                return;
            }
        };
        let replayed = entries.len();
        let mut state = snapshot.map(|s| s.connection);
        for entry in entries {
            state = entry.event.apply(state, entry.revision, entry.timestamp);
        }
        self.connection = state;

        let Some(connection) = self.connection.clone() else {
            return;
        };
        info!(revision = connection.revision(), replayed, phase = ?self.phase(), "connection recovered");

        if connection.is_deleted() {
            self.stop_at = Some(Instant::now() + self.ctx.settings.supervisor.deletion_grace());
            return;
        }
        match RoutingTable::compile(&connection, self.ctx.validator.compiler()) {
            Ok(table) => self.routing = Some(table),
            Err(e) => warn!(error = %e, "recovered connection has an invalid routing table"),
        }
        if connection.status() == ConnectivityStatus::Open {
            if let Err(e) = self.start_pool(&Headers::new().ensure_correlation_id()) {
                warn!(error = %e, "could not reopen recovered connection");
            }
        }
    }

    /// Append `event` at the next revision and fold it into the current state.
    fn persist(&mut self, event: ConnectionEvent) -> Result<Connection, ConnectivityError> {
        let revision = self.connection.as_ref().map_or(0, Connection::revision) + 1;
        let entry = self
            .ctx
            .journal
            .append(&self.id, revision, &event)
            .map_err(|e| ConnectivityError::Internal(format!("journal append failed: {e}")))?;
        let next = event
            .apply(self.connection.clone(), entry.revision, entry.timestamp)
            .ok_or_else(|| ConnectivityError::Internal(format!("{} without a connection", event.event_type())))?;
        self.connection = Some(next.clone());
        debug!(revision, event = event.event_type(), "event persisted");

        if revision % self.ctx.settings.supervisor.snapshot_threshold.max(1) == 0 {
            let snapshot = SnapshotEntry {
                connection_id: self.id.clone(),
                revision,
                timestamp: entry.timestamp,
                connection: next.clone(),
            };
            if let Err(e) = self.ctx.journal.save_snapshot(&snapshot) {
                warn!(revision, error = %e, "snapshot not saved");
            }
        }
        Ok(next)
    }

    fn request_passivation(&mut self, reason: String) {
        if self.passivating {
            return;
        }
        self.passivating = true;
        info!(reason, "requesting passivation");
        let _ = self.parent.send(ParentMessage::Passivate {
            connection_id: self.id.clone(),
            incarnation: self.incarnation,
            reason,
        });
    }

    // ── commands ────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: SupervisorCommand, headers: Headers) -> CommandResult {
        let name = command.name();
        trace!(command = name, correlation_id = ?headers.correlation_id(), "handling command");
        let outcome = match command {
            SupervisorCommand::Create(connection) => self.create(connection, &headers).await,
            SupervisorCommand::Modify(connection) => self.modify(connection, &headers).await,
            SupervisorCommand::Open => self.open(&headers).await,
            SupervisorCommand::Close => self.close().await,
            SupervisorCommand::Delete => self.delete().await,
            SupervisorCommand::Test(connection) => self.test(connection, &headers).await,
            SupervisorCommand::RetrieveConnection => self.retrieve_connection(),
            SupervisorCommand::RetrieveStatus => self.retrieve_status(),
            SupervisorCommand::RetrieveMetrics => self.retrieve_metrics().await,
            SupervisorCommand::RetrieveLogs => self.retrieve_logs().await,
            SupervisorCommand::ResetMetrics => self.reset_metrics(),
            SupervisorCommand::ResetLogs => self.reset_logs(),
            SupervisorCommand::EnableLogs => self.enable_logs(),
        };

        match outcome {
            Ok(kind) => Ok(Response {
                connection_id: self.id.clone(),
                headers,
                kind,
            }),
            Err(error) => {
                warn!(command = name, kind = error.error_kind(), error = %error, "command failed");
                self.ctx.metrics.counter_inc(
                    "supervisor.command_failures",
                    &[("command", name), ("kind", error.error_kind())],
                    1,
                );
                self.log(headers.correlation_id(), format!("{name} failed: {error}"), LogLevel::Failure);
                Err(CommandFailure {
                    connection_id: self.id.clone(),
                    headers,
                    error,
                })
            }
        }
    }

    fn not_accessible(&self) -> ConnectivityError {
        ConnectivityError::NotAccessible(self.id.clone())
    }

    /// Connection for commands that need an initialized, non-deleted one.
    fn accessible(&self) -> Result<&Connection, ConnectivityError> {
        match (&self.connection, self.phase()) {
            (Some(c), Phase::Open | Phase::Closed) => Ok(c),
            _ => Err(self.not_accessible()),
        }
    }

    fn check_id(&self, connection: &Connection) -> Result<(), ConnectivityError> {
        if connection.id() != &self.id {
            return Err(ConnectivityError::ConfigurationInvalid(format!(
                "connection id '{}' does not match '{}'",
                connection.id(),
                self.id
            )));
        }
        Ok(())
    }

    /// A rejection is final and passivates this supervisor.
    fn intercept(&mut self, kind: CommandKind, connection: &Connection, headers: &Headers) -> Result<(), ConnectivityError> {
        if let Err(reason) = self.ctx.interceptor.intercept(kind, connection, headers) {
            warn!(command = kind.as_str(), reason, "command rejected by interceptor");
            self.request_passivation(format!("{} rejected: {reason}", kind.as_str()));
            return Err(ConnectivityError::ValidatorRejection(reason));
        }
        Ok(())
    }

    async fn create(&mut self, connection: Connection, headers: &Headers) -> CommandOutcome {
        if matches!(self.phase(), Phase::Open | Phase::Closed) {
            return Err(match headers.precondition() {
                Some(header) => ConnectivityError::PreconditionFailed {
                    connection_id: self.id.clone(),
                    header: header.to_string(),
                },
                None => ConnectivityError::Conflict(self.id.clone()),
            });
        }
        self.check_id(&connection)?;
        let (connection, table) = self.ctx.validator.validate(connection).await?;
        self.intercept(CommandKind::Create, &connection, headers)?;

        let persisted = self.persist(ConnectionEvent::Created { connection })?;
        self.routing = Some(table);
        self.stop_at = None;
        info!(revision = persisted.revision(), status = %persisted.status(), "connection created");
        self.log(headers.correlation_id(), "connection created".to_string(), LogLevel::Success);

        if persisted.status() == ConnectivityStatus::Open {
            self.start_pool(headers)?;
        }
        Ok(ResponseKind::Created(persisted))
    }

    async fn open(&mut self, headers: &Headers) -> CommandOutcome {
        let phase = self.phase();
        let connection = self.accessible()?.clone();
        if phase == Phase::Open && self.pool.is_some() {
            self.await_pool().await?;
            return Ok(ResponseKind::Opened);
        }
        self.intercept(CommandKind::Open, &connection, headers)?;

        if self.pool.is_none() {
            self.start_pool(headers)?;
        }
        if phase == Phase::Closed {
            if let Err(e) = self.persist(ConnectionEvent::Opened) {
                self.stop_pool();
                return Err(e);
            }
        }
        // Opened is journaled once workers are instantiated. A pool still
        // healing past the timeout stays up and a later Open waits again.
        self.await_pool().await?;
        info!("connection opened");
        self.log(headers.correlation_id(), "connection opened".to_string(), LogLevel::Success);
        Ok(ResponseKind::Opened)
    }

    async fn close(&mut self) -> CommandOutcome {
        if self.accessible()?.status() == ConnectivityStatus::Closed {
            return Ok(ResponseKind::Closed);
        }
        if let Some(pool) = &self.pool {
            pool.close(self.ctx.settings.supervisor.close_timeout()).await?;
        }
        self.persist(ConnectionEvent::Closed)?;
        self.stop_pool();
        info!("connection closed");
        Ok(ResponseKind::Closed)
    }

    async fn modify(&mut self, connection: Connection, headers: &Headers) -> CommandOutcome {
        self.accessible()?;
        self.check_id(&connection)?;
        let (connection, table) = self.ctx.validator.validate(connection).await?;
        self.intercept(CommandKind::Modify, &connection, headers)?;

        if let Some(pool) = &self.pool {
            pool.close(self.ctx.settings.supervisor.close_timeout()).await?;
        }
        self.stop_pool();
        let persisted = self.persist(ConnectionEvent::Modified { connection })?;
        self.routing = Some(table);
        info!(revision = persisted.revision(), "connection modified");

        if persisted.status() == ConnectivityStatus::Open {
            self.start_pool(headers)?;
            self.await_pool().await?;
        }
        Ok(ResponseKind::Modified(persisted))
    }

    async fn delete(&mut self) -> CommandOutcome {
        match self.phase() {
            Phase::Uninitialized => return Err(self.not_accessible()),
            Phase::Deleted => return Ok(ResponseKind::Deleted),
            Phase::Open | Phase::Closed => {}
        }
        self.persist(ConnectionEvent::Deleted)?;
        if let Some(pool) = self.pool.take() {
            if let Err(e) = pool.close(self.ctx.settings.supervisor.close_timeout()).await {
                warn!(error = %e, "workers did not close cleanly on delete");
            }
            pool.stop();
        }
        self.routing = None;
        self.ctx.bus.publish(ClusterAnnouncement::ConnectionDeleted {
            connection_id: self.id.clone(),
        });
        self.stop_at = Some(Instant::now() + self.ctx.settings.supervisor.deletion_grace());
        info!("connection deleted");
        Ok(ResponseKind::Deleted)
    }

    /// Dry run against a throwaway client. Never touches the journal or the pool.
    async fn test(&mut self, connection: Connection, headers: &Headers) -> CommandOutcome {
        self.check_id(&connection)?;
        let (connection, _table) = self.ctx.validator.validate(connection).await?;
        self.intercept(CommandKind::Test, &connection, headers)?;

        let test_headers = headers.clone().with_dry_run();
        let mut client = self
            .ctx
            .factory
            .create(&connection, &test_headers)
            .map_err(|e| ConnectivityError::ConnectionFailed(e.to_string()))?;
        let uri = connection.uri().to_owned();
        let worker = WorkerRef::new(self.ctx.local_node.clone(), self.id.clone());
        let context = ClientContext::dry_run(Arc::new(connection), worker, headers.clone());

        let timeout = self.ctx.settings.supervisor.test_timeout();
        match tokio::time::timeout(timeout, client.connect(&context)).await {
            Ok(Ok(())) => {
                if tokio::time::timeout(timeout, client.disconnect()).await.is_err() {
                    debug!("test client did not disconnect in time");
                }
                info!(uri, "connection test passed");
                Ok(ResponseKind::TestPassed(format!("connected to {uri}")))
            }
            Ok(Err(e)) => Err(ConnectivityError::ConnectionFailed(e.to_string())),
            Err(_) => Err(ConnectivityError::timed_out("connection test", timeout)),
        }
    }

    fn retrieve_connection(&self) -> CommandOutcome {
        Ok(ResponseKind::Connection(self.accessible()?.clone()))
    }

    fn retrieve_status(&self) -> CommandOutcome {
        let connection = self.accessible()?;
        let live = match (connection.status(), &self.pool) {
            (ConnectivityStatus::Closed, _) | (ConnectivityStatus::Open, None) => LiveStatus::Closed,
            (ConnectivityStatus::Open, Some(pool)) if pool.is_complete() => LiveStatus::Open,
            (ConnectivityStatus::Open, Some(_)) => LiveStatus::Degraded,
        };
        let workers = self
            .pool
            .as_ref()
            .and_then(WorkerPool::snapshot)
            .map(|s| s.workers().to_vec())
            .unwrap_or_default();
        Ok(ResponseKind::Status(ConnectionStatusReport {
            connection_id: self.id.clone(),
            desired: connection.status(),
            live,
            client_count: connection.client_count(),
            workers,
            revision: connection.revision(),
            since: connection.modified(),
        }))
    }

    async fn retrieve_metrics(&self) -> CommandOutcome {
        self.accessible()?;
        let metrics = match &self.pool {
            Some(pool) => pool.metrics(self.ctx.settings.health.timeout()).await,
            None => ConnectionMetrics::empty(),
        };
        Ok(ResponseKind::Metrics(metrics))
    }

    async fn retrieve_logs(&self) -> CommandOutcome {
        self.accessible()?;
        let Some(pool) = &self.pool else {
            return Ok(ResponseKind::Logs(ConnectionLogs {
                enabled_until: self.logger.enabled_until(),
                entries: Vec::new(),
            }));
        };
        let mut logs = self.logger.snapshot();
        logs.extend(pool.logs(self.ctx.settings.health.timeout()).await);
        Ok(ResponseKind::Logs(logs))
    }

    fn reset_metrics(&self) -> CommandOutcome {
        self.accessible()?;
        if let Some(pool) = &self.pool {
            pool.reset_metrics();
        }
        Ok(ResponseKind::MetricsReset)
    }

    fn reset_logs(&mut self) -> CommandOutcome {
        self.accessible()?;
        self.logger.clear();
        if let Some(pool) = &self.pool {
            pool.reset_logs();
        }
        Ok(ResponseKind::LogsReset)
    }

    fn enable_logs(&mut self) -> CommandOutcome {
        self.accessible()?;
        let now = Utc::now();
        let until = chrono::Duration::from_std(self.ctx.settings.logs.logging_duration())
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.logger.enable_until(until);
        if let Some(pool) = &self.pool {
            pool.enable_logs(until);
        }
        Ok(ResponseKind::LogsEnabled { until })
    }

    // ── pool ────────────────────────────────────────────────────────────

    /// Start the pool, retrying client instantiation transparently until the
    /// per-connection failure budget is spent; then passivate.
    fn start_pool(&mut self, headers: &Headers) -> Result<(), ConnectivityError> {
        let connection = Arc::new(self.connection.clone().ok_or_else(|| self.not_accessible())?);
        let budget = self.ctx.settings.supervisor.client_actor_restarts_before_escalation;
        loop {
            match WorkerPool::start(connection.clone(), headers, &self.deps) {
                Ok(pool) => {
                    self.instantiation_failures = 0;
                    if let Some(until) = self.logger.enabled_until().filter(|u| *u > Utc::now()) {
                        pool.enable_logs(until);
                    }
                    self.restart_counters = RestartCounters::new();
                    self.pool = Some(pool);
                    return Ok(());
                }
                Err(e) => {
                    self.instantiation_failures += 1;
                    self.ctx.metrics.counter_inc(
                        "supervisor.instantiation_failures",
                        &[("connection", self.id.as_str())],
                        1,
                    );
                    if self.instantiation_failures < budget {
                        warn!(attempt = self.instantiation_failures, budget, error = %e, "worker instantiation failed, retrying");
                        continue;
                    }
                    error!(failures = self.instantiation_failures, error = %e, "worker instantiation failed, escalating");
                    self.request_passivation(format!("worker instantiation failed: {e}"));
                    return Err(ConnectivityError::WorkerInstantiation(e.0));
                }
            }
        }
    }

    /// Wait for a complete pool while still supervising it: worker failures
    /// arriving meanwhile are restarted or escalated as in the main loop.
    async fn await_pool(&mut self) -> Result<(), ConnectivityError> {
        let timeout = self.ctx.settings.supervisor.open_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let Some(pool) = &self.pool else {
                return Err(ConnectivityError::unavailable("worker pool not running"));
            };
            tokio::select! {
                completed = pool.completed() => return completed.map(|_| ()),
                Some(event) = self.events.recv() => self.on_worker_event(event),
                _ = sleep_until(deadline) => {
                    return Err(ConnectivityError::timed_out("worker pool health check", timeout));
                }
            }
            if self.passivating {
                return Err(ConnectivityError::WorkerInstantiation(format!(
                    "worker pool of {} escalated before becoming healthy",
                    self.id
                )));
            }
        }
    }

    fn stop_pool(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.stop();
        }
        self.restart_counters = RestartCounters::new();
    }

    fn on_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started(worker) => {
                if self.pool.as_ref().is_some_and(|p| p.contains(&worker)) {
                    self.restart_counters.reset(&worker);
                    debug!(%worker, "worker started");
                }
            }
            WorkerEvent::Failed { worker, failure } => {
                let Some(pool) = &self.pool else {
                    return;
                };
                if !pool.contains(&worker) {
                    trace!(%worker, "failure of a retired worker");
                    return;
                }
                let mut delivered = true;
                let decision = self.ctx.policy.handle(&mut self.restart_counters, &worker, &failure, |w| {
                    delivered = pool.restart(w);
                });
                if !delivered {
                    warn!(%worker, "restart request not delivered");
                }
                if decision == Decision::Escalate || !delivered {
                    self.log(None, format!("worker {worker} escalated: {failure}"), LogLevel::Failure);
                    self.stop_pool();
                    self.request_passivation(format!("worker {worker} escalated: {failure}"));
                }
            }
        }
    }

    // ── data path ───────────────────────────────────────────────────────

    fn dispatch(&mut self, signal: &Signal) {
        if self.phase() != Phase::Open {
            trace!(entity_id = signal.entity_id(), "connection not open, ignoring signal");
            return;
        }
        let (Some(table), Some(pool)) = (&self.routing, &self.pool) else {
            return;
        };
        let mut dropped = Vec::new();
        for message in self.router.messages(table, signal, self.id.as_str()) {
            let address = message.address.clone();
            if !pool.dispatch(message, signal.entity_id()) {
                dropped.push(address);
            }
        }
        for address in dropped {
            self.ctx.metrics.counter_inc(
                "supervisor.dispatch_dropped",
                &[("connection", self.id.as_str())],
                1,
            );
            let entry = connlog::entry(
                LogCategory::Target,
                LogType::Dropped,
                LogLevel::Failure,
                Some(&address),
                signal.headers().correlation_id(),
                "no live worker accepted the message",
            );
            self.logger.log(entry);
        }
    }

    fn log(&mut self, correlation_id: Option<&str>, message: String, level: LogLevel) {
        let entry = connlog::entry(LogCategory::Connection, LogType::Other, level, None, correlation_id, message);
        self.logger.log(entry);
    }
}
