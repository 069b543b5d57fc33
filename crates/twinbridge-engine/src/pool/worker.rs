//! One protocol worker task.
//!
//! A worker owns its client, its measurements and its log rings. It answers
//! health pings only while its client is connected and reports starts and
//! failures to the owning supervisor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn, Instrument};

use twinbridge_core::headers::Headers;
use twinbridge_core::logs::{LogCategory, LogEntry, LogLevel, LogType};
use twinbridge_core::metrics::ConnectionMetrics;
use twinbridge_core::model::Connection;
use twinbridge_core::pool::{FailureKind, WorkerFailure, WorkerRef};
use twinbridge_settings::ConnectionLogSettings;
use twinbridge_telemetry::MetricsRecorder;

use crate::connlog::{self, ConnectionLogger};
use crate::health::{Ping, Pong};
use crate::measurements::{ConnectionMeasurements, Direction, Outcome, SharedMeasurements};
use crate::pool::client::{ClientContext, OutboundMessage, ProtocolClient, WorkerFactory};

/// Lifecycle reports sent to the supervisor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    Started(WorkerRef),
    Failed { worker: WorkerRef, failure: WorkerFailure },
}

pub(crate) enum WorkerCommand {
    Publish(OutboundMessage),
    Close { ack: oneshot::Sender<()> },
    RetrieveMetrics { reply: oneshot::Sender<ConnectionMetrics> },
    RetrieveLogs { reply: oneshot::Sender<Vec<LogEntry>> },
    ResetMetrics,
    ResetLogs,
    EnableLogs { until: DateTime<Utc> },
}

/// Supervision requests. They travel on their own channel so a mailbox
/// full of publishes cannot hold them back.
pub(crate) enum WorkerControl {
    Restart,
}

/// Mailbox of a running worker.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    worker: WorkerRef,
    tx: mpsc::Sender<WorkerCommand>,
    control: mpsc::UnboundedSender<WorkerControl>,
}

impl WorkerHandle {
    pub(crate) fn worker(&self) -> &WorkerRef {
        &self.worker
    }

    /// Non-blocking send; false when the mailbox is full or the worker is gone.
    pub(crate) fn try_send(&self, command: WorkerCommand) -> bool {
        self.tx.try_send(command).is_ok()
    }

    /// False only when the worker task is gone.
    pub(crate) fn restart(&self) -> bool {
        self.control.send(WorkerControl::Restart).is_ok()
    }

    /// Ask the worker to disconnect and stop. Resolves once it has.
    pub(crate) async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(WorkerCommand::Close { ack }).await.is_ok() {
            let _ = done.await;
        }
    }

    pub(crate) async fn metrics(&self) -> Option<ConnectionMetrics> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(WorkerCommand::RetrieveMetrics { reply }).await.ok()?;
        rx.await.ok()
    }

    pub(crate) async fn logs(&self) -> Option<Vec<LogEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(WorkerCommand::RetrieveLogs { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Everything a worker needs besides its client.
pub(crate) struct WorkerSpec {
    pub worker: WorkerRef,
    pub connection: Arc<Connection>,
    pub headers: Headers,
    pub factory: Arc<dyn WorkerFactory>,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    pub pings: broadcast::Receiver<Ping>,
    pub mailbox: usize,
    pub logs: ConnectionLogSettings,
    pub window_hours: u32,
    pub metrics: Arc<MetricsRecorder>,
}

pub(crate) fn spawn_worker(spec: WorkerSpec, client: Box<dyn ProtocolClient>) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(spec.mailbox.max(1));
    let (control, control_rx) = mpsc::unbounded_channel();
    let handle = WorkerHandle {
        worker: spec.worker.clone(),
        tx,
        control,
    };
    let span = tracing::info_span!("worker", worker = %spec.worker);
    let WorkerSpec {
        worker,
        connection,
        headers,
        factory,
        events,
        pings,
        logs,
        window_hours,
        metrics,
        ..
    } = spec;
    let measurements = ConnectionMeasurements::shared(window_hours);
    let state = Worker {
        context: ClientContext::new(connection, worker.clone(), headers, measurements.clone()),
        worker,
        factory,
        client,
        connected: false,
        events,
        measurements,
        logger: ConnectionLogger::new(&logs),
        metrics,
    };
    tokio::spawn(state.run(rx, control_rx, pings).instrument(span));
    handle
}

struct Worker {
    worker: WorkerRef,
    context: ClientContext,
    factory: Arc<dyn WorkerFactory>,
    client: Box<dyn ProtocolClient>,
    connected: bool,
    events: mpsc::UnboundedSender<WorkerEvent>,
    measurements: SharedMeasurements,
    logger: ConnectionLogger,
    metrics: Arc<MetricsRecorder>,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<WorkerCommand>,
        mut control: mpsc::UnboundedReceiver<WorkerControl>,
        mut pings: broadcast::Receiver<Ping>,
    ) {
        self.connect().await;
        loop {
            tokio::select! {
                biased;
                request = control.recv() => match request {
                    Some(WorkerControl::Restart) => self.restart().await,
                    None => break,
                },
                command = rx.recv() => match command {
                    Some(WorkerCommand::Close { ack }) => {
                        self.disconnect().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                ping = pings.recv() => match ping {
                    Ok(ping) => {
                        if self.connected {
                            let _ = ping.reply_to.send(Pong {
                                round: ping.round,
                                worker: self.worker.clone(),
                            });
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "missed health pings"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        if self.connected {
            self.disconnect().await;
        }
        debug!("worker stopped");
    }

    async fn handle(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Publish(message) => self.publish(message).await,
            WorkerCommand::RetrieveMetrics { reply } => {
                let _ = reply.send(self.measurements.lock().snapshot(Utc::now()));
            }
            WorkerCommand::RetrieveLogs { reply } => {
                let _ = reply.send(self.logger.entries());
            }
            WorkerCommand::ResetMetrics => self.measurements.lock().reset(),
            WorkerCommand::ResetLogs => self.logger.clear(),
            WorkerCommand::EnableLogs { until } => self.logger.enable_until(until),
            WorkerCommand::Close { ack } => {
                let _ = ack.send(());
            }
        }
    }

    async fn connect(&mut self) {
        match self.client.connect(&self.context).await {
            Ok(()) => {
                self.connected = true;
                info!(uri = %self.context.connection().uri(), "worker connected");
                self.log(LogCategory::Connection, LogType::Other, LogLevel::Success, None, "connected");
                let _ = self.events.send(WorkerEvent::Started(self.worker.clone()));
            }
            Err(e) => {
                self.connected = false;
                warn!(error = %e, "worker failed to connect");
                self.log(LogCategory::Connection, LogType::Other, LogLevel::Failure, None, &e.to_string());
                self.fail(e.failure());
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "disconnect failed");
        }
        self.connected = false;
    }

    /// Recreate the client from the connection definition and reconnect.
    async fn restart(&mut self) {
        if self.connected {
            self.disconnect().await;
        }
        match self.factory.create(self.context.connection(), self.context.headers()) {
            Ok(client) => {
                self.client = client;
                self.connect().await;
            }
            Err(e) => {
                warn!(error = %e, "worker could not be recreated");
                self.fail(WorkerFailure::new(FailureKind::Crashed, e.0));
            }
        }
    }

    async fn publish(&mut self, message: OutboundMessage) {
        let connection_id = self.worker.connection_id().to_string();
        let labels = [("connection", connection_id.as_str())];
        if !self.connected {
            self.record(&message.address, Outcome::Dropped);
            self.metrics.counter_inc("worker.dropped", &labels, 1);
            self.log_message(&message, LogType::Dropped, LogLevel::Failure, "worker not connected");
            return;
        }
        match self.client.publish(&message).await {
            Ok(()) => {
                self.record(&message.address, Outcome::Success);
                self.metrics.counter_inc("worker.published", &labels, 1);
                self.log_message(&message, LogType::Published, LogLevel::Success, "published");
            }
            Err(e) => {
                self.record(&message.address, Outcome::Failure);
                self.metrics.counter_inc("worker.publish_failures", &labels, 1);
                self.log_message(&message, LogType::Published, LogLevel::Failure, &e.to_string());
                self.fail(e.failure());
            }
        }
    }

    fn fail(&self, failure: WorkerFailure) {
        let _ = self.events.send(WorkerEvent::Failed {
            worker: self.worker.clone(),
            failure,
        });
    }

    fn record(&self, address: &str, outcome: Outcome) {
        self.measurements
            .lock()
            .record(Direction::Outbound, address, outcome, Utc::now());
    }

    fn log(&mut self, category: LogCategory, log_type: LogType, level: LogLevel, address: Option<&str>, message: &str) {
        self.logger.log(connlog::entry(
            category,
            log_type,
            level,
            address,
            self.context.headers().correlation_id(),
            message,
        ));
    }

    fn log_message(&mut self, message: &OutboundMessage, log_type: LogType, level: LogLevel, text: &str) {
        self.logger.log(connlog::entry(
            LogCategory::Target,
            log_type,
            level,
            Some(&message.address),
            message.correlation_id(),
            text,
        ));
    }
}
