use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use twinbridge_core::commands::{CommandFailure, CommandResult, SupervisorCommand};
use twinbridge_core::errors::ConnectivityError;
use twinbridge_core::headers::Headers;
use twinbridge_core::ids::ConnectionId;
use twinbridge_core::signal::Signal;

/// Mailbox entries of a supervisor task.
pub(crate) enum SupervisorMessage {
    Command {
        command: SupervisorCommand,
        headers: Headers,
        reply: oneshot::Sender<CommandResult>,
    },
    Dispatch(Arc<Signal>),
    Shutdown,
}

/// Requests a supervisor sends to its registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParentMessage {
    /// Stop this incarnation; it is respawned from the journal on next use.
    Passivate {
        connection_id: ConnectionId,
        incarnation: u64,
        reason: String,
    },
}

/// Address of one supervisor incarnation.
#[derive(Clone, Debug)]
pub struct SupervisorHandle {
    connection_id: ConnectionId,
    incarnation: u64,
    tx: mpsc::Sender<SupervisorMessage>,
}

impl SupervisorHandle {
    pub(crate) fn new(connection_id: ConnectionId, incarnation: u64, tx: mpsc::Sender<SupervisorMessage>) -> Self {
        Self {
            connection_id,
            incarnation,
            tx,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Send `command` and wait for the answer. Enqueueing and answering share
    /// one `timeout`; a supervisor that is gone or too slow answers
    /// `Unavailable`.
    pub async fn ask(&self, command: SupervisorCommand, headers: Headers, timeout: Duration) -> CommandResult {
        let headers = headers.ensure_correlation_id();
        let name = command.name();
        let failure = |headers: Headers, error: ConnectivityError| CommandFailure {
            connection_id: self.connection_id.clone(),
            headers,
            error,
        };

        let (reply, rx) = oneshot::channel();
        let message = SupervisorMessage::Command {
            command,
            headers: headers.clone(),
            reply,
        };
        let exchange = async {
            if self.tx.send(message).await.is_err() {
                return Err(ConnectivityError::unavailable(format!(
                    "supervisor of {} is not running",
                    self.connection_id
                )));
            }
            rx.await
                .map_err(|_| ConnectivityError::unavailable(format!("supervisor of {} stopped before answering", self.connection_id)))
        };
        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => Err(failure(headers, error)),
            Err(_) => Err(failure(headers, ConnectivityError::timed_out(name, timeout))),
        }
    }

    /// Fire-and-forget; false when the mailbox is full or closed.
    pub fn dispatch(&self, signal: Arc<Signal>) -> bool {
        self.tx.try_send(SupervisorMessage::Dispatch(signal)).is_ok()
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub(crate) async fn stop(&self) {
        let _ = self.tx.send(SupervisorMessage::Shutdown).await;
    }
}
