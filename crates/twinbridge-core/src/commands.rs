//! Closed command surface of a connection supervisor.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ConnectivityError;
use crate::headers::Headers;
use crate::ids::ConnectionId;
use crate::logs::ConnectionLogs;
use crate::metrics::ConnectionMetrics;
use crate::model::{Connection, ConnectivityStatus};
use crate::pool::WorkerRef;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorCommand {
    Create(Connection),
    Modify(Connection),
    Open,
    Close,
    Delete,
    Test(Connection),
    RetrieveConnection,
    RetrieveStatus,
    RetrieveMetrics,
    RetrieveLogs,
    ResetMetrics,
    ResetLogs,
    EnableLogs,
}

impl SupervisorCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Modify(_) => "modify",
            Self::Open => "open",
            Self::Close => "close",
            Self::Delete => "delete",
            Self::Test(_) => "test",
            Self::RetrieveConnection => "retrieve_connection",
            Self::RetrieveStatus => "retrieve_status",
            Self::RetrieveMetrics => "retrieve_metrics",
            Self::RetrieveLogs => "retrieve_logs",
            Self::ResetMetrics => "reset_metrics",
            Self::ResetLogs => "reset_logs",
            Self::EnableLogs => "enable_logs",
        }
    }

    /// Commands that never change persisted state.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Self::RetrieveConnection | Self::RetrieveStatus | Self::RetrieveMetrics | Self::RetrieveLogs
        )
    }
}

impl fmt::Display for SupervisorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Observed state of the worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    /// Last snapshot covers every expected worker.
    Open,
    /// Pool running but no complete snapshot yet.
    Degraded,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusReport {
    pub connection_id: ConnectionId,
    pub desired: ConnectivityStatus,
    pub live: LiveStatus,
    pub client_count: u32,
    pub workers: Vec<WorkerRef>,
    pub revision: u64,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    Created(Connection),
    Modified(Connection),
    Opened,
    Closed,
    Deleted,
    TestPassed(String),
    Connection(Connection),
    Status(ConnectionStatusReport),
    Metrics(ConnectionMetrics),
    Logs(ConnectionLogs),
    MetricsReset,
    LogsReset,
    LogsEnabled { until: DateTime<Utc> },
}

/// Successful answer, echoing the request headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub connection_id: ConnectionId,
    pub headers: Headers,
    pub kind: ResponseKind,
}

/// Failed answer, echoing the request headers.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct CommandFailure {
    pub connection_id: ConnectionId,
    pub headers: Headers,
    pub error: ConnectivityError,
}

pub type CommandResult = Result<Response, CommandFailure>;
