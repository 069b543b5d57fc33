//! Persisted connection events and cluster announcements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ConnectionId;
use crate::model::{Connection, ConnectivityStatus, Lifecycle};
use crate::pool::WorkerRef;

/// Journal entry payload. Applying the events of a connection in revision
/// order reproduces its current state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Created { connection: Connection },
    Modified { connection: Connection },
    Opened,
    Closed,
    Deleted,
}

impl ConnectionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Modified { .. } => "modified",
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Deleted => "deleted",
        }
    }

    /// Fold this event onto the previous state.
    pub fn apply(
        &self,
        current: Option<Connection>,
        revision: u64,
        timestamp: DateTime<Utc>,
    ) -> Option<Connection> {
        match self {
            Self::Created { connection } => Some(
                connection
                    .clone()
                    .with_lifecycle(Lifecycle::Active)
                    .with_revision(revision)
                    .with_created(Some(timestamp))
                    .with_modified(timestamp),
            ),
            Self::Modified { connection } => {
                let created = current.as_ref().and_then(Connection::created);
                Some(
                    connection
                        .clone()
                        .with_lifecycle(Lifecycle::Active)
                        .with_revision(revision)
                        .with_created(created)
                        .with_modified(timestamp),
                )
            }
            Self::Opened => current.map(|c| {
                c.with_status(ConnectivityStatus::Open)
                    .with_revision(revision)
                    .with_modified(timestamp)
            }),
            Self::Closed => current.map(|c| {
                c.with_status(ConnectivityStatus::Closed)
                    .with_revision(revision)
                    .with_modified(timestamp)
            }),
            Self::Deleted => current.map(|c| {
                c.with_lifecycle(Lifecycle::Deleted)
                    .with_revision(revision)
                    .with_modified(timestamp)
            }),
        }
    }
}

/// Cluster-wide pub-sub notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterAnnouncement {
    /// Live worker refs of a connection, gossiped whenever the membership changes.
    WorkersAnnounced {
        connection_id: ConnectionId,
        workers: Vec<WorkerRef>,
    },
    /// The connection is gone; forget its workers.
    ConnectionDeleted { connection_id: ConnectionId },
}

impl ClusterAnnouncement {
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            Self::WorkersAnnounced { connection_id, .. } | Self::ConnectionDeleted { connection_id } => {
                connection_id
            }
        }
    }
}
