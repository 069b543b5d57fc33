use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, NodeId, WorkerId};

/// Address of one protocol worker. Ordered by node, connection, then worker id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRef {
    node: NodeId,
    connection_id: ConnectionId,
    worker_id: WorkerId,
}

impl WorkerRef {
    pub fn new(node: NodeId, connection_id: ConnectionId) -> Self {
        Self::from_parts(node, connection_id, WorkerId::new())
    }

    pub fn from_parts(node: NodeId, connection_id: ConnectionId, worker_id: WorkerId) -> Self {
        Self {
            node,
            connection_id,
            worker_id,
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.connection_id, self.worker_id)
    }
}

/// Last complete set of live workers, replaced wholesale each round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    round: u64,
    workers: Vec<WorkerRef>,
}

impl PoolSnapshot {
    /// Sorts and deduplicates the responders.
    pub fn from_responders(round: u64, responders: impl IntoIterator<Item = WorkerRef>) -> Self {
        let workers: BTreeSet<WorkerRef> = responders.into_iter().collect();
        Self {
            round,
            workers: workers.into_iter().collect(),
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn workers(&self) -> &[WorkerRef] {
        &self.workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn contains(&self, worker: &WorkerRef) -> bool {
        self.workers.binary_search(worker).is_ok()
    }

    /// Stable choice of a worker for a routing key.
    pub fn select(&self, key: &str) -> Option<&WorkerRef> {
        if self.workers.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.workers.len() as u64) as usize;
        self.workers.get(idx)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connect,
    Publish,
    Crashed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connect"),
            Self::Publish => f.write_str("publish"),
            Self::Crashed => f.write_str("crashed"),
        }
    }
}

/// Cause attached to a worker failure report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl WorkerFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}
