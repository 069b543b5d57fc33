//! Protocol client seam.
//!
//! A [`WorkerFactory`] creates one [`ProtocolClient`] per worker. The engine
//! never talks to a broker directly; it drives clients through this trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use twinbridge_core::headers::Headers;
use twinbridge_core::model::{Connection, Target, Topic};
use twinbridge_core::pool::{FailureKind, WorkerFailure, WorkerRef};
use twinbridge_core::signal::Signal;

use crate::measurements::{ConnectionMeasurements, Direction, Outcome, SharedMeasurements};
use crate::routing::mapping;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("disconnect failed: {0}")]
    Disconnect(String),
}

impl ClientError {
    pub fn failure(&self) -> WorkerFailure {
        match self {
            Self::Connect(msg) => WorkerFailure::new(FailureKind::Connect, msg.clone()),
            Self::Publish(msg) => WorkerFailure::new(FailureKind::Publish, msg.clone()),
            Self::Disconnect(msg) => WorkerFailure::new(FailureKind::Crashed, msg.clone()),
        }
    }
}

/// A client could not be constructed from the connection definition.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct InstantiationError(pub String);

/// Message for one target, with mapped headers.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundMessage {
    pub address: String,
    pub headers: BTreeMap<String, String>,
    pub topic: Topic,
    pub entity_id: String,
    pub action: String,
    pub payload: Value,
}

impl OutboundMessage {
    pub fn for_target(target: &Target, signal: &Signal) -> Self {
        Self {
            address: target.address().to_owned(),
            headers: mapping::map_headers(target, signal),
            topic: signal.topic(),
            entity_id: signal.entity_id().to_owned(),
            action: signal.action().to_owned(),
            payload: signal.payload().clone(),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers
            .get(twinbridge_core::headers::CORRELATION_ID)
            .map(String::as_str)
    }
}

/// What a client sees of its worker.
#[derive(Clone)]
pub struct ClientContext {
    connection: Arc<Connection>,
    worker: WorkerRef,
    headers: Headers,
    measurements: SharedMeasurements,
}

impl ClientContext {
    pub fn new(
        connection: Arc<Connection>,
        worker: WorkerRef,
        headers: Headers,
        measurements: SharedMeasurements,
    ) -> Self {
        Self {
            connection,
            worker,
            headers,
            measurements,
        }
    }

    /// Context for a throwaway connection test; nothing is measured.
    pub fn dry_run(connection: Arc<Connection>, worker: WorkerRef, headers: Headers) -> Self {
        Self::new(connection, worker, headers.with_dry_run(), ConnectionMeasurements::shared(1))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn worker(&self) -> &WorkerRef {
        &self.worker
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Dry-run clients must not create resources on the broker.
    pub fn is_dry_run(&self) -> bool {
        self.headers.is_dry_run()
    }

    /// Count a message consumed from `address`.
    pub fn record_consumed(&self, address: &str, success: bool) {
        let outcome = if success { Outcome::Success } else { Outcome::Failure };
        self.measurements
            .lock()
            .record(Direction::Inbound, address, outcome, Utc::now());
    }
}

#[async_trait]
pub trait ProtocolClient: Send {
    async fn connect(&mut self, ctx: &ClientContext) -> Result<(), ClientError>;
    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), ClientError>;
    async fn disconnect(&mut self) -> Result<(), ClientError>;
}

pub trait WorkerFactory: Send + Sync {
    fn create(&self, connection: &Connection, headers: &Headers) -> Result<Box<dyn ProtocolClient>, InstantiationError>;
}
