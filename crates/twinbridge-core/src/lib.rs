//! Shared vocabulary for the connectivity layer: connection model, signals,
//! commands, persisted events and the error taxonomy.

pub mod commands;
pub mod errors;
pub mod events;
pub mod headers;
pub mod ids;
pub mod logs;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod predicate;
pub mod signal;

pub use errors::ConnectivityError;
pub use headers::Headers;
pub use ids::{ConnectionId, CorrelationId, NodeId, WorkerId};
pub use model::{Connection, ConnectionType, ConnectivityStatus, Lifecycle, Source, Subscription, Target, Topic};
pub use pool::{PoolSnapshot, WorkerRef};
pub use signal::Signal;
