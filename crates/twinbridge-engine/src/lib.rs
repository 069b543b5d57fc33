//! Connection lifecycle engine: supervisors, worker pools, quorum health
//! checks, escalation, signal routing and usage-based prioritization.

pub mod cluster;
pub mod connlog;
pub mod escalation;
pub mod health;
pub mod measurements;
pub mod pool;
pub mod priority;
pub mod registry;
pub mod routing;
pub mod supervisor;
pub mod validation;

pub use cluster::{ClusterBus, RouterCache};
pub use escalation::{Decision, EscalationPolicy, PolicyError, RestartCounterStore, RestartCounters};
pub use health::{Ping, PoolHealthMonitor, Pong, SnapshotReceiver};
pub use pool::client::{ClientContext, ClientError, InstantiationError, OutboundMessage, ProtocolClient, WorkerFactory};
pub use pool::loopback::LoopbackFactory;
pub use priority::{priority, PriorityEstimator};
pub use registry::ConnectionRegistry;
pub use routing::rql::RqlCompiler;
pub use routing::{RoutingTable, SignalRouter};
pub use supervisor::{ConnectionSupervisor, ParentMessage, SupervisorContext, SupervisorHandle};
pub use validation::hosts::{HostResolver, HostValidator, StaticResolver, SystemResolver};
pub use validation::{AcceptAll, CommandInterceptor, CommandKind, ConnectionValidator};
