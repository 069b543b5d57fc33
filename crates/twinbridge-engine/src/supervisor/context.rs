use std::sync::Arc;

use twinbridge_core::ids::NodeId;
use twinbridge_core::predicate::PredicateCompiler;
use twinbridge_settings::{ConnectivitySettings, SettingsError};
use twinbridge_store::ConnectionJournal;
use twinbridge_telemetry::MetricsRecorder;

use crate::cluster::ClusterBus;
use crate::escalation::EscalationPolicy;
use crate::pool::client::WorkerFactory;
use crate::pool::PoolConfig;
use crate::routing::rql::RqlCompiler;
use crate::validation::hosts::{HostResolver, HostValidator, SystemResolver};
use crate::validation::{AcceptAll, CommandInterceptor, ConnectionValidator};

/// Node-wide collaborators shared by every supervisor.
#[derive(Clone)]
pub struct SupervisorContext {
    pub settings: Arc<ConnectivitySettings>,
    pub journal: Arc<dyn ConnectionJournal>,
    pub factory: Arc<dyn WorkerFactory>,
    pub validator: ConnectionValidator,
    pub interceptor: Arc<dyn CommandInterceptor>,
    pub bus: ClusterBus,
    pub metrics: Arc<MetricsRecorder>,
    pub policy: EscalationPolicy,
    pub pool_config: PoolConfig,
    pub local_node: NodeId,
}

impl SupervisorContext {
    /// Validate `settings` and build the default collaborators: system DNS,
    /// the RQL compiler and an interceptor that accepts everything.
    pub fn new(
        settings: ConnectivitySettings,
        journal: Arc<dyn ConnectionJournal>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        let hosts = HostValidator::from_settings(&settings.hosts, Arc::new(SystemResolver))?;
        let policy = EscalationPolicy::new(settings.supervisor.worker_retries_until_escalate)
            .map_err(|e| SettingsError::InvalidValue(e.to_string()))?;
        Ok(Self {
            validator: ConnectionValidator::new(hosts, Arc::new(RqlCompiler)),
            interceptor: Arc::new(AcceptAll),
            bus: ClusterBus::new(settings.cluster.bus_capacity),
            metrics: Arc::new(MetricsRecorder::new()),
            policy,
            pool_config: PoolConfig::from_settings(&settings),
            local_node: NodeId::from_raw(settings.cluster.local_node.clone()),
            settings: Arc::new(settings),
            journal,
            factory,
        })
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.validator = self.validator.with_resolver(resolver);
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn PredicateCompiler>) -> Self {
        self.validator = self.validator.with_compiler(compiler);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_bus(mut self, bus: ClusterBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = policy;
        self
    }
}
