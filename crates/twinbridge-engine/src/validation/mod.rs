//! Validation pipeline run before a connection definition is accepted.
//!
//! Shape checks, host allow/block lists, protocol normalization and filter
//! compilation happen here. The command interceptor is a separate seam
//! because its rejection also passivates the supervisor.

pub mod hosts;
pub mod normalize;

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use twinbridge_core::errors::ConnectivityError;
use twinbridge_core::headers::Headers;
use twinbridge_core::model::{Connection, ConnectionUri};
use twinbridge_core::predicate::PredicateCompiler;

use crate::routing::RoutingTable;
use hosts::{HostResolver, HostValidator};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Create,
    Modify,
    Open,
    Test,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Open => "open",
            Self::Test => "test",
        }
    }
}

/// External veto over connection commands. A rejection is final.
pub trait CommandInterceptor: Send + Sync {
    fn intercept(&self, kind: CommandKind, connection: &Connection, headers: &Headers) -> Result<(), String>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl CommandInterceptor for AcceptAll {
    fn intercept(&self, _kind: CommandKind, _connection: &Connection, _headers: &Headers) -> Result<(), String> {
        Ok(())
    }
}

impl<F> CommandInterceptor for F
where
    F: Fn(CommandKind, &Connection, &Headers) -> Result<(), String> + Send + Sync,
{
    fn intercept(&self, kind: CommandKind, connection: &Connection, headers: &Headers) -> Result<(), String> {
        self(kind, connection, headers)
    }
}

fn invalid(message: String) -> ConnectivityError {
    ConnectivityError::ConfigurationInvalid(message)
}

/// Structural checks that need no I/O.
pub fn check_shape(connection: &Connection) -> Result<ConnectionUri, ConnectivityError> {
    let uri = connection.parsed_uri()?;
    let connection_type = connection.connection_type();
    if !connection_type.schemes().contains(&uri.scheme.as_str()) {
        return Err(invalid(format!(
            "scheme '{}' not supported by {connection_type}, expected one of {:?}",
            uri.scheme,
            connection_type.schemes()
        )));
    }
    if connection.client_count() < 1 {
        return Err(invalid("clientCount must be at least 1".into()));
    }
    for source in connection.sources() {
        if source.addresses().is_empty() || source.addresses().iter().any(|a| a.trim().is_empty()) {
            return Err(invalid("source addresses must not be empty".into()));
        }
    }
    for target in connection.targets() {
        if target.address().trim().is_empty() {
            return Err(invalid("target address must not be empty".into()));
        }
        if target.authorization_context().is_empty() {
            return Err(invalid(format!(
                "target '{}' needs a non-empty authorization context",
                target.address()
            )));
        }
    }
    Ok(uri)
}

#[derive(Clone)]
pub struct ConnectionValidator {
    hosts: HostValidator,
    compiler: Arc<dyn PredicateCompiler>,
}

impl fmt::Debug for ConnectionValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionValidator").field("hosts", &self.hosts).finish()
    }
}

impl ConnectionValidator {
    pub fn new(hosts: HostValidator, compiler: Arc<dyn PredicateCompiler>) -> Self {
        Self { hosts, compiler }
    }

    pub fn compiler(&self) -> &dyn PredicateCompiler {
        self.compiler.as_ref()
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.hosts = self.hosts.with_resolver(resolver);
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn PredicateCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    /// Normalized connection plus its compiled routing table.
    pub async fn validate(&self, connection: Connection) -> Result<(Connection, RoutingTable), ConnectivityError> {
        let uri = check_shape(&connection)?;
        let port = uri
            .port
            .or_else(|| connection.connection_type().default_port(&uri.scheme))
            .unwrap_or(0);
        self.hosts.validate(&uri.host, port).await?;

        let connection = normalize::normalize(connection)?;
        let table = RoutingTable::compile(&connection, self.compiler.as_ref())?;
        debug!(connection_id = %connection.id(), targets = table.len(), "connection validated");
        Ok((connection, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use twinbridge_core::ids::ConnectionId;
    use twinbridge_core::model::{ConnectionType, Source, Subscription, Target, Topic};
    use twinbridge_settings::HostSettings;

    use crate::routing::rql::RqlCompiler;
    use hosts::StaticResolver;

    fn validator(settings: HostSettings) -> ConnectionValidator {
        let hosts = HostValidator::from_settings(&settings, Arc::new(StaticResolver::new())).unwrap();
        ConnectionValidator::new(hosts, Arc::new(RqlCompiler))
    }

    fn target() -> Target {
        Target::new("telemetry/out")
            .with_subject("integration:client")
            .with_topic(Topic::TwinEvents)
    }

    fn mqtt(uri: &str) -> Connection {
        Connection::new(ConnectionId::from_raw("mqtt-1"), ConnectionType::Mqtt, uri).with_target(target())
    }

    #[test]
    fn shape_rejects_wrong_scheme() {
        assert_matches!(
            check_shape(&mqtt("amqp://broker:5672")),
            Err(ConnectivityError::ConfigurationInvalid(msg)) if msg.contains("scheme")
        );
    }

    #[test]
    fn shape_rejects_zero_clients_and_empty_targets() {
        assert!(check_shape(&mqtt("tcp://broker").with_client_count(0)).is_err());
        assert!(check_shape(&mqtt("tcp://broker").with_targets(vec![Target::new("out")])).is_err());
        assert!(check_shape(&mqtt("tcp://broker").with_source(Source::new(Vec::<String>::new()))).is_err());
        assert!(check_shape(&mqtt("tcp://broker").with_targets(vec![Target::new(" ").with_subject("s")])).is_err());
    }

    #[tokio::test]
    async fn validate_normalizes_and_compiles() {
        let conn = mqtt("tcp://Broker.Example:1883").with_target(
            Target::new("filtered")
                .with_subject("s")
                .with_subscription(Subscription::new(Topic::LiveMessages).with_filter("eq(attributes/on,true)")),
        );
        let (normalized, table) = validator(HostSettings::default()).validate(conn).await.unwrap();
        assert_eq!(normalized.uri(), "tcp://broker.example:1883");
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn bad_filter_is_configuration_invalid() {
        let conn = mqtt("tcp://broker").with_target(
            Target::new("bad")
                .with_subject("s")
                .with_subscription(Subscription::new(Topic::TwinEvents).with_filter("eq(")),
        );
        assert_matches!(
            validator(HostSettings::default()).validate(conn).await,
            Err(ConnectivityError::ConfigurationInvalid(_))
        );
    }

    #[tokio::test]
    async fn blocked_host_fails_before_compilation() {
        let settings = HostSettings {
            blocked_hostnames: vec!["broker".into()],
            ..Default::default()
        };
        assert_matches!(
            validator(settings).validate(mqtt("tcp://broker")).await,
            Err(ConnectivityError::ConfigurationInvalid(msg)) if msg.contains("blocked")
        );
    }

    #[test]
    fn closures_are_interceptors() {
        let deny = |kind: CommandKind, _: &Connection, _: &Headers| -> Result<(), String> {
            match kind {
                CommandKind::Test => Ok(()),
                other => Err(format!("{} not allowed", other.as_str())),
            }
        };
        let conn = mqtt("tcp://broker");
        assert!(deny.intercept(CommandKind::Test, &conn, &Headers::new()).is_ok());
        assert_eq!(
            deny.intercept(CommandKind::Create, &conn, &Headers::new()),
            Err("create not allowed".to_string())
        );
        assert!(AcceptAll.intercept(CommandKind::Open, &conn, &Headers::new()).is_ok());
    }
}
