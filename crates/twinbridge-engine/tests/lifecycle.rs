//! End-to-end connection lifecycles through the registry.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use twinbridge_core::commands::{ConnectionStatusReport, LiveStatus, ResponseKind, SupervisorCommand};
use twinbridge_core::errors::ConnectivityError;
use twinbridge_core::events::ClusterAnnouncement;
use twinbridge_core::headers::Headers;
use twinbridge_core::ids::ConnectionId;
use twinbridge_core::model::{Connection, ConnectionType, ConnectivityStatus, Target, Topic};
use twinbridge_engine::{ConnectionRegistry, LoopbackFactory, StaticResolver, SupervisorContext};
use twinbridge_settings::ConnectivitySettings;
use twinbridge_store::{ConnectionJournal, Database, InMemoryJournal, SqliteJournal};

fn settings() -> ConnectivitySettings {
    let mut settings = ConnectivitySettings::default();
    settings.cluster.nodes = vec!["node-1".into(), "node-2".into()];
    settings.health.interval_ms = 100;
    settings.health.timeout_ms = 50;
    settings.supervisor.open_timeout_ms = 2_000;
    settings.supervisor.close_timeout_ms = 500;
    settings.supervisor.test_timeout_ms = 300;
    settings.supervisor.deletion_grace_ms = 200;
    settings
}

fn registry_with(
    settings: ConnectivitySettings,
    journal: Arc<dyn ConnectionJournal>,
    factory: &LoopbackFactory,
) -> ConnectionRegistry {
    let ctx = SupervisorContext::new(settings, journal, Arc::new(factory.clone()))
        .unwrap()
        .with_resolver(Arc::new(
            StaticResolver::new().with("broker.example", ["198.51.100.10".parse::<IpAddr>().unwrap()]),
        ));
    ConnectionRegistry::new(ctx)
}

fn connection(id: &ConnectionId, status: ConnectivityStatus, clients: u32) -> Connection {
    Connection::new(id.clone(), ConnectionType::Mqtt, "tcp://broker.example:1883")
        .with_status(status)
        .with_client_count(clients)
        .with_target(
            Target::new("devices/{{ entity:name }}/events")
                .with_subject("integration:fleet")
                .with_topic(Topic::TwinEvents),
        )
}

async fn status(registry: &ConnectionRegistry, id: &ConnectionId) -> ConnectionStatusReport {
    let response = registry
        .ask(id, SupervisorCommand::RetrieveStatus, Headers::new())
        .await
        .unwrap();
    assert_matches!(response.kind, ResponseKind::Status(report) => report)
}

#[tokio::test(start_paused = true)]
async fn close_then_open_restores_pool_cardinality() {
    let factory = LoopbackFactory::new();
    let journal = Arc::new(InMemoryJournal::new());
    let registry = registry_with(settings(), journal.clone(), &factory);
    let id = ConnectionId::from_raw("fleet");

    registry
        .ask(&id, SupervisorCommand::Create(connection(&id, ConnectivityStatus::Open, 3)), Headers::new())
        .await
        .unwrap();
    registry.ask(&id, SupervisorCommand::Open, Headers::new()).await.unwrap();
    let before = status(&registry, &id).await;
    assert_eq!(before.live, LiveStatus::Open);
    assert_eq!(before.workers.len(), 3);

    registry.ask(&id, SupervisorCommand::Close, Headers::new()).await.unwrap();
    let closed = status(&registry, &id).await;
    assert_eq!(closed.live, LiveStatus::Closed);
    assert!(closed.workers.is_empty());
    assert_eq!(factory.disconnects(), 3);

    registry.ask(&id, SupervisorCommand::Open, Headers::new()).await.unwrap();
    let after = status(&registry, &id).await;
    assert_eq!(after.live, LiveStatus::Open);
    assert_eq!(after.workers.len(), before.workers.len());
    assert_eq!(after.revision, 3);
    assert_eq!(journal.len(&id), 3);
}

#[tokio::test(start_paused = true)]
async fn commands_echo_correlation_id() {
    let factory = LoopbackFactory::new();
    let registry = registry_with(settings(), Arc::new(InMemoryJournal::new()), &factory);
    let id = ConnectionId::from_raw("echo");

    let ok = registry
        .ask(
            &id,
            SupervisorCommand::Create(connection(&id, ConnectivityStatus::Closed, 1)),
            Headers::new().with_correlation_id("req-1"),
        )
        .await
        .unwrap();
    assert_eq!(ok.headers.correlation_id(), Some("req-1"));

    let failure = registry
        .ask(
            &ConnectionId::from_raw("missing"),
            SupervisorCommand::Open,
            Headers::new().with_correlation_id("req-2"),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.headers.correlation_id(), Some("req-2"));
    assert_eq!(failure.error.status_code(), 404);
}

#[tokio::test(start_paused = true)]
async fn delete_gossips_and_blocks_further_commands() {
    let factory = LoopbackFactory::new();
    let registry = registry_with(settings(), Arc::new(InMemoryJournal::new()), &factory);
    let mut announcements = registry.context().bus.subscribe();
    let id = ConnectionId::from_raw("doomed");

    registry
        .ask(&id, SupervisorCommand::Create(connection(&id, ConnectivityStatus::Open, 2)), Headers::new())
        .await
        .unwrap();
    registry.ask(&id, SupervisorCommand::Open, Headers::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(registry.router_cache().workers(&id).len(), 2);

    let deleted = registry.ask(&id, SupervisorCommand::Delete, Headers::new()).await.unwrap();
    assert_eq!(deleted.kind, ResponseKind::Deleted);
    let again = registry.ask(&id, SupervisorCommand::Delete, Headers::new()).await.unwrap();
    assert_eq!(again.kind, ResponseKind::Deleted);

    let failure = registry
        .ask(&id, SupervisorCommand::RetrieveConnection, Headers::new())
        .await
        .unwrap_err();
    assert_matches!(failure.error, ConnectivityError::NotAccessible(_));

    let mut saw_deletion = false;
    while let Ok(announcement) = announcements.try_recv() {
        saw_deletion |= matches!(announcement, ClusterAnnouncement::ConnectionDeleted { .. });
    }
    assert!(saw_deletion);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(registry.router_cache().workers(&id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn deleted_connection_can_be_recreated() {
    let factory = LoopbackFactory::new();
    let registry = registry_with(settings(), Arc::new(InMemoryJournal::new()), &factory);
    let id = ConnectionId::from_raw("phoenix");

    registry
        .ask(&id, SupervisorCommand::Create(connection(&id, ConnectivityStatus::Closed, 1)), Headers::new())
        .await
        .unwrap();
    registry.ask(&id, SupervisorCommand::Delete, Headers::new()).await.unwrap();

    let recreated = registry
        .ask(&id, SupervisorCommand::Create(connection(&id, ConnectivityStatus::Closed, 1)), Headers::new())
        .await
        .unwrap();
    let conn = assert_matches!(recreated.kind, ResponseKind::Created(c) => c);
    assert_eq!(conn.revision(), 3);
    assert!(!conn.is_deleted());

    // The grace timer of the deletion no longer applies.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(registry.is_live(&id));
}

#[tokio::test(start_paused = true)]
async fn blocked_subnet_is_rejected_before_persistence() {
    let factory = LoopbackFactory::new();
    let journal = Arc::new(InMemoryJournal::new());
    let mut settings = settings();
    settings.hosts.blocked_subnets = vec!["198.51.100.0/24".into()];
    let registry = registry_with(settings, journal.clone(), &factory);
    let id = ConnectionId::from_raw("blocked");

    let failure = registry
        .ask(&id, SupervisorCommand::Create(connection(&id, ConnectivityStatus::Open, 1)), Headers::new())
        .await
        .unwrap_err();
    assert_matches!(failure.error, ConnectivityError::ConfigurationInvalid(_));
    assert_eq!(journal.len(&id), 0);
    assert_eq!(factory.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn metrics_on_closed_connection_start_nothing() {
    let factory = LoopbackFactory::new();
    let registry = registry_with(settings(), Arc::new(InMemoryJournal::new()), &factory);
    let id = ConnectionId::from_raw("idle");

    registry
        .ask(&id, SupervisorCommand::Create(connection(&id, ConnectivityStatus::Closed, 2)), Headers::new())
        .await
        .unwrap();
    let metrics = registry
        .ask(&id, SupervisorCommand::RetrieveMetrics, Headers::new())
        .await
        .unwrap();
    assert_matches!(metrics.kind, ResponseKind::Metrics(m) if m.is_empty());
    assert_eq!(factory.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn modify_restarts_pool_with_new_definition() {
    let factory = LoopbackFactory::new();
    let registry = registry_with(settings(), Arc::new(InMemoryJournal::new()), &factory);
    let id = ConnectionId::from_raw("resized");

    registry
        .ask(&id, SupervisorCommand::Create(connection(&id, ConnectivityStatus::Open, 1)), Headers::new())
        .await
        .unwrap();
    let modified = registry
        .ask(&id, SupervisorCommand::Modify(connection(&id, ConnectivityStatus::Open, 2)), Headers::new())
        .await
        .unwrap();
    let conn = assert_matches!(modified.kind, ResponseKind::Modified(c) => c);
    assert_eq!(conn.revision(), 2);

    let report = status(&registry, &id).await;
    assert_eq!(report.client_count, 2);
    assert_eq!(report.workers.len(), 2);
    assert_eq!(report.live, LiveStatus::Open);
}

#[tokio::test(start_paused = true)]
async fn dry_run_test_leaves_no_trace() {
    let factory = LoopbackFactory::new();
    let journal = Arc::new(InMemoryJournal::new());
    let registry = registry_with(settings(), journal.clone(), &factory);
    let id = ConnectionId::from_raw("dry-run");
    let candidate = connection(&id, ConnectivityStatus::Open, 2);

    let passed = registry
        .ask(&id, SupervisorCommand::Test(candidate.clone()), Headers::new())
        .await
        .unwrap();
    assert_matches!(passed.kind, ResponseKind::TestPassed(_));
    assert_eq!(factory.dry_runs(), 1);
    assert_eq!(journal.len(&id), 0);

    factory.fail_next_connects(1);
    let refused = registry
        .ask(&id, SupervisorCommand::Test(candidate.clone()), Headers::new())
        .await
        .unwrap_err();
    assert_matches!(refused.error, ConnectivityError::ConnectionFailed(_));

    factory.set_connect_delay(Duration::from_secs(1));
    let slow = registry
        .ask(&id, SupervisorCommand::Test(candidate), Headers::new())
        .await
        .unwrap_err();
    assert_matches!(slow.error, ConnectivityError::Unavailable { timeout: Some(_), .. });
}

#[tokio::test(start_paused = true)]
async fn recovers_open_connection_from_sqlite_journal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.db");
    let factory = LoopbackFactory::new();
    let id = ConnectionId::from_raw("durable");

    {
        let journal = Arc::new(SqliteJournal::new(Database::open(&path).unwrap()));
        let registry = registry_with(settings(), journal, &factory);
        registry
            .ask(&id, SupervisorCommand::Create(connection(&id, ConnectivityStatus::Open, 2)), Headers::new())
            .await
            .unwrap();
        registry.shutdown().await;
    }

    let journal = Arc::new(SqliteJournal::new(Database::open(&path).unwrap()));
    let registry = registry_with(settings(), journal, &factory);
    assert_eq!(registry.recover_all().unwrap(), vec![id.clone()]);

    registry.ask(&id, SupervisorCommand::Open, Headers::new()).await.unwrap();
    let report = status(&registry, &id).await;
    assert_eq!(report.revision, 1);
    assert_eq!(report.live, LiveStatus::Open);
    assert_eq!(report.workers.len(), 2);
}
