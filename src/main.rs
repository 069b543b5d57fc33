//! # twinbridge
//!
//! Connectivity node binary: loads settings, opens the connection journal,
//! recovers persisted connections and keeps their supervisors running until
//! interrupted.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;

use twinbridge_core::commands::SupervisorCommand;
use twinbridge_core::{Connection, ConnectivityStatus, Headers};
use twinbridge_engine::{ConnectionRegistry, LoopbackFactory, SupervisorContext};
use twinbridge_store::{Database, SqliteJournal};
use twinbridge_telemetry::{init_telemetry, TelemetryConfig};

/// Twinbridge connectivity node.
#[derive(Parser, Debug)]
#[command(name = "twinbridge", about = "Twinbridge connectivity node")]
struct Cli {
    /// Settings file (defaults to `~/.twinbridge/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Journal database (overrides `store.databasePath`).
    #[arg(long)]
    database: Option<PathBuf>,

    /// JSON array of connections to create on startup.
    #[arg(long)]
    connections: Option<PathBuf>,
}

fn read_seed(path: &Path) -> Result<Vec<Connection>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Create each seed connection that is not journaled yet, then open it when
/// its desired status asks for it.
async fn seed(registry: &ConnectionRegistry, connections: Vec<Connection>) {
    for connection in connections {
        let id = connection.id().clone();
        let open = connection.status() == ConnectivityStatus::Open;
        match registry
            .ask(&id, SupervisorCommand::Create(connection), Headers::new())
            .await
        {
            Ok(_) => tracing::info!(connection_id = %id, "seed connection created"),
            Err(failure) => {
                tracing::warn!(connection_id = %id, error = %failure.error, "seed connection skipped");
                continue;
            }
        }
        if open {
            if let Err(failure) = registry.ask(&id, SupervisorCommand::Open, Headers::new()).await {
                tracing::warn!(connection_id = %id, error = %failure.error, "seed connection did not open");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings = match &args.settings {
        Some(path) => twinbridge_settings::load_settings_from_path(path),
        None => twinbridge_settings::load_settings(),
    }
    .context("Failed to load settings")?;

    let telemetry = init_telemetry(TelemetryConfig::from_levels(
        &settings.telemetry.log_level,
        &settings.telemetry.module_levels,
        settings.telemetry.json_logs,
    ));

    let db_path = args
        .database
        .clone()
        .unwrap_or_else(|| PathBuf::from(&settings.store.database_path));
    let db = Database::open(&db_path).context("Failed to open journal database")?;
    let journal = Arc::new(SqliteJournal::new(db));

    let ctx = SupervisorContext::new(settings, journal, Arc::new(LoopbackFactory::new()))
        .context("Invalid supervisor settings")?
        .with_metrics(telemetry.metrics());
    let registry = ConnectionRegistry::new(ctx);

    let mut announcements = registry.context().bus.subscribe();
    drop(tokio::spawn(async move {
        loop {
            match announcements.recv().await {
                Ok(announcement) => tracing::debug!(?announcement, "cluster announcement"),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "cluster announcements lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    }));

    let recovered = registry.recover_all().context("Failed to recover connections")?;
    tracing::info!(count = recovered.len(), "recovery started");

    if let Some(path) = &args.connections {
        seed(&registry, read_seed(path)?).await;
    }

    for (connection_id, priority) in registry.prioritized().await {
        tracing::info!(%connection_id, priority, "connection priority");
    }

    tracing::info!(
        node = %registry.context().local_node,
        live = registry.live_count(),
        "twinbridge node running"
    );
    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;

    tracing::info!("shutting down");
    registry.shutdown().await;
    Ok(())
}
