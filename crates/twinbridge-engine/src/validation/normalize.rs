//! Protocol-specific normalization applied before a connection is persisted.

use twinbridge_core::errors::ConnectivityError;
use twinbridge_core::model::{Connection, ConnectionType};

pub const BOOTSTRAP_SERVERS: &str = "bootstrapServers";

/// Lower-case the URI host; for Kafka, make `bootstrapServers` start with the
/// URI authority and drop duplicates.
pub fn normalize(connection: Connection) -> Result<Connection, ConnectivityError> {
    let mut uri = connection.parsed_uri()?;
    uri.host = uri.host.to_ascii_lowercase();
    let connection_type = connection.connection_type();
    let normalized = connection.with_uri(uri.to_string());

    if connection_type != ConnectionType::Kafka {
        return Ok(normalized);
    }

    let default_port = connection_type.default_port(&uri.scheme).unwrap_or(9092);
    let mut servers = vec![uri.authority(default_port)];
    for server in normalized
        .specific(BOOTSTRAP_SERVERS)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
    {
        if !servers.contains(&server) {
            servers.push(server);
        }
    }
    Ok(normalized.with_specific_config(BOOTSTRAP_SERVERS, servers.join(",")))
}
