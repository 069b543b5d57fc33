//! Worker placement across cluster nodes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use twinbridge_core::ids::{ConnectionId, NodeId};

/// Node for each of `client_count` workers.
///
/// Round-robin starting at an offset derived from the connection id, so
/// different connections start on different nodes and no node gets more
/// than `ceil(client_count / nodes)` workers.
pub fn assign_nodes(connection_id: &ConnectionId, client_count: usize, nodes: &[NodeId]) -> Vec<NodeId> {
    if nodes.is_empty() {
        return Vec::new();
    }
    let mut hasher = DefaultHasher::new();
    connection_id.hash(&mut hasher);
    let offset = (hasher.finish() % nodes.len() as u64) as usize;
    (0..client_count)
        .map(|i| nodes[(offset + i) % nodes.len()].clone())
        .collect()
}
