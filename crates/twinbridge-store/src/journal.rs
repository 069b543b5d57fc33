//! Append-only connection journal contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use twinbridge_core::events::ConnectionEvent;
use twinbridge_core::ids::ConnectionId;
use twinbridge_core::model::Connection;

use crate::error::StoreError;

/// One persisted event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub connection_id: ConnectionId,
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
    pub event: ConnectionEvent,
}

/// Folded state of a connection up to `revision`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub connection_id: ConnectionId,
    pub revision: u64,
    pub timestamp: DateTime<Utc>,
    pub connection: Connection,
}

/// Event log + snapshot store, keyed by connection id and revision.
///
/// `append` is optimistic: `revision` must be exactly one past the highest
/// stored revision for the id, otherwise [`StoreError::RevisionConflict`].
pub trait ConnectionJournal: Send + Sync {
    fn append(
        &self,
        connection_id: &ConnectionId,
        revision: u64,
        event: &ConnectionEvent,
    ) -> Result<JournalEntry, StoreError>;

    /// Events with a revision strictly greater than `after`, ascending.
    fn read_after(&self, connection_id: &ConnectionId, after: u64) -> Result<Vec<JournalEntry>, StoreError>;

    fn save_snapshot(&self, snapshot: &SnapshotEntry) -> Result<(), StoreError>;

    fn load_snapshot(&self, connection_id: &ConnectionId) -> Result<Option<SnapshotEntry>, StoreError>;

    /// Every connection id with at least one event.
    fn connection_ids(&self) -> Result<Vec<ConnectionId>, StoreError>;

    /// Snapshot (if any) plus the events recorded after it.
    fn recover(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<(Option<SnapshotEntry>, Vec<JournalEntry>), StoreError> {
        let snapshot = self.load_snapshot(connection_id)?;
        let after = snapshot.as_ref().map_or(0, |s| s.revision);
        let events = self.read_after(connection_id, after)?;
        Ok((snapshot, events))
    }
}
