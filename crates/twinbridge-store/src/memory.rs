use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use parking_lot::RwLock;

use twinbridge_core::events::ConnectionEvent;
use twinbridge_core::ids::ConnectionId;

use crate::error::StoreError;
use crate::journal::{ConnectionJournal, JournalEntry, SnapshotEntry};

/// Process-local journal for tests and ephemeral nodes.
#[derive(Default)]
pub struct InMemoryJournal {
    events: RwLock<BTreeMap<ConnectionId, Vec<JournalEntry>>>,
    snapshots: RwLock<HashMap<ConnectionId, SnapshotEntry>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events stored for a connection.
    pub fn len(&self, connection_id: &ConnectionId) -> usize {
        self.events.read().get(connection_id).map_or(0, Vec::len)
    }
}

impl ConnectionJournal for InMemoryJournal {
    fn append(
        &self,
        connection_id: &ConnectionId,
        revision: u64,
        event: &ConnectionEvent,
    ) -> Result<JournalEntry, StoreError> {
        let mut events = self.events.write();
        let log = events.entry(connection_id.clone()).or_default();
        let expected = log.last().map_or(1, |e| e.revision + 1);
        if revision != expected {
            return Err(StoreError::RevisionConflict {
                connection_id: connection_id.to_string(),
                expected,
                found: revision,
            });
        }
        let entry = JournalEntry {
            connection_id: connection_id.clone(),
            revision,
            timestamp: Utc::now(),
            event: event.clone(),
        };
        log.push(entry.clone());
        Ok(entry)
    }

    fn read_after(&self, connection_id: &ConnectionId, after: u64) -> Result<Vec<JournalEntry>, StoreError> {
        Ok(self
            .events
            .read()
            .get(connection_id)
            .map(|log| log.iter().filter(|e| e.revision > after).cloned().collect())
            .unwrap_or_default())
    }

    fn save_snapshot(&self, snapshot: &SnapshotEntry) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write();
        let newer = snapshots
            .get(&snapshot.connection_id)
            .map_or(true, |existing| snapshot.revision > existing.revision);
        if newer {
            snapshots.insert(snapshot.connection_id.clone(), snapshot.clone());
        }
        Ok(())
    }

    fn load_snapshot(&self, connection_id: &ConnectionId) -> Result<Option<SnapshotEntry>, StoreError> {
        Ok(self.snapshots.read().get(connection_id).cloned())
    }

    fn connection_ids(&self) -> Result<Vec<ConnectionId>, StoreError> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::conformance;

    #[test]
    fn appends_in_order() {
        conformance::appends_in_order(&InMemoryJournal::new());
    }

    #[test]
    fn rejects_revision_gaps_and_duplicates() {
        let journal = InMemoryJournal::new();
        conformance::rejects_revision_gaps_and_duplicates(&journal);
        assert_eq!(journal.len(&ConnectionId::from_raw("c-conflict")), 1);
    }

    #[test]
    fn snapshot_roundtrip_and_recover() {
        conformance::snapshot_roundtrip_and_recover(&InMemoryJournal::new());
    }

    #[test]
    fn lists_connection_ids() {
        conformance::lists_connection_ids(&InMemoryJournal::new());
    }
}
