use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use twinbridge_core::events::ConnectionEvent;
use twinbridge_core::ids::ConnectionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::journal::{ConnectionJournal, JournalEntry, SnapshotEntry};

/// SQLite-backed journal. The `(connection_id, revision)` primary key makes
/// concurrent writers for the same id fail instead of interleaving.
pub struct SqliteJournal {
    db: Database,
}

impl SqliteJournal {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("timestamp '{raw}': {e}")))
}

impl ConnectionJournal for SqliteJournal {
    #[instrument(skip(self, event), fields(connection_id = %connection_id, event_type = event.event_type()))]
    fn append(
        &self,
        connection_id: &ConnectionId,
        revision: u64,
        event: &ConnectionEvent,
    ) -> Result<JournalEntry, StoreError> {
        let timestamp = Utc::now();
        let payload = serde_json::to_string(event)?;

        self.db.with_tx(|tx| {
            let max: i64 = tx.query_row(
                "SELECT COALESCE(MAX(revision), 0) FROM journal WHERE connection_id = ?1",
                [connection_id.as_str()],
                |row| row.get(0),
            )?;
            let expected = max as u64 + 1;
            if revision != expected {
                return Err(StoreError::RevisionConflict {
                    connection_id: connection_id.to_string(),
                    expected,
                    found: revision,
                });
            }
            tx.execute(
                "INSERT INTO journal (connection_id, revision, type, timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    connection_id.as_str(),
                    revision as i64,
                    event.event_type(),
                    timestamp.to_rfc3339(),
                    payload,
                ],
            )?;
            Ok(())
        })?;

        Ok(JournalEntry {
            connection_id: connection_id.clone(),
            revision,
            timestamp,
            event: event.clone(),
        })
    }

    fn read_after(&self, connection_id: &ConnectionId, after: u64) -> Result<Vec<JournalEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT revision, timestamp, payload FROM journal
                 WHERE connection_id = ?1 AND revision > ?2 ORDER BY revision ASC",
            )?;
            let rows = stmt.query_map(params![connection_id.as_str(), after as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (revision, timestamp, payload) = row?;
                entries.push(JournalEntry {
                    connection_id: connection_id.clone(),
                    revision: revision as u64,
                    timestamp: parse_timestamp(&timestamp)?,
                    event: serde_json::from_str(&payload)?,
                });
            }
            Ok(entries)
        })
    }

    #[instrument(skip(self, snapshot), fields(connection_id = %snapshot.connection_id, revision = snapshot.revision))]
    fn save_snapshot(&self, snapshot: &SnapshotEntry) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&snapshot.connection)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshots (connection_id, revision, timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(connection_id) DO UPDATE SET
                     revision = excluded.revision,
                     timestamp = excluded.timestamp,
                     payload = excluded.payload
                 WHERE excluded.revision > snapshots.revision",
                params![
                    snapshot.connection_id.as_str(),
                    snapshot.revision as i64,
                    snapshot.timestamp.to_rfc3339(),
                    payload,
                ],
            )?;
            Ok(())
        })
    }

    fn load_snapshot(&self, connection_id: &ConnectionId) -> Result<Option<SnapshotEntry>, StoreError> {
        let row = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT revision, timestamp, payload FROM snapshots WHERE connection_id = ?1",
                    [connection_id.as_str()],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
                )
                .optional()?)
        })?;

        row.map(|(revision, timestamp, payload)| {
            Ok(SnapshotEntry {
                connection_id: connection_id.clone(),
                revision: revision as u64,
                timestamp: parse_timestamp(&timestamp)?,
                connection: serde_json::from_str(&payload)?,
            })
        })
        .transpose()
    }

    fn connection_ids(&self) -> Result<Vec<ConnectionId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT connection_id FROM journal ORDER BY connection_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(ConnectionId::from_raw(row?));
            }
            Ok(ids)
        })
    }
}
