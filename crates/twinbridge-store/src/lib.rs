pub mod database;
pub mod error;
pub mod journal;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use database::Database;
pub use error::StoreError;
pub use journal::{ConnectionJournal, JournalEntry, SnapshotEntry};
pub use memory::InMemoryJournal;
pub use sqlite::SqliteJournal;
