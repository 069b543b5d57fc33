use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogCategory {
    Connection,
    Source,
    Target,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Consumed,
    Dispatched,
    Filtered,
    Published,
    Dropped,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Success,
    Failure,
}

/// One connection log line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub category: LogCategory,
    pub log_type: LogType,
    pub level: LogLevel,
    pub address: Option<String>,
    pub message: String,
}

/// Logs aggregated from a connection and its workers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionLogs {
    pub enabled_until: Option<DateTime<Utc>>,
    pub entries: Vec<LogEntry>,
}

impl ConnectionLogs {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append entries and keep the whole list ordered by time.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = LogEntry>) {
        self.entries.extend(entries);
        self.entries.sort_by_key(|e| e.timestamp);
    }
}
