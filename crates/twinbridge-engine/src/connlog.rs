//! Bounded connection logs, enabled for a limited time.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use twinbridge_core::logs::{ConnectionLogs, LogCategory, LogEntry, LogLevel, LogType};
use twinbridge_settings::ConnectionLogSettings;

/// Separate ring buffers for success and failure entries so a burst of
/// failures cannot push out the last successes.
#[derive(Debug)]
pub struct ConnectionLogger {
    success: VecDeque<LogEntry>,
    failure: VecDeque<LogEntry>,
    success_capacity: usize,
    failure_capacity: usize,
    enabled_until: Option<DateTime<Utc>>,
}

impl ConnectionLogger {
    pub fn new(settings: &ConnectionLogSettings) -> Self {
        Self {
            success: VecDeque::new(),
            failure: VecDeque::new(),
            success_capacity: settings.success_capacity,
            failure_capacity: settings.failure_capacity,
            enabled_until: None,
        }
    }

    pub fn enable_until(&mut self, until: DateTime<Utc>) {
        self.enabled_until = Some(until);
    }

    pub fn enabled_until(&self) -> Option<DateTime<Utc>> {
        self.enabled_until
    }

    pub fn is_enabled(&self, now: DateTime<Utc>) -> bool {
        self.enabled_until.is_some_and(|until| now < until)
    }

    /// Record `entry` if logging is enabled at its timestamp.
    pub fn log(&mut self, entry: LogEntry) {
        if !self.is_enabled(entry.timestamp) {
            return;
        }
        let (ring, capacity) = match entry.level {
            LogLevel::Success => (&mut self.success, self.success_capacity),
            LogLevel::Failure => (&mut self.failure, self.failure_capacity),
        };
        if capacity == 0 {
            return;
        }
        while ring.len() >= capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    /// Drop all entries; the enablement window is kept.
    pub fn clear(&mut self) {
        self.success.clear();
        self.failure.clear();
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = self.success.iter().chain(self.failure.iter()).cloned().collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    pub fn snapshot(&self) -> ConnectionLogs {
        let mut logs = ConnectionLogs {
            enabled_until: self.enabled_until,
            entries: Vec::new(),
        };
        logs.extend(self.entries());
        logs
    }
}

/// Entry stamped with the current time.
pub fn entry(
    category: LogCategory,
    log_type: LogType,
    level: LogLevel,
    address: Option<&str>,
    correlation_id: Option<&str>,
    message: impl Into<String>,
) -> LogEntry {
    LogEntry {
        timestamp: Utc::now(),
        correlation_id: correlation_id.map(str::to_owned),
        category,
        log_type,
        level,
        address: address.map(str::to_owned),
        message: message.into(),
    }
}
