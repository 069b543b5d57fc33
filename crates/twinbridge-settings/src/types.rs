//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a partial JSON file only overrides what it names. Durations are stored in
//! milliseconds and exposed as [`Duration`] through accessor methods.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectivitySettings {
    pub supervisor: SupervisorSettings,
    pub health: HealthCheckSettings,
    pub hosts: HostSettings,
    pub cluster: ClusterSettings,
    pub logs: ConnectionLogSettings,
    pub priority: PrioritySettings,
    pub store: StoreSettings,
    pub telemetry: TelemetrySettings,
}

impl ConnectivitySettings {
    /// Cross-field checks that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.nodes.is_empty() {
            return Err(SettingsError::InvalidValue("cluster.nodes must not be empty".into()));
        }
        if !self.cluster.nodes.contains(&self.cluster.local_node) {
            return Err(SettingsError::InvalidValue(format!(
                "cluster.localNode '{}' is not listed in cluster.nodes",
                self.cluster.local_node
            )));
        }
        if self.health.timeout_ms > self.health.interval_ms {
            return Err(SettingsError::InvalidValue(
                "health.timeoutMs must not exceed health.intervalMs".into(),
            ));
        }
        if self.supervisor.worker_retries_until_escalate < 0 {
            return Err(SettingsError::InvalidValue(
                "supervisor.workerRetriesUntilEscalate must be >= 0".into(),
            ));
        }
        if self.supervisor.snapshot_threshold == 0 {
            return Err(SettingsError::InvalidValue("supervisor.snapshotThreshold must be >= 1".into()));
        }
        if self.supervisor.mailbox_capacity == 0 || self.supervisor.worker_mailbox_capacity == 0 {
            return Err(SettingsError::InvalidValue("mailbox capacities must be >= 1".into()));
        }
        Ok(())
    }
}

/// Connection supervisor behaviour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorSettings {
    /// Worker instantiation failures tolerated before the supervisor passivates.
    pub client_actor_restarts_before_escalation: u32,
    /// Runtime failures per worker restarted in place before escalation.
    pub worker_retries_until_escalate: i64,
    pub ask_timeout_ms: u64,
    pub open_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub test_timeout_ms: u64,
    /// Time a deleted supervisor lingers before stopping.
    pub deletion_grace_ms: u64,
    /// Revisions between journal snapshots.
    pub snapshot_threshold: u64,
    pub mailbox_capacity: usize,
    pub worker_mailbox_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            client_actor_restarts_before_escalation: 3,
            worker_retries_until_escalate: 3,
            ask_timeout_ms: 10_000,
            open_timeout_ms: 10_000,
            close_timeout_ms: 10_000,
            test_timeout_ms: 10_000,
            deletion_grace_ms: 5_000,
            snapshot_threshold: 10,
            mailbox_capacity: 256,
            worker_mailbox_capacity: 128,
        }
    }
}

impl SupervisorSettings {
    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    pub fn deletion_grace(&self) -> Duration {
        Duration::from_millis(self.deletion_grace_ms)
    }
}

/// Quorum health-check rounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            timeout_ms: 1_000,
        }
    }
}

impl HealthCheckSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Hostname allow/block lists. Blocking is active when either block list is non-empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostSettings {
    /// Glob patterns that bypass every other check.
    pub allowed_hostnames: Vec<String>,
    pub blocked_hostnames: Vec<String>,
    /// CIDR notation, e.g. `10.0.0.0/8`.
    pub blocked_subnets: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    pub local_node: String,
    pub nodes: Vec<String>,
    pub bus_capacity: usize,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            local_node: "node-1".to_string(),
            nodes: vec!["node-1".to_string()],
            bus_capacity: 256,
        }
    }
}

/// Connection log ring buffers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionLogSettings {
    pub success_capacity: usize,
    pub failure_capacity: usize,
    pub logging_duration_secs: u64,
}

impl Default for ConnectionLogSettings {
    fn default() -> Self {
        Self {
            success_capacity: 10,
            failure_capacity: 10,
            logging_duration_secs: 86_400,
        }
    }
}

impl ConnectionLogSettings {
    pub fn logging_duration(&self) -> Duration {
        Duration::from_secs(self.logging_duration_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrioritySettings {
    pub ask_timeout_ms: u64,
    pub metrics_window_hours: u32,
}

impl Default for PrioritySettings {
    fn default() -> Self {
        Self {
            ask_timeout_ms: 5_000,
            metrics_window_hours: 24,
        }
    }
}

impl PrioritySettings {
    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub database_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            database_path: format!("{home}/.twinbridge/journal.db"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub json_logs: bool,
    /// Per-module overrides, e.g. `{"twinbridge_engine": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
            module_levels: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ConnectivitySettings::default().validate().unwrap();
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(ConnectivitySettings::default()).unwrap();
        assert_eq!(json["supervisor"]["clientActorRestartsBeforeEscalation"], 3);
        assert_eq!(json["health"]["intervalMs"], 2000);
        assert_eq!(json["cluster"]["localNode"], "node-1");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: ConnectivitySettings =
            serde_json::from_str(r#"{"health": {"timeoutMs": 500}}"#).unwrap();
        assert_eq!(settings.health.timeout_ms, 500);
        assert_eq!(settings.health.interval_ms, 2_000);
        assert_eq!(settings.supervisor.snapshot_threshold, 10);
    }

    #[test]
    fn local_node_must_be_member() {
        let mut settings = ConnectivitySettings::default();
        settings.cluster.local_node = "elsewhere".into();
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn health_timeout_bounded_by_interval() {
        let mut settings = ConnectivitySettings::default();
        settings.health.timeout_ms = 5_000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn negative_worker_retries_rejected() {
        let mut settings = ConnectivitySettings::default();
        settings.supervisor.worker_retries_until_escalate = -1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn duration_accessors() {
        let s = SupervisorSettings::default();
        assert_eq!(s.close_timeout(), Duration::from_secs(10));
        assert_eq!(s.deletion_grace(), Duration::from_secs(5));
        assert_eq!(ConnectionLogSettings::default().logging_duration(), Duration::from_secs(86_400));
    }
}
