mod metrics;

pub use metrics::{MetricSample, MetricType, MetricsRecorder};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "twinbridge_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Build from textual levels; unknown levels fall back to INFO.
    pub fn from_levels<'a>(
        log_level: &str,
        module_levels: impl IntoIterator<Item = (&'a String, &'a String)>,
        json: bool,
    ) -> Self {
        Self {
            log_level: log_level.parse().unwrap_or(Level::INFO),
            module_levels: module_levels
                .into_iter()
                .filter_map(|(m, l)| l.parse().ok().map(|lvl| (m.clone(), lvl)))
                .collect(),
            json,
        }
    }

    /// `EnvFilter` directive string, e.g. `info,twinbridge_engine=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the shared metrics recorder alive for the process.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn filter_directives_include_modules() {
        let mut modules = BTreeMap::new();
        modules.insert("twinbridge_engine".to_string(), "debug".to_string());
        modules.insert("noisy".to_string(), "not-a-level".to_string());
        let config = TelemetryConfig::from_levels("warn", &modules, false);
        assert_eq!(config.filter_directives(), "warn,twinbridge_engine=debug");
    }

    #[test]
    fn unknown_level_defaults_to_info() {
        let config = TelemetryConfig::from_levels("loud", &BTreeMap::<String, String>::new(), true);
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn init_twice_is_harmless() {
        let a = init_telemetry(TelemetryConfig::default());
        let b = init_telemetry(TelemetryConfig::default());
        a.metrics().counter_inc("x", &[], 1);
        assert_eq!(b.metrics().counter_get("x", &[]), 0);
    }
}
