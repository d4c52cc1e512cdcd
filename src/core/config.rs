use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::diagnostics::EngineSettings;
use crate::core::diagnostics::gaps::GapPolicy;
use crate::core::diagnostics::reconcile::ReconcilePolicy;

pub const DEFAULT_CONFIG_FILE: &str = "pipewatch.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub warehouse: WarehouseConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Replaces the compiled-in topology when set.
    #[serde(default)]
    pub topology_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default = "default_warehouse_path")]
    pub path: PathBuf,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_gap_window")]
    pub gap_window_days: u32,
    #[serde(default = "default_recent_gap")]
    pub recent_gap_days: u32,
    #[serde(default = "default_critical_gap_ratio")]
    pub critical_gap_ratio: f64,
    #[serde(default = "default_reconcile_window")]
    pub reconcile_window_days: u32,
    #[serde(default = "default_double_count_pct")]
    pub double_count_threshold_pct: f64,
    #[serde(default = "default_derived_lag")]
    pub derived_lag_days: i64,
    #[serde(default = "default_failed_rules_threshold")]
    pub failed_rules_error_threshold: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_warehouse_path() -> PathBuf {
    PathBuf::from("warehouse.db")
}
fn default_query_timeout() -> u64 {
    10
}
fn default_history_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("pipewatch"))
        .unwrap_or_else(|| PathBuf::from(".pipewatch"))
        .join("history.db")
}
fn default_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_probe_timeout() -> u64 {
    10
}
fn default_max_concurrency() -> usize {
    4
}
fn default_gap_window() -> u32 {
    30
}
fn default_recent_gap() -> u32 {
    7
}
fn default_critical_gap_ratio() -> f64 {
    0.30
}
fn default_reconcile_window() -> u32 {
    7
}
fn default_double_count_pct() -> f64 {
    50.0
}
fn default_derived_lag() -> i64 {
    1
}
fn default_failed_rules_threshold() -> usize {
    2
}
fn default_history_limit() -> usize {
    30
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8787
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            path: default_warehouse_path(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_probe_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            gap_window_days: default_gap_window(),
            recent_gap_days: default_recent_gap(),
            critical_gap_ratio: default_critical_gap_ratio(),
            reconcile_window_days: default_reconcile_window(),
            double_count_threshold_pct: default_double_count_pct(),
            derived_lag_days: default_derived_lag(),
            failed_rules_error_threshold: default_failed_rules_threshold(),
            history_limit: default_history_limit(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Config {
    /// Read `path`, or `pipewatch.toml` in the working directory. A missing
    /// file yields the defaults; a malformed one is an error.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        if !path.exists() {
            if explicit {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            info!("No {} found, using defaults.", DEFAULT_CONFIG_FILE);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        info!(
            "Loaded config from {}: warehouse={}, probe={}",
            path.display(),
            config.warehouse.path.display(),
            config.probe.base_url
        );
        Ok(config)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        let e = &self.engine;
        EngineSettings {
            max_concurrency: e.max_concurrency.max(1),
            query_timeout: Duration::from_secs(self.warehouse.query_timeout_secs.max(1)),
            gaps: GapPolicy {
                window_days: e.gap_window_days.max(1),
                recent_days: e.recent_gap_days.max(1),
                critical_ratio: e.critical_gap_ratio,
                ..GapPolicy::default()
            },
            reconcile: ReconcilePolicy {
                window_days: e.reconcile_window_days.max(1),
                double_count_threshold_pct: e.double_count_threshold_pct,
                derived_lag_days: e.derived_lag_days,
                failed_rules_error_threshold: e.failed_rules_error_threshold,
            },
            history_limit: e.history_limit,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.warehouse.query_timeout_secs, 10);
        assert_eq!(config.probe.base_url, "http://127.0.0.1:3000");
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.engine.critical_gap_ratio, 0.30);
        assert_eq!(config.engine.double_count_threshold_pct, 50.0);
        assert_eq!(config.server.port, 8787);
        assert!(config.history.path.ends_with("history.db"));
        assert!(config.topology_path.is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let content = r#"
topology_path = "custom.json"

[engine]
double_count_threshold_pct = 75.0
max_concurrency = 8

[probe]
base_url = "http://api.internal:8080"
"#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.engine.double_count_threshold_pct, 75.0);
        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.engine.gap_window_days, 30);
        assert_eq!(config.probe.timeout_secs, 10);
        assert_eq!(config.topology_path, Some(PathBuf::from("custom.json")));

        let settings = config.engine_settings();
        assert_eq!(settings.reconcile.double_count_threshold_pct, 75.0);
        assert_eq!(settings.max_concurrency, 8);
    }

    #[test]
    fn zero_values_are_clamped() {
        let mut config = Config::default();
        config.engine.max_concurrency = 0;
        config.warehouse.query_timeout_secs = 0;
        let settings = config.engine_settings();
        assert_eq!(settings.max_concurrency, 1);
        assert_eq!(settings.query_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).await.is_err());
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipewatch.toml");
        std::fs::write(&path, "[server]\nport = 9100\n").unwrap();
        let config = Config::load(Some(&path)).await.unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
    }
}
