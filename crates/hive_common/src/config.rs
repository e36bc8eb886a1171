//! Controller configuration
//!
//! Config file: /etc/hive/hive.toml, overridable with `--config` or the
//! `HIVE_CONFIG` environment variable. Every section is optional.

use crate::capacity::PlannerTables;
use crate::error::{HiveError, Result};
use crate::search::Thresholds;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SYSTEM_CONFIG_PATH: &str = "/etc/hive/hive.toml";
pub const CONFIG_ENV_VAR: &str = "HIVE_CONFIG";

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Journal, cache and sample log live here
    pub state_dir: PathBuf,
    /// Upper bound for any single external command
    pub command_timeout_secs: u64,
    /// Upper bound for one monitoring cycle
    pub cycle_deadline_secs: u64,
    /// How long shutdown waits for an in-flight cycle
    pub shutdown_grace_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/hive"),
            command_timeout_secs: 30,
            cycle_deadline_secs: 120,
            shutdown_grace_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub join_wait_attempts: u32,
    pub join_wait_interval_secs: u64,
    pub dependency_attempts: u32,
    pub stack_name: String,
    pub compose_file: PathBuf,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            join_wait_attempts: 60,
            join_wait_interval_secs: 10,
            dependency_attempts: 30,
            stack_name: "app".to_string(),
            compose_file: PathBuf::from("/opt/hive/stack.yml"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mount_point: PathBuf,
    pub export_path: PathBuf,
    pub mount_attempts: u32,
    pub mount_retry_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/mnt/hive-shared"),
            export_path: PathBuf::from("/srv/hive-shared"),
            mount_attempts: 3,
            mount_retry_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    pub interval_secs: u64,
    /// Wait after a forced re-init before touching workloads
    pub stabilization_secs: u64,
    /// Inventory filter for manager instances; `{deployment}` is substituted
    pub manager_name_pattern: String,
    /// Restarted after forced recovery, in this order
    pub critical_workloads: Vec<String>,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            stabilization_secs: 20,
            manager_name_pattern: "{deployment}-manager".to_string(),
            critical_workloads: vec![
                "search".to_string(),
                "backend".to_string(),
                "worker".to_string(),
                "frontend".to_string(),
                "lb".to_string(),
            ],
        }
    }
}

impl QuorumConfig {
    pub fn manager_pattern_for(&self, deployment: &str) -> String {
        self.manager_name_pattern.replace("{deployment}", deployment)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    pub search_workload: String,
    pub data_path: PathBuf,
    pub disk_cleanup_threshold_percent: f64,
    pub retention_days: u64,
    /// Cycles a scaled or restarted workload is left to converge
    pub settle_cycles: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            search_workload: "search".to_string(),
            data_path: PathBuf::from("/var/lib/hive/search-data"),
            disk_cleanup_threshold_percent: 85.0,
            retention_days: 7,
            settle_cycles: 2,
        }
    }
}

impl ReconcilerConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub endpoint: String,
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
    pub heap_critical_percent: f64,
    pub latency_warning_ms: u64,
    pub queue_warning: u64,
    pub top_indices: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let thresholds = Thresholds::default();
        Self {
            endpoint: "http://127.0.0.1:9200".to_string(),
            interval_secs: 60,
            request_timeout_secs: 10,
            heap_critical_percent: thresholds.heap_critical_percent,
            latency_warning_ms: thresholds.latency_warning_ms,
            queue_warning: thresholds.queue_warning,
            top_indices: 5,
        }
    }
}

impl SearchConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            heap_critical_percent: self.heap_critical_percent,
            latency_warning_ms: self.latency_warning_ms,
            queue_warning: self.queue_warning,
        }
    }
}

/// Main controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    pub daemon: DaemonConfig,
    pub bootstrap: BootstrapConfig,
    pub storage: StorageConfig,
    pub quorum: QuorumConfig,
    pub reconciler: ReconcilerConfig,
    pub search: SearchConfig,
    pub planner: PlannerTables,
}

impl HiveConfig {
    /// Load configuration
    ///
    /// Priority:
    /// 1. Explicit path (must exist)
    /// 2. `HIVE_CONFIG`
    /// 3. /etc/hive/hive.toml
    /// 4. Defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::from_file(Path::new(&env_path));
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            return Self::from_file(system_path);
        }

        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            HiveError::ConfigurationMissing(format!("{}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&contents)
            .map_err(|e| HiveError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: HiveConfig =
            toml::from_str(contents).map_err(|e| HiveError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or disable a loop
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("daemon.command_timeout_secs", self.daemon.command_timeout_secs),
            ("daemon.cycle_deadline_secs", self.daemon.cycle_deadline_secs),
            ("bootstrap.join_wait_interval_secs", self.bootstrap.join_wait_interval_secs),
            ("bootstrap.join_wait_attempts", self.bootstrap.join_wait_attempts as u64),
            ("bootstrap.dependency_attempts", self.bootstrap.dependency_attempts as u64),
            ("storage.mount_attempts", self.storage.mount_attempts as u64),
            ("quorum.interval_secs", self.quorum.interval_secs),
            ("reconciler.interval_secs", self.reconciler.interval_secs),
            ("search.interval_secs", self.search.interval_secs),
            ("search.request_timeout_secs", self.search.request_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(HiveError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }

        let percents = [
            (
                "reconciler.disk_cleanup_threshold_percent",
                self.reconciler.disk_cleanup_threshold_percent,
            ),
            ("search.heap_critical_percent", self.search.heap_critical_percent),
        ];
        for (name, value) in percents {
            if !(value > 0.0 && value <= 100.0) {
                return Err(HiveError::InvalidConfig(format!(
                    "{} must be in (0, 100], got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.daemon.command_timeout_secs)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.daemon.cycle_deadline_secs)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.daemon.state_dir.join("bootstrap.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.daemon.state_dir.join("cache")
    }

    pub fn sample_log_path(&self) -> PathBuf {
        self.daemon.state_dir.join("search-health.jsonl")
    }
}
