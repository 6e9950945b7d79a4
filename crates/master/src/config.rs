//! Master configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Result store file; defaults to `results.db` under the store path
    pub db_path: Option<PathBuf>,

    /// HTTP listen address for machines and status queries
    pub listen: String,

    /// Scheduling configuration
    pub scheduling: SchedulingConfig,

    /// Liveness configuration
    pub liveness: LivenessConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            store_path: tiltr_common::default_store_path(),
            db_path: None,
            listen: "0.0.0.0:8660".to_string(),
            scheduling: SchedulingConfig::default(),
            liveness: LivenessConfig::default(),
        }
    }
}

/// Retry and timeout policy for runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Extra attempts granted to a case after a retryable failure
    pub retry_limit: u32,

    /// Global run timeout in seconds
    pub run_timeout_secs: u64,

    /// How often `finalize` re-checks the run
    pub finalize_poll_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            retry_limit: 2,
            run_timeout_secs: 3600,
            finalize_poll_ms: 500,
        }
    }
}

/// Worker liveness contract
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Interval machines are told to heartbeat at
    pub heartbeat_interval_ms: u64,

    /// Silence after which a machine is declared dead
    pub liveness_timeout_ms: u64,

    /// Period of the expiry and deadline sweep
    pub reaper_interval_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            liveness_timeout_ms: 30_000,
            reaper_interval_ms: 1_000,
        }
    }
}

/// Slack on top of one heartbeat for the cancellation round trip
const DRAIN_MARGIN: Duration = Duration::from_secs(1);

impl LivenessConfig {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    /// How long the API stays up after an abort so every machine
    /// heartbeats once and learns its assignments were cancelled
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms).saturating_add(DRAIN_MARGIN)
    }
}

impl MasterConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the result store path
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("results.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: MasterConfig = toml::from_str(
            r#"
listen = "127.0.0.1:9000"

[scheduling]
retry_limit = 0
"#,
        )
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.scheduling.retry_limit, 0);
        assert_eq!(config.scheduling.run_timeout_secs, 3600);
        assert_eq!(config.liveness.liveness_timeout_ms, 30_000);
    }

    #[test]
    fn test_drain_grace_covers_a_full_heartbeat() {
        let liveness = LivenessConfig::default();
        assert!(liveness.drain_grace() > Duration::from_millis(liveness.heartbeat_interval_ms));

        let slow = LivenessConfig {
            heartbeat_interval_ms: 20_000,
            ..LivenessConfig::default()
        };
        assert_eq!(slow.drain_grace(), Duration::from_secs(21));

        let saturated = LivenessConfig {
            heartbeat_interval_ms: u64::MAX,
            ..LivenessConfig::default()
        };
        assert_eq!(saturated.drain_grace(), Duration::MAX);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.toml");

        let mut config = MasterConfig::default();
        config.store_path = dir.path().to_path_buf();
        config.liveness.reaper_interval_ms = 250;
        config.save(&path).unwrap();

        let loaded = MasterConfig::load(&path).unwrap();
        assert_eq!(loaded.liveness.reaper_interval_ms, 250);
        assert_eq!(loaded.db_path(), dir.path().join("results.db"));
    }
}
