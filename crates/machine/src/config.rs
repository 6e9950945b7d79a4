//! Machine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::agent::AgentConfig;
use crate::executor::ExecutorConfig;
use crate::webdriver::WebDriverConfig;

/// Machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Base URL of the master's coordinator API
    pub master_url: String,

    /// WebDriver endpoint (Selenium grid or standalone driver)
    pub grid_url: String,

    /// Name reported on registration
    pub name: String,

    /// Concurrent browser sessions
    pub capacity: u32,

    /// Screenshot directory
    pub artifacts_dir: PathBuf,

    pub timeouts: TimeoutConfig,

    pub polling: PollingConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            master_url: "http://127.0.0.1:8660".to_string(),
            grid_url: "http://127.0.0.1:4444".to_string(),
            name: default_name(),
            capacity: 1,
            artifacts_dir: tiltr_common::default_artifacts_path(),
            timeouts: TimeoutConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

fn default_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "machine".to_string())
}

/// Browser and coordinator timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub session_open_secs: u64,
    pub step_secs: u64,
    pub command_secs: u64,
    pub page_load_secs: u64,
    /// Per-request timeout towards the master
    pub coordinator_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            session_open_secs: 60,
            step_secs: 30,
            command_secs: 30,
            page_load_secs: 30,
            coordinator_secs: 10,
        }
    }
}

/// Claim polling and registration retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub poll_interval_ms: u64,
    pub max_backoff_ms: u64,
    pub register_attempts: usize,
    pub register_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_backoff_ms: 10_000,
            register_attempts: 5,
            register_delay_ms: 1_000,
        }
    }
}

impl MachineConfig {
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

    pub fn agent(&self) -> AgentConfig {
        AgentConfig {
            name: self.name.clone(),
            capacity: self.capacity,
            poll_interval: Duration::from_millis(self.polling.poll_interval_ms),
            max_backoff: Duration::from_millis(self.polling.max_backoff_ms),
            register_attempts: self.polling.register_attempts,
            register_delay: Duration::from_millis(self.polling.register_delay_ms),
            ..AgentConfig::default()
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            open_timeout: Duration::from_secs(self.timeouts.session_open_secs),
            step_timeout: Duration::from_secs(self.timeouts.step_secs),
            artifacts_dir: self.artifacts_dir.clone(),
        }
    }

    pub fn webdriver(&self) -> WebDriverConfig {
        WebDriverConfig {
            grid_url: self.grid_url.clone(),
            command_timeout: Duration::from_secs(self.timeouts.command_secs),
            page_load_timeout: Duration::from_secs(self.timeouts.page_load_secs),
            ..WebDriverConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: MachineConfig = toml::from_str(
            r#"
master_url = "http://master:8660"
capacity = 4

[timeouts]
step_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(config.master_url, "http://master:8660");
        assert_eq!(config.agent().capacity, 4);
        assert_eq!(config.executor().step_timeout, Duration::from_secs(5));
        assert_eq!(config.executor().open_timeout, Duration::from_secs(60));
        assert_eq!(config.webdriver().grid_url, "http://127.0.0.1:4444");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.toml");

        let mut config = MachineConfig::default();
        config.name = "m7".to_string();
        config.polling.max_backoff_ms = 2_000;
        config.save(&path).unwrap();

        let loaded = MachineConfig::load(&path).unwrap();
        assert_eq!(loaded.name, "m7");
        assert_eq!(loaded.agent().max_backoff, Duration::from_secs(2));
    }
}
