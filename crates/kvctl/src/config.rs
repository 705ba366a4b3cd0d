//! Configuration module for the controller
//!
//! Supports YAML configuration files with module-based organization. Every
//! section and field is optional and falls back to its default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::failover::FailoverConfig;
use crate::migration::MigrationConfig;
use crate::store::keys::DEFAULT_ROOT;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Metadata store configuration
    pub store: StoreConfig,
    /// Leader election configuration
    pub election: ElectionConfig,
    pub failover: FailoverConfig,
    pub migration: MigrationConfig,
    /// Logging configuration
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, yaml).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Reject values the controller cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failover.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failover.failure_threshold must be at least 1".into(),
            ));
        }
        if self.store.op_timeout_ms == 0 {
            return Err(ConfigError::Invalid("store.op_timeout_ms must be positive".into()));
        }
        if self.election.enabled && self.store.backend != StoreBackend::Redis {
            return Err(ConfigError::Invalid(
                "election.enabled requires store.backend: redis".into(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(ConfigError::Invalid(
                "store.backend: redis requires store.redis_url".into(),
            ));
        }
        if self.election.enabled && self.election.ttl_secs < 3 {
            return Err(ConfigError::Invalid("election.ttl_secs must be at least 3".into()));
        }
        if self.migration.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "migration.poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP API listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

/// Where metadata lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In this process, optionally journaled to `data_dir`
    #[default]
    Memory,
    /// On a Redis-protocol server shared by every controller
    Redis,
}

/// Metadata store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Shared store URL, e.g. `redis://10.0.0.1:6379/0`
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Journal and snapshot directory of the memory backend; `None` keeps
    /// everything in memory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Timeout of every store operation
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    /// Interval of folding the journal into the snapshot
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Prefix of every key
    #[serde(default = "default_root_prefix")]
    pub root_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: None,
            data_dir: None,
            op_timeout_ms: default_op_timeout_ms(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            root_prefix: default_root_prefix(),
        }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Disabled means this controller always leads
    #[serde(default)]
    pub enabled: bool,
    /// Leader lease TTL
    #[serde(default = "default_election_ttl_secs")]
    pub ttl_secs: u64,
    /// Controller ID, random when unset
    #[serde(default)]
    pub controller_id: Option<String>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_election_ttl_secs(),
            controller_id: None,
        }
    }
}

impl ElectionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:9379".to_string()
}

fn default_op_timeout_ms() -> u64 {
    3000
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_root_prefix() -> String {
    DEFAULT_ROOT.to_string()
}

fn default_election_ttl_secs() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.server.http_addr, "0.0.0.0:9379");
        assert_eq!(config.failover.failure_threshold, 3);
        assert_eq!(config.failover.max_probe_retries, 3);
        assert_eq!(config.migration.poll_interval_ms, 500);
        assert_eq!(config.migration.slot_timeout_ms, 60_000);
        assert_eq!(config.store.root_prefix, "/kvctl");
        assert!(config.store.data_dir.is_none());
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(!config.election.enabled);
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
server:
  http_addr: "127.0.0.1:8000"
store:
  backend: redis
  redis_url: redis://10.0.0.1:6379
  op_timeout_ms: 500
failover:
  failure_threshold: 5
  probe_backoff_ms: 100
election:
  enabled: true
  controller_id: ctl-1
log:
  level: debug
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr, "127.0.0.1:8000");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://10.0.0.1:6379"));
        assert!(config.store.data_dir.is_none());
        assert_eq!(config.store.op_timeout(), Duration::from_millis(500));
        assert_eq!(config.store.snapshot_interval_secs, 60);
        assert_eq!(config.failover.failure_threshold, 5);
        assert_eq!(config.failover.max_write_retries, 5);
        assert_eq!(config.election.controller_id.as_deref(), Some("ctl-1"));
        assert_eq!(config.election.ttl(), Duration::from_secs(15));
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::from_yaml("failover:\n  failure_threshold: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_yaml("server: [1, 2]"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_election_needs_shared_backend() {
        let err = Config::from_yaml("election:\n  enabled: true\n").unwrap_err();
        assert!(err.to_string().contains("store.backend: redis"));

        let err = Config::from_yaml("store:\n  backend: redis\n").unwrap_err();
        assert!(err.to_string().contains("redis_url"));

        let config = Config::from_yaml(
            "store:\n  backend: redis\n  redis_url: redis://127.0.0.1/\nelection:\n  enabled: true\n",
        )
        .unwrap();
        assert!(config.election.enabled);

        let mut config = Config::default();
        config.election.enabled = true;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvctl.yaml");
        let mut config = Config::default();
        config.failover.failure_threshold = 7;
        config.to_file(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap().failover.failure_threshold, 7);
        assert!(matches!(
            Config::from_file(dir.path().join("missing.yaml")),
            Err(ConfigError::IoError(_))
        ));
    }
}
