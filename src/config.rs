//! Engine configuration.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SAGAFLOW_HOME, SAGAFLOW_DB)
//! 2. Config file (`SAGAFLOW_CONFIG`, else `.sagaflow/config.yaml`)
//! 3. Defaults (~/.sagaflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .sagaflow/config.yaml
//! - Relative paths in the file resolve against the `.sagaflow/` directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::FlowPolicy;

/// Topic names used for notifications and control messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topics {
    pub instance_status: String,
    pub flow_registered: String,
    pub step_added: String,
    pub flow_deleted: String,
    pub resilience_exhausted: String,

    /// Inbound: stop an instance by id
    pub control_stop: String,

    /// Inbound: continue an instance by id
    pub control_restart: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            instance_status: "sagaflow.instance.status".into(),
            flow_registered: "sagaflow.flow.registered".into(),
            step_added: "sagaflow.flow.step_added".into(),
            flow_deleted: "sagaflow.flow.deleted".into(),
            resilience_exhausted: "sagaflow.resilience.exhausted".into(),
            control_stop: "sagaflow.control.stop".into(),
            control_restart: "sagaflow.control.restart".into(),
        }
    }
}

/// Resolved engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine state directory
    pub home: PathBuf,

    /// SQLite database file (defaults to `$home/sagaflow.db`)
    pub database: Option<PathBuf>,

    /// Prefix for every persisted key
    pub key_prefix: String,

    /// Retention for flows that do not set their own
    pub default_retention_secs: u64,

    /// Delay before a finished instance leaves memory
    pub eviction_delay_ms: u64,

    pub topics: Topics,

    /// Per-tag policy overrides applied at registration
    pub flows: HashMap<String, FlowPolicy>,

    /// Path to config file (if one was loaded)
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            database: None,
            key_prefix: "sagaflow".into(),
            default_retention_secs: 86_400,
            eviction_delay_ms: 5_000,
            topics: Topics::default(),
            flows: HashMap::new(),
            config_file: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from all sources
    pub fn load() -> Result<Self> {
        let config_file = std::env::var("SAGAFLOW_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(find_config_file);

        let mut config = match config_file {
            Some(ref path) => {
                let mut config = load_config_file(path)?;
                // Relative paths are relative to the .sagaflow/ directory
                let base = path.parent().unwrap_or(Path::new("."));
                config.home = resolve_path(base, &config.home);
                config.database = config.database.map(|db| resolve_path(base, &db));
                config.config_file = Some(path.clone());
                config
            }
            None => Self::default(),
        };

        if let Ok(home) = std::env::var("SAGAFLOW_HOME") {
            config.home = PathBuf::from(home);
        }
        if let Ok(db) = std::env::var("SAGAFLOW_DB") {
            config.database = Some(PathBuf::from(db));
        }

        Ok(config)
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse engine configuration")
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.home.join("sagaflow.db"))
    }

    pub fn default_retention(&self) -> Duration {
        Duration::from_secs(self.default_retention_secs)
    }

    pub fn eviction_delay(&self) -> Duration {
        Duration::from_millis(self.eviction_delay_ms)
    }

    /// Configured policy override for a flow tag
    pub fn flow_policy(&self, tag: &str) -> Option<&FlowPolicy> {
        self.flows.get(tag)
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_eviction_delay(mut self, delay: Duration) -> Self {
        self.eviction_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_flow_policy(mut self, tag: impl Into<String>, policy: FlowPolicy) -> Self {
        self.flows.insert(tag.into(), policy);
        self
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sagaflow")
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".sagaflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Consistency;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();

        assert_eq!(config.key_prefix, "sagaflow");
        assert_eq!(config.default_retention(), Duration::from_secs(86_400));
        assert_eq!(config.eviction_delay(), Duration::from_secs(5));
        assert!(config.home.ends_with(".sagaflow"));
        assert_eq!(config.database_path(), config.home.join("sagaflow.db"));
    }

    #[test]
    fn test_oversized_eviction_delay_saturates() {
        let config = EngineConfig::default().with_eviction_delay(Duration::MAX);
        assert_eq!(config.eviction_delay_ms, u64::MAX);
    }

    #[test]
    fn test_yaml_partial_overrides() {
        let config = EngineConfig::from_yaml(
            r#"
key_prefix: orders
eviction_delay_ms: 100
topics:
  instance_status: orders.status
flows:
  order.create:
    consistency: eventual
    total_attempts: 3
    time_attempts_ms: 500
"#,
        )
        .unwrap();

        assert_eq!(config.key_prefix, "orders");
        assert_eq!(config.eviction_delay(), Duration::from_millis(100));
        assert_eq!(config.topics.instance_status, "orders.status");
        // Unlisted topics keep their defaults
        assert_eq!(config.topics.flow_deleted, Topics::default().flow_deleted);

        let policy = config.flow_policy("order.create").unwrap();
        assert_eq!(policy.consistency, Some(Consistency::Eventual));
        assert_eq!(policy.total_attempts, Some(3));
        assert!(config.flow_policy("unknown").is_none());
    }

    #[test]
    fn test_config_file_paths_resolve_relative_to_file() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".sagaflow");
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "home: state\ndatabase: /var/lib/sagaflow/flows.db").unwrap();

        let mut config = load_config_file(&config_path).unwrap();
        config.home = resolve_path(&dir, &config.home);

        assert_eq!(config.home, dir.join("state"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/sagaflow/flows.db")
        );
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.sagaflow");

        assert_eq!(
            resolve_path(&base, Path::new("data")),
            PathBuf::from("/home/user/project/.sagaflow/data")
        );
        assert_eq!(
            resolve_path(&base, Path::new("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        assert!(EngineConfig::from_yaml("eviction_delay_ms: [not, a, number]").is_err());
    }
}
