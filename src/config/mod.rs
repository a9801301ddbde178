//! Configuration module for Norx
//!
//! This module handles loading and validating configuration from files and command line arguments.
//! Engine settings are deserialized into typed structs; detection-engine tunables are
//! resolved from the raw tree by [`resolver::DetectConfig`].

pub mod resolver;
pub mod tree;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub use resolver::{DetectConfig, EngineProfile, GroupLimits, SghMpmContext};
pub use tree::ConfTree;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid value \"{value}\" for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Include depth exceeded at {0}")]
    IncludeDepth(PathBuf),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure for Norx
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NorxConfig {
    pub general: GeneralConfig,
    pub logging: LoggingConfig,
    #[serde(rename = "live-swap")]
    pub live_swap: LiveSwapConfig,
}

/// General configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub threads: usize,
    pub rules_path: String,
    pub rule_files: Vec<String>,
    pub classification_file: Option<String>,
    pub reference_file: Option<String>,
    pub threshold_file: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_file: Option<String>,
}

/// Polling cadence of the live rule swap
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LiveSwapConfig {
    /// Interval between checks of a replacement context's in-use flag
    pub poll_interval_ms: u64,
    /// Interval between checks of a worker's terminal state after shutdown
    pub fallback_poll_interval_us: u64,
    /// Idle time after which a worker runs a pseudo packet
    pub worker_idle_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            rules_path: "rules".to_string(),
            rule_files: vec!["default.rules".to_string()],
            classification_file: None,
            reference_file: None,
            threshold_file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for LiveSwapConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1,
            fallback_poll_interval_us: 100,
            worker_idle_ms: 100,
        }
    }
}

impl LiveSwapConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn fallback_poll_interval(&self) -> Duration {
        Duration::from_micros(self.fallback_poll_interval_us.max(1))
    }

    pub fn worker_idle(&self) -> Duration {
        Duration::from_millis(self.worker_idle_ms.max(1))
    }
}

impl GeneralConfig {
    /// Resolve a rule-related file name against the rules directory
    pub fn rule_path(&self, file: &str) -> PathBuf {
        let path: &Path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.rules_path).join(path)
        }
    }
}

impl NorxConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let tree: ConfTree = ConfTree::load_file(path)?;
        Self::from_tree(&tree)
    }

    /// Extract the typed settings from a configuration tree
    pub fn from_tree(tree: &ConfTree) -> Result<Self, ConfigError> {
        let config: NorxConfig = tree.deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.threads == 0 {
            return Err(ConfigError::ValidationError(
                "Number of threads must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Where the configuration tree comes from. Re-read on every live rule swap.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<ConfTree, ConfigError>;
}

/// Configuration read from a file, with command line overrides applied on top
pub struct FileConfigSource {
    path: PathBuf,
    overrides: Vec<(String, toml::Value)>,
}

impl FileConfigSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            overrides: Vec::new(),
        }
    }

    /// Pin a value that survives reloads of the file
    pub fn with_override(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.overrides.push((key.to_string(), value.into()));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<ConfTree, ConfigError> {
        let mut tree: ConfTree = ConfTree::load_file(&self.path)?;
        for (key, value) in &self.overrides {
            tree.set(key, value.clone());
        }
        Ok(tree)
    }
}

/// In-memory configuration that can be replaced between reloads
#[derive(Default)]
pub struct StaticConfigSource {
    tree: RwLock<ConfTree>,
}

impl StaticConfigSource {
    pub fn new(tree: ConfTree) -> Self {
        Self {
            tree: RwLock::new(tree),
        }
    }

    /// Replace the tree returned by subsequent loads
    pub fn replace(&self, tree: ConfTree) {
        *self.tree.write() = tree;
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<ConfTree, ConfigError> {
        Ok(self.tree.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_and_sections() {
        let tree: ConfTree = ConfTree::from_toml_str(
            r#"
            [general]
            threads = 4
            rules_path = "/etc/norx/rules"
            rule_files = ["a.rules", "/abs/b.rules"]

            [live-swap]
            poll-interval-ms = 5
            "#,
        )
        .unwrap();

        let config: NorxConfig = NorxConfig::from_tree(&tree).unwrap();
        assert_eq!(config.general.threads, 4);
        assert_eq!(config.logging.log_level, "info");
        assert_eq!(config.live_swap.poll_interval(), Duration::from_millis(5));
        assert_eq!(config.live_swap.fallback_poll_interval_us, 100);
        assert_eq!(
            config.general.rule_path("a.rules"),
            PathBuf::from("/etc/norx/rules/a.rules")
        );
        assert_eq!(config.general.rule_path("/abs/b.rules"), PathBuf::from("/abs/b.rules"));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let tree: ConfTree = ConfTree::from_toml_str("[general]\nthreads = 0\n").unwrap();
        assert!(matches!(
            NorxConfig::from_tree(&tree),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_file_source_keeps_overrides_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("norx.toml");
        std::fs::write(&path, "[general]\nrules_path = \"from-file\"\n").unwrap();

        let source = FileConfigSource::new(&path).with_override("general.rules_path", "from-cli");
        assert_eq!(source.load().unwrap().get("general.rules_path").as_deref(), Some("from-cli"));

        std::fs::write(&path, "[general]\nrules_path = \"changed\"\nthreads = 2\n").unwrap();
        let tree: ConfTree = source.load().unwrap();
        assert_eq!(tree.get("general.rules_path").as_deref(), Some("from-cli"));
        assert_eq!(tree.get("general.threads").as_deref(), Some("2"));
    }
}
