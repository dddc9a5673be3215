//! Engine settings loaded from TOML

use crate::core::protocol::RetryPolicy;
use crate::core::runtime::ContextConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Settings file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("{path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Cause
        #[source]
        source: std::io::Error,
    },

    /// File is not valid settings TOML
    #[error("{path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Cause
        #[source]
        source: toml::de::Error,
    },

    /// Settings could not be serialized
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executor settings
    pub executor: ExecutorConfig,
    /// Recorder settings
    pub recorder: RecorderConfig,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Protocol defaults
    pub protocol: ProtocolConfig,
}

impl EngineConfig {
    /// Load `explicit` if given, else `<config_dir>/config.toml` when it
    /// exists, else defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        match super::config_file() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save to a specific file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Context tunables for a run
    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            poll_interval: Duration::from_millis(self.executor.poll_interval_ms.max(1)),
            modbus: RetryPolicy::new(self.protocol.retries, Duration::from_millis(self.protocol.timeout_ms)),
            record_dir: self.recorder.base_dir.clone(),
            ..ContextConfig::default()
        }
    }
}

/// `[executor]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Event wait and cancellation poll interval
    pub poll_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 100 }
    }
}

/// `[recorder]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Parent directory of run directories
    pub base_dir: PathBuf,
    /// Record every run without `--record`
    pub auto_record: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("logs/experiments"),
            auto_record: false,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// JSON lines instead of text
    pub json: bool,
    /// Daily rolling log file, in addition to stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

/// `[protocol]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Modbus RTU/ASCII attempts
    pub retries: u32,
    /// Modbus RTU/ASCII response timeout
    pub timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[executor]\npoll_interval_ms = 20\n\n[protocol]\nretries = 5\n").unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.executor.poll_interval_ms, 20);
        assert_eq!(config.protocol.retries, 5);
        assert_eq!(config.protocol.timeout_ms, 1000);
        assert_eq!(config.logging.level, "info");

        let ctx = config.context_config();
        assert_eq!(ctx.poll_interval, Duration::from_millis(20));
        assert_eq!(ctx.modbus.retries, 5);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = EngineConfig::default();
        config.recorder.auto_record = true;
        config.logging.file = Some(PathBuf::from("protoflow.log"));
        config.save_to(&path).unwrap();
        assert_eq!(EngineConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "executor = 3").unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            EngineConfig::load_from(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
