//! Stratum configuration module.
//!
//! Manages persistent, non-secret defaults for the CLI. Config is stored in
//! `~/.config/stratum/config.toml`.
//!
//! ## Priority order (highest to lowest)
//!
//! 1. Environment variables (`STRATUM_*`)
//! 2. Config file (`~/.config/stratum/config.toml`)
//! 3. Built-in defaults

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumConfig {
    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub telemetry: TelemetryDefaults,
}

impl Default for StratumConfig {
    fn default() -> Self {
        Self {
            defaults: Defaults::default(),
            telemetry: TelemetryDefaults::default(),
        }
    }
}

/// Default execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Defaults {
    /// Default worker pool size; `None` means "number of CPUs".
    pub parallelism: Option<usize>,

    /// Default log preset: bare, pretty, json, key-value.
    pub log_format: Option<String>,

    /// Command used to fetch short-lived cloud credentials before a run,
    /// e.g. `"aws-vault exec prod --"`. Run as a prefix to the engine binary.
    pub auth_provider_cmd: Option<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            parallelism: None,
            log_format: Some("pretty".to_string()),
            auth_provider_cmd: None,
        }
    }
}

/// Default telemetry settings (can still be overridden by `STRATUM_TELEMETRY_*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TelemetryDefaults {
    pub trace_exporter: Option<String>,
    pub metric_exporter: Option<String>,
}

impl StratumConfig {
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stratum")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load configuration from file, returning defaults if absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| StratumError::ConfigError {
            reason: format!("Failed to read config file: {}", e),
        })?;

        toml::from_str(&content).map_err(|e| StratumError::ConfigError {
            reason: format!("Failed to parse config file: {}", e),
        })
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir();
        let path = Self::config_path();

        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| StratumError::ConfigError {
                reason: format!("Failed to create config directory: {}", e),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| StratumError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(&path, content).map_err(|e| StratumError::ConfigError {
            reason: format!("Failed to write config file: {}", e),
        })?;

        Ok(())
    }

    /// Merge with environment variables; env wins.
    pub fn with_env(mut self) -> Self {
        if let Ok(v) = std::env::var("STRATUM_LOG") {
            if !v.is_empty() {
                self.defaults.log_format = Some(v);
            }
        }
        if let Ok(v) = std::env::var("STRATUM_TELEMETRY_TRACE_EXPORTER") {
            if !v.is_empty() {
                self.telemetry.trace_exporter = Some(v);
            }
        }
        if let Ok(v) = std::env::var("STRATUM_TELEMETRY_METRIC_EXPORTER") {
            if !v.is_empty() {
                self.telemetry.metric_exporter = Some(v);
            }
        }
        self
    }

    pub fn effective_parallelism(&self) -> usize {
        self.defaults
            .parallelism
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
    }

    pub fn effective_log_format(&self) -> &str {
        self.defaults.log_format.as_deref().unwrap_or("pretty")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn config_path_contains_stratum() {
        let path = StratumConfig::config_path();
        assert!(path.to_string_lossy().contains("stratum"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn default_config_has_pretty_log_format() {
        let config = StratumConfig::default();
        assert_eq!(config.effective_log_format(), "pretty");
        assert!(config.defaults.auth_provider_cmd.is_none());
    }

    #[test]
    fn config_save_and_load_roundtrip() {
        let config = StratumConfig {
            defaults: Defaults {
                parallelism: Some(8),
                log_format: Some("json".into()),
                auth_provider_cmd: Some("aws-vault exec prod --".into()),
            },
            telemetry: TelemetryDefaults {
                trace_exporter: Some("otlp-http".into()),
                metric_exporter: None,
            },
        };

        let content = toml::to_string_pretty(&config).unwrap();
        let loaded: StratumConfig = toml::from_str(&content).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn env_overrides_log_format() {
        env::set_var("STRATUM_LOG", "key-value");
        let config = StratumConfig::default().with_env();
        assert_eq!(config.effective_log_format(), "key-value");
        env::remove_var("STRATUM_LOG");
    }

    #[test]
    fn empty_env_does_not_override() {
        env::set_var("STRATUM_LOG", "");
        let config = StratumConfig {
            defaults: Defaults {
                log_format: Some("bare".into()),
                ..Default::default()
            },
            ..Default::default()
        }
        .with_env();
        assert_eq!(config.effective_log_format(), "bare");
        env::remove_var("STRATUM_LOG");
    }

    #[test]
    fn effective_parallelism_falls_back_to_cpu_count() {
        let config = StratumConfig::default();
        assert!(config.effective_parallelism() >= 1);
    }
}
