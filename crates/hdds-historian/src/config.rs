// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Historian configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Historian configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Staging database path (SQLite file)
    pub db_path: PathBuf,

    /// Longest wait for new input before retrying outstanding rows (ms)
    pub retry_period_ms: u64,

    /// Maximum entries handed to the sink per call
    pub submit_size_limit: usize,

    /// Longest uninterrupted publishing episode before input is rechecked (ms)
    pub max_time_publishing_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("historian_backup.db"),
            retry_period_ms: 300_000,
            submit_size_limit: 1000,
            max_time_publishing_ms: 30_000,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing failed
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// File I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Parse configuration from a YAML string
    ///
    /// Missing keys take their default value.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Reject values the publish loop cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.submit_size_limit == 0 {
            return Err(ConfigError::Invalid(
                "submit_size_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry period as a duration
    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }

    /// Publishing budget as a duration
    pub fn max_time_publishing(&self) -> Duration {
        Duration::from_millis(self.max_time_publishing_ms)
    }
}

/// Config builder for fluent API
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    base: Option<Config>,
    db_path: Option<PathBuf>,
    retry_period_ms: Option<u64>,
    submit_size_limit: Option<usize>,
    max_time_publishing_ms: Option<u64>,
}

impl ConfigBuilder {
    /// Start from an existing configuration instead of the defaults
    pub fn from_config(config: Config) -> Self {
        Self {
            base: Some(config),
            ..Self::default()
        }
    }

    /// Set staging database path
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Set retry period in milliseconds
    pub fn retry_period_ms(mut self, ms: u64) -> Self {
        self.retry_period_ms = Some(ms);
        self
    }

    /// Set maximum batch size per sink call
    pub fn submit_size_limit(mut self, limit: usize) -> Self {
        self.submit_size_limit = Some(limit);
        self
    }

    /// Set publishing budget in milliseconds
    pub fn max_time_publishing_ms(mut self, ms: u64) -> Self {
        self.max_time_publishing_ms = Some(ms);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        let defaults = self.base.unwrap_or_default();

        Config {
            db_path: self.db_path.unwrap_or(defaults.db_path),
            retry_period_ms: self.retry_period_ms.unwrap_or(defaults.retry_period_ms),
            // A zero batch would stall the loop forever
            submit_size_limit: self
                .submit_size_limit
                .unwrap_or(defaults.submit_size_limit)
                .max(1),
            max_time_publishing_ms: self
                .max_time_publishing_ms
                .unwrap_or(defaults.max_time_publishing_ms),
        }
    }
}
