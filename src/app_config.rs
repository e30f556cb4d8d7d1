//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file. Everything has a default, so a
//! missing file is not an error.

use thiserror::Error;
use tracing::debug;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ananas_vfs::config::CacheConfig;

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZero::get)
}

fn default_ops() -> usize {
    10_000
}

fn default_keys() -> u64 {
    64
}

/// Defaults for the `stress` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkloadConfig {
    /// Number of worker threads.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Lookups issued by each thread.
    #[serde(default = "default_ops")]
    pub ops: usize,

    /// Number of distinct inodes the lookups are spread over.
    #[serde(default = "default_keys")]
    pub keys: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            ops: default_ops(),
            keys: default_keys(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(flatten)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub workload: WorkloadConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = self.cache.validate().err().unwrap_or_default();

        if self.workload.threads == 0 {
            errors.push("workload.threads must be at least 1.".to_owned());
        }

        if self.workload.keys == 0 {
            errors.push("workload.keys must be at least 1.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("ananas-vfs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("ananas-vfs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/ananas-vfs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config, falling back to the defaults if no file exists.
    /// Errors if a config file exists but is malformed or invalid.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(res) = Self::load(external_config_path) else {
            debug!("No configuration file found, using defaults.");
            return Ok(Self::default());
        };
        let config = res?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        debug!("Loaded configuration successfully.");
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
