//! Configuration management for Zero services.
//!
//! All Zero services share a unified configuration file at `~/.codecoder/config.json`.
//! Service-specific sections (e.g. `screener`) may also live in their own file next
//! to it and are deep-merged by [`crate::config_loader`].
//!
//! # Configuration Priority
//!
//! 1. Explicit config file values
//! 2. Environment variables (ZERO_* prefix)
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `ZERO_LOG_LEVEL` → observability.log_level
//! - `ZERO_LOG_FORMAT` → observability.log_format
//! - `ZERO_SCREENER_CONFIG` → explicit path of the screener section file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config_loader::load_modular_config;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new()
        .map_or_else(
            || PathBuf::from(".codecoder"),
            |dirs| dirs.home_dir().join(".codecoder"),
        )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Aliases: "level" for backward compatibility with existing config files
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    /// Aliases: "format" for backward compatibility with existing config files
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets to exclude from logging.
    ///
    /// These modules will be set to `warn` level to reduce noise.
    /// Built-in noisy modules (hyper, reqwest, h2, rustls, tokio_util) are
    /// always filtered; this list allows adding custom modules.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration shared by Zero services.
///
/// Service sections are kept as raw JSON here and typed by the owning
/// service crate (see `Config::section`), so `zero-common` never depends
/// on service types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Screener section (typed by `zero-screener`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screener: Option<serde_json::Value>,
}

impl Config {
    /// Load configuration from the default directory.
    ///
    /// Missing files are not an error: defaults are used instead.
    pub fn load() -> Result<Self> {
        Self::load_from_dir(&config_dir())
    }

    /// Load configuration from a specific directory (config.json + modular files).
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let value = load_modular_config(Some(dir.to_path_buf()))?;
        serde_json::from_value(value)
            .with_context(|| format!("Failed to parse config from {}", dir.display()))
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("ZERO_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("ZERO_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Ok(path) = std::env::var("ZERO_SCREENER_CONFIG") {
            self.load_section_file("screener", Path::new(&path))?;
        }
        Ok(())
    }

    /// Replace a service section with the contents of a standalone JSON file.
    pub fn load_section_file(&mut self, section: &str, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {} config from {}", section, path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {} config from {}", section, path.display()))?;

        match section {
            "screener" => self.screener = Some(value),
            other => anyhow::bail!("Unknown config section: {}", other),
        }
        tracing::debug!(section, path = %path.display(), "Loaded config section file");
        Ok(())
    }

    /// Deserialize a service section into its typed form.
    ///
    /// Returns the type's default when the section is absent.
    pub fn section<T>(&self, name: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        let raw = match name {
            "screener" => self.screener.as_ref(),
            other => anyhow::bail!("Unknown config section: {}", other),
        };

        match raw {
            Some(value) => serde_json::from_value(value.clone())
                .with_context(|| format!("Invalid `{}` section", name)),
            None => Ok(T::default()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
