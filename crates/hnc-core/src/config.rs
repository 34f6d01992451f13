//! Configuration parsing and management.
//!
//! This module handles parsing of the controller configuration file (TOML):
//! worker pool size, startup resync, the exclusion policy and the retry
//! backoff. Every field has a default, so an empty file is a valid
//! configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::exclusion::{DEFAULT_EXCLUDED_NAMESPACES, ExclusionSet};
use crate::retry::BackoffConfig;

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HncConfig {
    /// Worker pool and startup behaviour.
    #[serde(default)]
    pub controller: ControllerSection,

    /// Namespaces that never take part in the hierarchy.
    #[serde(default)]
    pub exclusion: ExclusionConfig,

    /// Backoff applied to namespaces whose reconciliation failed.
    #[serde(default)]
    pub retry: BackoffConfig,
}

impl HncConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails [`Self::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks values serde cannot reject on its own.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the worker count is zero or the
    /// inclusion pattern does not compile.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller.workers == 0 {
            return Err(ConfigError::Validation(
                "controller.workers must be at least 1".to_string(),
            ));
        }
        self.exclusion.to_exclusion_set().map(|_| ())
    }
}

/// `[controller]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSection {
    /// Number of concurrent reconciliation workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Whether to enqueue every namespace in the store at startup.
    #[serde(default = "default_resync_on_start")]
    pub resync_on_start: bool,
}

const fn default_workers() -> usize {
    4
}

const fn default_resync_on_start() -> bool {
    true
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resync_on_start: default_resync_on_start(),
        }
    }
}

/// `[exclusion]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionConfig {
    /// Namespace names excluded from the hierarchy.
    #[serde(default = "default_excluded_namespaces")]
    pub excluded_namespaces: Vec<String>,

    /// When set, names that do not fully match this pattern are excluded too.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_namespace_regex: Option<String>,
}

fn default_excluded_namespaces() -> Vec<String> {
    DEFAULT_EXCLUDED_NAMESPACES
        .iter()
        .map(|name| (*name).to_string())
        .collect()
}

impl Default for ExclusionConfig {
    fn default() -> Self {
        Self {
            excluded_namespaces: default_excluded_namespaces(),
            included_namespace_regex: None,
        }
    }
}

impl ExclusionConfig {
    /// Builds the exclusion set described by this section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the inclusion pattern does not
    /// compile.
    pub fn to_exclusion_set(&self) -> Result<ExclusionSet, ConfigError> {
        let set = ExclusionSet::new(self.excluded_namespaces.iter().cloned());
        match &self.included_namespace_regex {
            Some(pattern) => set.with_included_pattern(pattern).map_err(|e| {
                ConfigError::Validation(format!(
                    "exclusion.included_namespace_regex {pattern:?} is invalid: {e}"
                ))
            }),
            None => Ok(set),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse configuration.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
