//! Configuration for the erasure pipeline.
//!
//! Supports loading from TOML files, with validation equivalent to
//! `Params::new`'s so a bad config file fails at load time rather than
//! at the first `WriteHandle::open`.

use crate::erasure::{Params, Technique};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

fn default_block_size() -> usize {
    crate::DEFAULT_BLOCK_SIZE
}

fn default_k() -> usize {
    crate::DEFAULT_K
}

fn default_m() -> usize {
    crate::DEFAULT_M
}

fn default_technique() -> String {
    "Cauchy".to_string()
}

/// Engine-wide erasure/chunking parameters, TOML-loadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default = "default_k")]
    pub erasure_k: usize,

    #[serde(default = "default_m")]
    pub erasure_m: usize,

    #[serde(default = "default_technique")]
    pub erasure_technique: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            erasure_k: default_k(),
            erasure_m: default_m(),
            erasure_technique: default_technique(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.params()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults and
    /// logging a warning if the file is missing or invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load engine config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate and resolve into the runtime `Params` the codec expects.
    pub fn params(&self) -> crate::error::Result<Params> {
        let technique = Technique::parse(&self.erasure_technique)?;
        Params::new(self.erasure_k, self.erasure_m, technique)
    }
}
