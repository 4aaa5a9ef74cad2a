//! Daemon configuration.
//!
//! Loaded from a toml file (`KATA_CONFIG` or the default state-dir
//! location) with environment overrides. Staleness thresholds and
//! cadences live here, not in code.

use std::env;
use std::fs;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use kata_core::StalenessPolicy;

use crate::server::DEFAULT_SOCKET_PATH;

/// Environment variable overriding the socket path.
pub const ENV_SOCKET: &str = "KATA_SOCKET";

/// Environment variable pointing at the config file.
pub const ENV_CONFIG: &str = "KATA_CONFIG";

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path of the Unix socket to listen on
    pub socket_path: PathBuf,

    /// Staleness thresholds and client cadences
    pub policy: StalenessPolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            policy: StalenessPolicy::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads configuration: file first (if `KATA_CONFIG` points at one),
    /// then environment overrides on top.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var(ENV_CONFIG) {
            Ok(path) => Self::from_file(PathBuf::from(path))?,
            Err(_) => Self::default(),
        };

        if let Ok(socket) = env::var(ENV_SOCKET) {
            config.socket_path = PathBuf::from(socket);
        }

        Ok(config)
    }

    /// Loads configuration from a toml file.
    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path).map_err(|e| ConfigError::Read {
            path: path.clone(),
            error: e.to_string(),
        })?;
        Self::from_toml(&contents).map_err(|e| ConfigError::Parse {
            path,
            error: e.to_string(),
        })
    }

    /// Parses configuration from a toml string.
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config {path}: {error}")]
    Parse { path: PathBuf, error: String },
}
