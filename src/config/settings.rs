//! Server settings
//!
//! Loads listener, admission and store settings from a TOML file such as:
//!
//! ```toml
//! bind = "0.0.0.0"
//! port = 8080
//! allowed_origins = ["https://game.example.com"]
//!
//! [database]
//! url = "https://my-project.firebaseio.com"
//! auth = "secret"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Default bind address
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Connection details for the remote score database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseSettings {
    /// Base URL of the realtime database
    pub url: String,
    /// Optional auth token appended to every request
    #[serde(default)]
    pub auth: Option<String>,
}

/// Top-level server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Origins admitted by the relay handshake; empty admits every origin
    pub allowed_origins: Vec<String>,
    /// Remote score database; the in-memory store is used when absent
    pub database: Option<DatabaseSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            allowed_origins: Vec::new(),
            database: None,
        }
    }
}

impl Settings {
    /// Load settings from a file that must exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from `path` when given, otherwise fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
