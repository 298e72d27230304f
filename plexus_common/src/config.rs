//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! for the Plexus server and its tools.
//!
//! # Usage
//!
//! ```rust,no_run
//! use plexus_common::config::{ConfigLoader, ServerSection, ConfigError};
//! use serde::Deserialize;
//! use std::path::Path;
//!
//! #[derive(Debug, Deserialize)]
//! struct MyConfig {
//!     server: ServerSection,
//! }
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = MyConfig::load(Path::new("plexus.toml"))?;
//!     println!("Port: {}", config.server.port);
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::address::MatchPolicy;
use crate::consts::{DEFAULT_PORT, DEFAULT_QUEUE_CAPACITY};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// The `[server]` table: process-wide settings.
///
/// # TOML Example
///
/// ```toml
/// [server]
/// port = 6665
/// host_id = 0
/// robot = 0
/// match_policy = "full"
/// queue_capacity = 32
/// log_level = "info"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// TCP port clients connect to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host field of locally-bound addresses.
    #[serde(default)]
    pub host_id: u32,

    /// Robot field used when a config address omits it.
    #[serde(default)]
    pub robot: u16,

    /// Which address fields take part in lookup and duplicate detection.
    #[serde(default)]
    pub match_policy: MatchPolicy,

    /// Bound of every driver inbox and client queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host_id: 0,
            robot: 0,
            match_policy: MatchPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            log_level: LogLevel::default(),
        }
    }
}

impl ServerSection {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `queue_capacity` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// Blanket-implemented for every `serde::de::DeserializeOwned` type.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
