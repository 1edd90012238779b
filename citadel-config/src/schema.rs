//! Configuration schema and defaults

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("config io error: {0}")]
    Io(String),
    /// File was not valid TOML for the schema
    #[error("config parse error: {0}")]
    Parse(String),
    /// An environment override was malformed
    #[error("bad environment override {name}: {value}")]
    BadOverride {
        /// Variable name
        name: String,
        /// Rejected value
        value: String,
    },
    /// Values rejected by validation
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CitadelConfig {
    /// Engine loop settings
    pub engine: EngineSection,
    /// Event queue sizing
    pub queue: QueueSection,
    /// Login conversation settings
    pub login: LoginSection,
    /// Logging settings
    pub log: LogSection,
}

/// `[engine]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSection {
    /// Milliseconds between simulation ticks
    pub tick_length_ms: u64,
    /// Unix socket the running engine answers `stop`/`status` on
    pub control_socket: PathBuf,
}

impl Default for EngineSection {
    fn default() -> Self {
        EngineSection {
            tick_length_ms: 250,
            control_socket: std::env::temp_dir().join("citadel.sock"),
        }
    }
}

/// `[queue]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSection {
    /// Worker pool floor
    pub min_workers: usize,
    /// Worker pool ceiling; 0 means "number of CPUs"
    pub max_workers: usize,
    /// Milliseconds between supervisor passes
    pub supervisor_threshold_ms: u64,
    /// Milliseconds the queue drain may take at shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        QueueSection {
            min_workers: 2,
            max_workers: 0,
            supervisor_threshold_ms: 200,
            shutdown_timeout_ms: 5000,
        }
    }
}

/// `[login]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoginSection {
    /// Failed attempts before the session is terminated
    pub max_tries: u32,
    /// Milliseconds before an unfinished login times out
    pub timeout_ms: u64,
    /// Greeting shown on connect
    pub banner: String,
}

impl Default for LoginSection {
    fn default() -> Self {
        LoginSection {
            max_tries: 3,
            timeout_ms: 60_000,
            banner: "Connected to Citadel.\n".to_string(),
        }
    }
}

/// `[log]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSection {
    /// Subscriber filter directive, e.g. `info` or `citadel_engine=debug`
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        LogSection {
            level: "info".to_string(),
        }
    }
}
