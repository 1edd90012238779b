//! Configuration management for the citadel engine
//!
//! TOML-based configuration with environment variable overrides.
//! Loading hierarchy: env > file > defaults.

pub mod config;
pub mod env;
pub mod schema;

pub use config::{load_config, load_from_file, validate_config};
pub use env::apply_env_overrides;
pub use schema::{
    CitadelConfig, ConfigError, EngineSection, LogSection, LoginSection, QueueSection,
};
