//! Environment variable overrides
//!
//! Every scalar in the schema can be overridden with a `CITADEL_*`
//! variable; overrides win over file values.

use crate::schema::{CitadelConfig, ConfigError};

/// Apply `CITADEL_*` overrides to an already-loaded configuration.
pub fn apply_env_overrides(config: &mut CitadelConfig) -> Result<(), ConfigError> {
    if let Some(value) = parsed("CITADEL_TICK_LENGTH_MS")? {
        config.engine.tick_length_ms = value;
    }
    if let Ok(value) = std::env::var("CITADEL_CONTROL_SOCKET") {
        config.engine.control_socket = value.into();
    }
    if let Some(value) = parsed("CITADEL_MIN_WORKERS")? {
        config.queue.min_workers = value;
    }
    if let Some(value) = parsed("CITADEL_MAX_WORKERS")? {
        config.queue.max_workers = value;
    }
    if let Some(value) = parsed("CITADEL_SUPERVISOR_THRESHOLD_MS")? {
        config.queue.supervisor_threshold_ms = value;
    }
    if let Some(value) = parsed("CITADEL_SHUTDOWN_TIMEOUT_MS")? {
        config.queue.shutdown_timeout_ms = value;
    }
    if let Some(value) = parsed("CITADEL_LOGIN_MAX_TRIES")? {
        config.login.max_tries = value;
    }
    if let Some(value) = parsed("CITADEL_LOGIN_TIMEOUT_MS")? {
        config.login.timeout_ms = value;
    }
    if let Ok(value) = std::env::var("CITADEL_LOGIN_BANNER") {
        config.login.banner = value;
    }
    if let Ok(value) = std::env::var("CITADEL_LOG_LEVEL") {
        config.log.level = value;
    }
    Ok(())
}

fn parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::BadOverride {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
