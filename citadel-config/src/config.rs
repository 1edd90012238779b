//! Configuration loading and validation

use std::path::{Path, PathBuf};

use crate::env::apply_env_overrides;
use crate::schema::{CitadelConfig, ConfigError};

/// Load configuration from file and environment variables.
///
/// Loading hierarchy: env > file > defaults. `path` overrides the
/// default location; a missing file falls back to defaults.
pub fn load_config(path: Option<&Path>) -> Result<CitadelConfig, ConfigError> {
    let config_file = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    let mut config = if config_file.exists() {
        load_from_file(&config_file)?
    } else {
        CitadelConfig::default()
    };

    apply_env_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a file path.
pub fn load_from_file(path: &Path) -> Result<CitadelConfig, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Default configuration file path: `$CITADEL_CONFIG`, else
/// `~/.citadel/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(explicit) = std::env::var("CITADEL_CONFIG") {
        return Ok(PathBuf::from(explicit));
    }
    let home =
        std::env::var("HOME").map_err(|_| ConfigError::Io("HOME not set".to_string()))?;
    let mut path = PathBuf::from(home);
    path.push(".citadel");
    path.push("config.toml");
    Ok(path)
}

/// Reject configurations the engine cannot run with.
pub fn validate_config(config: &CitadelConfig) -> Result<(), ConfigError> {
    if config.engine.tick_length_ms < 10 {
        return Err(ConfigError::Invalid(
            "engine.tick_length_ms must be at least 10".to_string(),
        ));
    }
    if config.queue.min_workers == 0 {
        return Err(ConfigError::Invalid(
            "queue.min_workers must be at least 1".to_string(),
        ));
    }
    if config.queue.max_workers != 0 && config.queue.max_workers < config.queue.min_workers {
        return Err(ConfigError::Invalid(
            "queue.max_workers must be 0 (auto) or >= queue.min_workers".to_string(),
        ));
    }
    if config.login.max_tries == 0 {
        return Err(ConfigError::Invalid(
            "login.max_tries must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = CitadelConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.engine.tick_length_ms, 250);
        assert_eq!(config.queue.min_workers, 2);
        assert_eq!(config.login.max_tries, 3);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine]\ntick_length_ms = 100\n\n[queue]\nmin_workers = 4\nmax_workers = 8\n"
        )
        .unwrap();

        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.engine.tick_length_ms, 100);
        assert_eq!(config.queue.min_workers, 4);
        assert_eq!(config.queue.max_workers, 8);
        // Untouched sections keep their defaults.
        assert_eq!(config.login.max_tries, 3);
    }

    #[test]
    fn garbage_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not toml at all [").unwrap();
        assert!(matches!(
            load_from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn worker_bounds_are_validated() {
        let mut config = CitadelConfig::default();
        config.queue.min_workers = 4;
        config.queue.max_workers = 2;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));

        config.queue.max_workers = 0;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn zero_max_tries_is_rejected() {
        let mut config = CitadelConfig::default();
        config.login.max_tries = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = CitadelConfig::default();
        config.engine.tick_length_ms = 125;
        config.login.banner = "hi\n".to_string();

        let rendered = toml::to_string(&config).unwrap();
        let reparsed: CitadelConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(reparsed, config);
    }
}
