//! Structured logging bootstrap.
//!
//! Builds a `tracing-subscriber` pipeline from the config's `LoggingConfig`
//! section. Initialization is idempotent per process — repeated calls after
//! the first are no-ops, which keeps test binaries that spin up several
//! sessions from fighting over the global subscriber.

use crate::config::LoggingConfig;
use crate::error::{CommError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber described by the config.
///
/// Console and file output are mutually exclusive in one process-wide
/// subscriber; when both are enabled the file wins, since console output is
/// recoverable by other means.
pub fn init(config: &LoggingConfig) -> Result<()> {
    check(config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string().to_lowercase()));

    let init_result = if config.log_to_file {
        let path = config
            .log_file_path
            .as_ref()
            .ok_or_else(|| CommError::Config("log_to_file set without log_file_path".into()))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CommError::Config(format!("Failed to open log file '{path}': {e}")))?;
        let writer = Mutex::new(file);

        if config.json_format {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
        }
    } else if config.json_format {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    // A subscriber installed earlier in this process is fine
    let _ = init_result;
    Ok(())
}

/// Install a plain subscriber at the default level, for examples and tests.
pub fn init_default() -> Result<()> {
    init(&LoggingConfig::default())
}

/// Validate that the config names a usable log destination before the
/// subscriber is built, surfacing misconfiguration as a `Config` error.
pub fn check(config: &LoggingConfig) -> Result<()> {
    let errors = config.validate();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CommError::Config(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }

    #[test]
    fn check_flags_missing_outputs() {
        let config = LoggingConfig {
            log_to_console: false,
            log_to_file: false,
            ..LoggingConfig::default()
        };
        assert!(check(&config).is_err());
    }
}
