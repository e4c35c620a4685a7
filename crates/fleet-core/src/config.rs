//! Shared configuration pieces for the gpufleet daemons
//!
//! Each daemon defines its own top-level config struct; the logging section
//! and the YAML file helpers are common and live here.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;

/// Logging configuration shared by the scheduler and agent daemons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
        }
    }
}

impl LoggingConfig {
    /// Validate the logging section
    pub fn validate(&self) -> Result<()> {
        match self.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(Error::config(format!("Invalid log level: {}", other))),
        }

        match self.format.as_str() {
            "text" | "json" => {}
            other => return Err(Error::config(format!("Invalid log format: {}", other))),
        }

        Ok(())
    }
}

/// Initialize the global tracing subscriber from a logging config.
///
/// The `RUST_LOG` environment variable takes precedence over the configured
/// level when set.
pub fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.show_target);

    match config.format.as_str() {
        "json" => subscriber.json().init(),
        _ => subscriber.init(),
    }
}

/// Load a YAML config file into any serde-deserializable config struct
pub fn load_yaml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    serde_yaml::from_str(&content).map_err(|e| {
        Error::config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Save a config struct to a YAML file
pub fn save_yaml<T: Serialize>(config: &T, path: impl AsRef<Path>) -> Result<()> {
    let content = serde_yaml::to_string(config)
        .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?;

    std::fs::write(path.as_ref(), content)
        .map_err(|e| Error::config(format!("Failed to write config file: {}", e)))?;

    Ok(())
}
