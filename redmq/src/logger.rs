//! Logging setup
//!
//! The library only emits `tracing` events. Applications that want redmq to
//! install a subscriber call [`init`] once at startup.

use crate::{Error, Result};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Logger configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Install a subscriber at all
    pub enabled: bool,
    /// Filter directive, e.g. `info` or `redmq=debug,warn`
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Install a global `tracing` subscriber according to `config`
///
/// `RUST_LOG`, when set, takes precedence over `config.level`. Returns an
/// error if a global subscriber is already installed.
pub fn init(config: &LoggerConfig) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Config(format!("invalid log level '{}': {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| Error::Config(format!("failed to install logger: {}", e)))
}
