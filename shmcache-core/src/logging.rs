//! Structured logging with tracing
//!
//! The library itself only emits `tracing` events. Binaries and tests that
//! want to see them call [`init_logging`] once.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub level: String,

    /// Enable JSON format output
    pub json_format: bool,

    /// Include the event target (module path)
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    pub fn parse_level(&self) -> Level {
        match self.level.to_uppercase().as_str() {
            "ERROR" => Level::ERROR,
            "WARN" => Level::WARN,
            "INFO" => Level::INFO,
            "DEBUG" => Level::DEBUG,
            "TRACE" => Level::TRACE,
            _ => Level::INFO,
        }
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.parse_level().as_str()));

    let subscriber = Registry::default().with(env_filter);

    if config.json_format {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(config.with_target)
            .with_thread_ids(true);

        subscriber.with(json_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(config.with_target)
            .with_thread_ids(false)
            .compact();

        subscriber.with(fmt_layer).try_init()?;
    }

    tracing::info!(
        "Logging initialized: level={}, json={}",
        config.level,
        config.json_format
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "INFO");
        assert_eq!(config.parse_level(), Level::INFO);

        let config = LoggingConfig {
            level: "debug".to_string(),
            ..Default::default()
        };
        assert_eq!(config.parse_level(), Level::DEBUG);

        let config = LoggingConfig {
            level: "chatty".to_string(),
            ..Default::default()
        };
        assert_eq!(config.parse_level(), Level::INFO);
    }

    #[test]
    fn test_init_twice_is_an_error() {
        let first = init_logging(LoggingConfig {
            json_format: true,
            ..Default::default()
        });
        // Another test may have installed a subscriber already
        let _ = first;
        assert!(init_logging(LoggingConfig::default()).is_err());
    }
}
