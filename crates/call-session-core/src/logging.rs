//! Tracing subscriber setup for binaries and demos
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application. [`setup_logging`] is a convenience for the
//! common case: an `EnvFilter` seeded from `RUST_LOG` plus a default level,
//! with optional JSON output.

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{SessionError, SessionResult};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// Emit one JSON object per event instead of human-readable lines
    pub json: bool,
    /// Include file and line information
    pub file_info: bool,
    /// Log span enter/exit
    pub log_spans: bool,
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
            app_name: "call-session".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Map the session configuration's verbosity flag to a level
    pub fn from_verbosity(verbose: bool) -> Self {
        LoggingConfig {
            level: if verbose { Level::DEBUG } else { Level::INFO },
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }
}

/// Install a global fmt subscriber
///
/// Fails instead of panicking if a global subscriber is already set.
pub fn setup_logging(config: LoggingConfig) -> SessionResult<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| SessionError::InvalidConfiguration {
        field: "logging".to_string(),
        reason: e.to_string(),
    })?;

    tracing::info!(app = %config.app_name, level = %config.level, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn verbosity_maps_to_level() {
        assert_eq!(LoggingConfig::from_verbosity(true).level, Level::DEBUG);
        assert_eq!(LoggingConfig::from_verbosity(false).level, Level::INFO);
    }

    #[test]
    #[serial]
    fn second_install_is_an_error() {
        // The first install may already have happened in another test
        let _ = setup_logging(LoggingConfig::default());
        let err = setup_logging(LoggingConfig::default().with_json()).unwrap_err();
        assert!(err.is_configuration());
    }
}
