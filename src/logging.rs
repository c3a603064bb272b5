//! Tracing setup.
//!
//! Builds a `tracing-subscriber` registry with an [`EnvFilter`] (so `RUST_LOG`
//! always wins) and one of three formatters. Initialisation is idempotent:
//! a second call, or a call after a test harness installed its own
//! subscriber, succeeds without doing anything.
//!
//! # Example
//! ```no_run
//! use mightywatt::{config::LoadConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoadConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(port = ?config.serial.port, "starting");
//! # Ok(())
//! # }
//! ```

use crate::config::LoadConfig;
use crate::error::{LoadError, LoadResult};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line with colours, for a terminal.
    #[default]
    Pretty,
    /// One line per event, no colours.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level emitted unless `RUST_LOG` says otherwise.
    pub level: Level,
    /// Line format.
    pub format: OutputFormat,
    /// Log span NEW and CLOSE events (connect, disconnect, program start).
    pub with_span_events: bool,
    /// Include source file and line.
    pub with_file_and_line: bool,
    /// Colour output.
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Options from the `[application]` and `[logging]` sections.
    pub fn from_load_config(config: &LoadConfig) -> LoadResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.logging.format,
            with_span_events: config.logging.span_events,
            with_file_and_line: config.logging.file_and_line,
            with_ansi: true,
        })
    }

    /// Set the line format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open and close.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable colour.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialise logging from the loaded configuration.
pub fn init_from_config(config: &LoadConfig) -> LoadResult<()> {
    init(LoggingConfig::from_load_config(config)?)
}

/// Install the global subscriber.
pub fn init(config: LoggingConfig) -> LoadResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_target(true);

    let layer = match config.format {
        OutputFormat::Pretty => layer
            .pretty()
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => layer
            .compact()
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => layer.json().with_filter(env_filter).boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Already initialised, typically by another test.
        Err(err) if tracing::dispatcher::has_been_set() => {
            tracing::debug!(error = %err, "tracing already initialised");
            Ok(())
        }
        Err(err) => Err(LoadError::Configuration(format!(
            "failed to initialise tracing: {err}"
        ))),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> LoadResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(LoadError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}
