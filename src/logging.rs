//! Structured logging setup.
//!
//! Every participant logs through `tracing` macros with structured fields such as
//! `participant`, `topic` and `source`. The orchestrator logs to stdout. Participant
//! processes log to stderr, because their stdout carries the control pipe.
//!
//! # Example
//! ```no_run
//! use daq_fleet::logging::{self, LogSettings};
//! use tracing::Level;
//!
//! logging::init(LogSettings::new(Level::DEBUG)).unwrap();
//! tracing::info!(participant = "camera", "started");
//! ```

use crate::config::{LogFormat, LoggingConfig};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Logging options.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Least severe level that is emitted
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Source file and line of each event
    pub with_file_and_line: bool,
    /// Name of the emitting thread
    pub with_thread_names: bool,
    /// ANSI colors (pretty format only)
    pub with_ansi: bool,
    /// Write to stderr instead of stdout
    pub to_stderr: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
            to_stderr: false,
        }
    }
}

impl LogSettings {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Builds settings from the `[logging]` config section.
    pub fn from_config(config: &LoggingConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.level)?,
            format: config.format,
            ..Default::default()
        })
    }

    /// Sets the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enables span open/close events.
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enables ANSI colors.
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Sends output to stderr. Participant processes always do.
    #[must_use]
    pub fn with_stderr(mut self, enabled: bool) -> Self {
        self.to_stderr = enabled;
        self
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more than once is
/// harmless: an already installed subscriber is left in place.
pub fn init(settings: LogSettings) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(settings.level)));

    let span_events = if settings.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let writer = if settings.to_stderr {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    let base = fmt::layer()
        .with_writer(writer)
        .with_span_events(span_events)
        .with_file(settings.with_file_and_line)
        .with_line_number(settings.with_file_and_line)
        .with_thread_names(settings.with_thread_names);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match settings.format {
        LogFormat::Pretty => base
            .pretty()
            .with_ansi(settings.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => base
            .compact()
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => base.json().with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

/// Convenience wrapper: settings from config, then [`init`].
pub fn init_from_config(config: &LoggingConfig) -> Result<(), String> {
    init(LogSettings::from_config(config)?)
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}
