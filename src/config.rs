//! Fleet configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file describing modules (workers), savers and triggers
//! 2. environment variables prefixed with `DAQ_FLEET_` with `__` between
//!    nesting levels (e.g. `DAQ_FLEET_TRANSPORT__BASE_PORT=6000`)
//!
//! Unknown keys are rejected so that typos fail at startup instead of being ignored.
//!
//! # Example
//! ```no_run
//! use daq_fleet::config::FleetConfig;
//!
//! let config = FleetConfig::load("fleet.toml")?;
//! config.validate()?;
//! # Ok::<(), daq_fleet::error::FleetError>(())
//! ```

use crate::error::{ConfigError, FleetResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level fleet configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    /// Socket settings shared by every participant
    #[serde(default)]
    pub transport: TransportConfig,
    /// Startup connection check
    #[serde(default)]
    pub handshake: HandshakeConfig,
    /// Recording target and port assignment
    #[serde(default)]
    pub gui_params: GuiParams,
    /// Workers, in startup order
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    /// Savers, in startup order
    #[serde(default)]
    pub savers: Vec<SaverConfig>,
    /// Trigger sources watched by the orchestrator
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    /// Log level and format
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Host used in connect addresses
    #[serde(default = "default_host")]
    pub host: String,
    /// First port handed out by the port allocator
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Largest accepted frame
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Per-subscriber outbound queue; overflow drops messages
    #[serde(default = "default_publish_queue")]
    pub publish_queue: usize,
    /// Per-participant inbound queue
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Delay between connection attempts to a peer that is not up yet
    #[serde(default = "default_connect_retry", with = "humantime_serde")]
    pub connect_retry: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            base_port: default_base_port(),
            max_frame_bytes: default_max_frame_bytes(),
            publish_queue: default_publish_queue(),
            inbox_capacity: default_inbox_capacity(),
            connect_retry: default_connect_retry(),
        }
    }
}

/// Startup connection check settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandshakeConfig {
    /// Overall wait before participants are declared unresponsive
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Interval between repeated connection checks
    #[serde(default = "default_rebroadcast_interval", with = "humantime_serde")]
    pub rebroadcast_interval: Duration,
    /// How long shutdown waits for every participant to finish
    #[serde(default = "default_join_timeout", with = "humantime_serde")]
    pub join_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: default_handshake_timeout(),
            rebroadcast_interval: default_rebroadcast_interval(),
            join_timeout: default_join_timeout(),
        }
    }
}

/// Recording target and address assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuiParams {
    /// Directory recordings are written into
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Base filename (without extension) for recordings
    #[serde(default = "default_filename")]
    pub filename: String,
    /// Allocate ports automatically; when false every participant declares `port`
    #[serde(default = "default_true")]
    pub auto_config: bool,
}

impl Default for GuiParams {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            filename: default_filename(),
            auto_config: true,
        }
    }
}

/// One worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleConfig {
    /// Unique participant name
    pub name: String,
    /// Worker kind looked up in the worker registry
    pub worker: String,
    /// Upstream workers whose data this worker consumes
    #[serde(default)]
    pub subscriptions: Vec<String>,
    /// Saver that records this worker
    #[serde(default)]
    pub saver: Option<String>,
    /// Explicit port (required when `auto_config = false`)
    #[serde(default)]
    pub port: Option<u16>,
    /// Worker-specific parameters
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

/// One saver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaverConfig {
    /// Unique participant name
    pub name: String,
    /// Backend name looked up in the backend registry (`tabular`, `hierarchical`, `frames`)
    pub backend: String,
    /// Workers recorded by this saver
    #[serde(default)]
    pub workers: Vec<String>,
    /// Explicit port (required when `auto_config = false`)
    #[serde(default)]
    pub port: Option<u16>,
    /// Entries kept per source and data shape before the oldest are overwritten
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Appended to the session filename, `<filename>_<suffix>.<ext>`
    #[serde(default)]
    pub file_suffix: Option<String>,
}

/// Trigger source kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Fires every `period`
    Interval,
    /// Fires when a TRIGGER arrives from a publisher at `address`
    Remote,
}

/// One trigger source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    /// Trigger name, used in logs
    pub name: String,
    /// Interval or remote
    pub kind: TriggerKind,
    /// Firing period of an interval trigger
    #[serde(default, with = "humantime_serde")]
    pub period: Option<Duration>,
    /// `host:port` of an external publisher
    #[serde(default)]
    pub address: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// Single-line
    Compact,
    /// One JSON object per event
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Pretty, compact or JSON lines
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    5555
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_publish_queue() -> usize {
    1024
}

fn default_inbox_capacity() -> usize {
    4096
}

fn default_connect_retry() -> Duration {
    Duration::from_millis(20)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_rebroadcast_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_filename() -> String {
    "session".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cache_size() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl FleetConfig {
    /// Load configuration from a TOML file and `DAQ_FLEET_` environment variables.
    pub fn load<P: AsRef<Path>>(path: P) -> FleetResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_FLEET_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from an in-memory TOML document (no environment overrides).
    pub fn from_toml_str(toml: &str) -> FleetResult<Self> {
        Ok(Figment::from(Toml::string(toml)).extract()?)
    }

    /// Every participant name, workers first.
    pub fn participant_names(&self) -> impl Iterator<Item = &str> {
        self.modules
            .iter()
            .map(|m| m.name.as_str())
            .chain(self.savers.iter().map(|s| s.name.as_str()))
    }

    /// Validate field-level constraints after loading.
    ///
    /// Graph constraints (unknown upstream workers, duplicate ports) are checked when the
    /// topology is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.handshake.rebroadcast_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "handshake.rebroadcast_interval must be greater than zero".into(),
            ));
        }

        for name in self.participant_names() {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
        }

        for saver in &self.savers {
            if saver.cache_size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "saver '{}' must have a cache_size greater than zero",
                    saver.name
                )));
            }
        }

        let mut trigger_names = HashSet::new();
        for trigger in &self.triggers {
            if !trigger_names.insert(trigger.name.as_str()) {
                return Err(ConfigError::DuplicateParticipant(trigger.name.clone()));
            }
            let invalid = |reason: &str| ConfigError::InvalidTrigger {
                name: trigger.name.clone(),
                reason: reason.to_string(),
            };
            match trigger.kind {
                TriggerKind::Interval => match trigger.period {
                    Some(period) if !period.is_zero() => {}
                    _ => return Err(invalid("interval triggers need a non-zero period")),
                },
                TriggerKind::Remote => {
                    if trigger.address.as_deref().map_or(true, str::is_empty) {
                        return Err(invalid("remote triggers need an address"));
                    }
                }
            }
        }

        Ok(())
    }
}
