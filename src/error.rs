//! Custom error types for the fleet.
//!
//! This module defines the primary error type, `FleetError`, shared by every layer of the
//! crate. Built with `thiserror`, it gives one consistent way to report what can go wrong
//! while wiring and running a fleet of participants.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps `figment` errors raised while reading the TOML file or environment.
//! - **`Configuration`**: Semantic problems with a parsed configuration (`ConfigError`), such
//!   as duplicate participant names or a subscription to an unknown worker. These are hard
//!   startup failures.
//! - **`Codec`**: Malformed wire input. Receivers log and drop these; they never abort a loop.
//! - **`Io`** / **`Bind`**: Socket and file I/O problems.
//! - **`Storage`**: Saver backend failures while writing a recording.
//! - **`FeatureNotEnabled`**: A backend was requested that was compiled out via Cargo features.
//! - **`Spawn`** / **`Protocol`**: Starting a participant process or talking to it over its
//!   control pipe.
//! - **`ParticipantCrashed`**: A participant process that exited without finishing.
//! - **`JoinTimeout`** / **`ShutdownFailed`**: Participants that did not finish in time.
//!
//! Worker runtime errors are not represented here: they travel as ERROR messages to the
//! orchestrator and are logged there.

use crate::wire::CodecError;
use thiserror::Error;

/// Convenience alias for results using the fleet error type.
pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// Errors raised while wiring and running a fleet.
#[derive(Error, Debug)]
pub enum FleetError {
    /// The configuration file or environment could not be read.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration was read but is not valid.
    #[error("Configuration validation error: {0}")]
    Configuration(#[from] ConfigError),

    /// Malformed wire data.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A listening socket could not be bound.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        /// Address that was requested
        address: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// No point-to-point link to this peer.
    #[error("Unknown peer '{0}'")]
    UnknownPeer(String),

    /// No participant of this name.
    #[error("Unknown participant '{0}'")]
    UnknownParticipant(String),

    /// A saver backend failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The requested backend was compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// A participant process could not be started.
    #[error("Failed to spawn participant '{name}': {source}")]
    Spawn {
        /// Participant name
        name: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A participant refused a control command.
    #[error("Control command rejected by '{name}': {reason}")]
    Control {
        /// Participant name
        name: String,
        /// Why it refused
        reason: String,
    },

    /// A participant was still running at the join deadline.
    #[error("Participant '{0}' did not finish before the join timeout")]
    JoinTimeout(String),

    /// A participant process ended without finishing.
    #[error("Participant '{name}' exited abnormally: {status}")]
    ParticipantCrashed {
        /// Participant name
        name: String,
        /// Exit status or signal
        status: String,
    },

    /// The control pipe carried something unexpected.
    #[error("Participant control protocol error: {0}")]
    Protocol(String),

    /// A saver did not answer a query in time.
    #[error("Request '{query}' to '{saver}' timed out")]
    RequestTimeout {
        /// Saver that was asked
        saver: String,
        /// Query that was sent
        query: String,
    },

    /// One or more participants did not finish cleanly.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<FleetError>),

    /// Writing a CSV file failed.
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Semantic configuration errors detected while validating a config or building the topology.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Two participants share a name.
    #[error("duplicate participant name '{0}'")]
    DuplicateParticipant(String),

    /// A participant uses a name reserved for the orchestrator.
    #[error("participant name '{0}' is reserved")]
    ReservedName(String),

    /// A participant has an empty name.
    #[error("participant name must not be empty")]
    EmptyName,

    /// A subscription names a worker that does not exist.
    #[error("'{subscriber}' subscribes to unknown worker '{target}'")]
    UnknownUpstream {
        /// Subscribing participant
        subscriber: String,
        /// Participant that was named
        target: String,
    },

    /// A participant subscribes to itself.
    #[error("'{participant}' subscribes to itself")]
    SelfSubscription {
        /// Participant name
        participant: String,
    },

    /// A worker names a saver that does not exist.
    #[error("worker '{worker}' names unknown saver '{saver}'")]
    UnknownSaver {
        /// Worker name
        worker: String,
        /// Saver name
        saver: String,
    },

    /// A saver lists another saver among its workers.
    #[error("saver '{saver}' cannot subscribe to saver '{target}'")]
    SaverSubscribesSaver {
        /// Saver name
        saver: String,
        /// Participant that was named
        target: String,
    },

    /// Automatic port assignment is off and a participant has no port.
    #[error("'{0}' needs an explicit port when auto_config is disabled")]
    MissingPort(String),

    /// Two participants claim the same port.
    #[error("port {port} is assigned to both '{first}' and '{second}'")]
    DuplicatePort {
        /// The contested port
        port: u16,
        /// First claimant
        first: String,
        /// Second claimant
        second: String,
    },

    /// No free port is left above the base port.
    #[error("port range exhausted after {0}")]
    PortsExhausted(u16),

    /// Two savers would write the same file.
    #[error("savers '{first}' and '{second}' would both write '{output}'")]
    DuplicateOutput {
        /// First claimant
        first: String,
        /// Second claimant
        second: String,
        /// Output file
        output: String,
    },

    /// No worker kind of this name is registered.
    #[error("unknown worker kind '{kind}' for '{name}'")]
    UnknownWorkerKind {
        /// Participant or trigger name
        name: String,
        /// Requested kind
        kind: String,
    },

    /// A trigger entry is inconsistent.
    #[error("invalid trigger '{name}': {reason}")]
    InvalidTrigger {
        /// Participant or trigger name
        name: String,
        /// What is wrong
        reason: String,
    },

    /// A message handler was registered twice.
    #[error("handler for {0} registered twice")]
    DuplicateHandler(String),

    /// A handler was registered for a built-in message.
    #[error("handler for {0} is built in and cannot be registered")]
    ReservedHandler(String),

    /// Any other invalid value.
    #[error("{0}")]
    Invalid(String),
}
