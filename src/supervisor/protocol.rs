//! Control pipe between the orchestrator and one participant process.
//!
//! Newline-delimited JSON. The first line on the child's stdin is the [`ParticipantSpec`];
//! every later line is a [`Command`]. The child answers with [`Report`] lines on stdout.
//! Nothing else may be written to the child's stdout, so participant logs go to stderr.
//! End of file on stdin means the orchestrator is gone and the participant exits.

use super::LifecycleState;
use crate::config::{LoggingConfig, ModuleConfig, SaverConfig, TransportConfig};
use crate::error::{FleetError, FleetResult};
use crate::topology::Wiring;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// What a participant process runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Body {
    /// A worker built from its module entry by the worker registry.
    Worker {
        /// The module entry, parameters included
        module: ModuleConfig,
    },
    /// A saver recording `sources`.
    Saver {
        /// The saver entry
        saver: SaverConfig,
        /// Workers this saver records, in declaration order
        sources: Vec<String>,
    },
}

/// Everything a participant process boots from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSpec {
    /// Addresses and subscription edges
    pub wiring: Wiring,
    /// Socket settings
    pub transport: TransportConfig,
    /// Log level and format for the child's stderr
    pub logging: LoggingConfig,
    /// Worker or saver
    pub body: Body,
}

impl ParticipantSpec {
    /// The participant's name.
    pub fn name(&self) -> &str {
        &self.wiring.name
    }
}

/// Orchestrator to participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Raise the start flag (and clear stop).
    Start,
    /// Raise the stop flag (and clear start).
    Stop,
    /// Leave the loop at the next iteration.
    Exit,
    /// Replace constructor parameters; answered by [`Report::ParamsUpdated`] with the same id.
    UpdateParams {
        /// Request id, echoed in the reply
        id: u64,
        /// New parameters
        params: serde_json::Value,
    },
}

/// Participant to orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum Report {
    /// The participant entered `state`.
    State {
        /// New lifecycle state
        state: LifecycleState,
    },
    /// Outcome of an [`Command::UpdateParams`].
    ParamsUpdated {
        /// Id of the request
        id: u64,
        /// Why the update was rejected; absent on success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Encodes one protocol line, newline included.
pub fn encode<T: Serialize>(value: &T) -> FleetResult<String> {
    let mut line = serde_json::to_string(value).map_err(|e| FleetError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Decodes one protocol line.
pub fn decode<T: DeserializeOwned>(line: &str) -> FleetResult<T> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| FleetError::Protocol(format!("{e} in {:?}", line.trim_end())))
}
