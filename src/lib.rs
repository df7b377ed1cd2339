//! # daq_fleet
//!
//! Messaging substrate and lifecycle supervisor for a fleet of data-acquisition participants.
//!
//! Workers (cameras, sensors, stimulus drivers) each run in their own OS process, publish
//! timestamped measurements over typed publish/subscribe links, and are recorded by savers
//! under one fleet-wide recording gate. An [`orchestrator::Orchestrator`] builds the wiring
//! from configuration, starts every participant process, checks that the fleet is connected and
//! drives recordings.
//!
//! ## Crate Structure
//!
//! - **`wire`**: payload codec, message catalog and multipart framing.
//! - **`transport`**: role capabilities (publisher, subscriber, sender, receiver) and the
//!   per-participant inbox.
//! - **`topology`**: turns a [`config::FleetConfig`] into addresses and subscription edges.
//! - **`participant`**: the [`participant::Worker`] trait, the participant `Context` and
//!   handler dispatch.
//! - **`supervisor`**: participant processes, their control pipe, lifecycle flags and the
//!   main loop.
//! - **`handshake`**: startup connection check.
//! - **`orchestrator`**: owns the fleet.
//! - **`recording`**: recording session, caches, saver backends and the saver participant.
//! - **`workers`**: built-in worker kinds and the worker registry.
//! - **`config`**, **`error`**, **`logging`**: configuration loading, error types, tracing setup.

pub mod config;
pub mod error;
pub mod handshake;
pub mod logging;
pub mod orchestrator;
pub mod participant;
pub mod recording;
pub mod supervisor;
pub mod topology;
pub mod transport;
pub mod wire;
pub mod workers;

pub use config::FleetConfig;
pub use error::{ConfigError, FleetError, FleetResult};
pub use orchestrator::Orchestrator;
pub use supervisor::ParticipantLauncher;
pub use participant::{Context, Dispatch, Worker};
