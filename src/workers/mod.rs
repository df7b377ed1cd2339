//! Built-in worker kinds and the registry that builds workers from module configuration.
//!
//! Hardware drivers live outside this crate; they register their own kinds with
//! [`WorkerRegistry::register`]. Participants run in separate processes, so a binary that
//! adds kinds must also serve its participants: hand the same registry to
//! [`supervisor::serve`](crate::supervisor::serve) under the `participant` subcommand and
//! launch the fleet with a [`ParticipantLauncher`](crate::supervisor::ParticipantLauncher)
//! pointing at that binary.

mod mock_camera;
pub mod mock_faulty;
mod mock_sensor;
mod relay;

pub use mock_camera::{MockCamera, MockCameraParams};
pub use mock_faulty::{MockFaulty, MockFaultyParams};
pub use mock_sensor::{MockSensor, MockSensorParams};
pub use relay::{Relay, RelayParams};

use crate::config::ModuleConfig;
use crate::error::{ConfigError, FleetResult};
use crate::participant::Launch;
use anyhow::Context as _;
use serde::de::DeserializeOwned;
use std::collections::HashMap;

type WorkerFactory = Box<dyn Fn(&ModuleConfig) -> anyhow::Result<Launch> + Send + Sync>;

/// Decodes a module's `params` table into the worker's typed parameters.
pub fn parse_params<T: DeserializeOwned>(params: &serde_json::Value) -> anyhow::Result<T> {
    serde_json::from_value(params.clone()).context("invalid worker parameters")
}

/// Maps worker kinds to factories.
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    /// A registry with the built-in kinds: `mock_sensor`, `mock_camera`, `mock_faulty` and
    /// `relay`.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register("mock_sensor", |module| {
            Ok(Launch::new(MockSensor::new(parse_params(&module.params)?)))
        });
        registry.register("mock_camera", |module| {
            Ok(Launch::new(MockCamera::new(parse_params(&module.params)?)))
        });
        registry.register("mock_faulty", |module| {
            Ok(Launch::new(MockFaulty::new(parse_params(&module.params)?)))
        });
        registry.register("relay", |module| {
            Ok(Launch::new(Relay::new(parse_params(&module.params)?)))
        });
        registry
    }

    /// A registry without any kinds.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Adds or replaces the factory for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&ModuleConfig) -> anyhow::Result<Launch> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    /// Whether `kind` is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Builds the worker for `module`.
    pub fn create(&self, module: &ModuleConfig) -> FleetResult<Launch> {
        let factory = self
            .factories
            .get(&module.worker)
            .ok_or_else(|| ConfigError::UnknownWorkerKind {
                name: module.name.clone(),
                kind: module.worker.clone(),
            })?;
        factory(module).map_err(|e| {
            ConfigError::Invalid(format!("module '{}': {e:#}", module.name)).into()
        })
    }
}
