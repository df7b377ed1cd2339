//! Saver backend trait and name-based registry.

use super::cache::CachedEntry;
use super::session::RecordingTarget;
use crate::config::SaverConfig;
use crate::error::{FleetError, FleetResult};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[cfg(feature = "storage_csv")]
use super::frames::FramesBackend;
#[cfg(feature = "storage_hdf5")]
use super::hierarchical::HierarchicalBackend;
#[cfg(feature = "storage_csv")]
use super::tabular::TabularBackend;

/// What a backend wrote for one recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushSummary {
    /// Entries written.
    pub entries: usize,
    /// Entries the backend cannot represent and skipped.
    pub skipped: usize,
    /// Files written, in creation order.
    pub paths: Vec<PathBuf>,
}

/// A file format a saver can record into.
///
/// Called from the saver's process, one recording at a time:
/// `start_recording`, any number of `accept`, then `stop_recording`.
pub trait SaverBackend: Send {
    /// Registry name.
    fn name(&self) -> &str;

    /// Prepares the files of one recording of `sources`.
    fn start_recording(&mut self, target: &RecordingTarget, sources: &[String]) -> FleetResult<()>;

    /// Takes one flushed cache entry.
    fn accept(&mut self, entry: &CachedEntry) -> FleetResult<()>;

    /// Writes out everything accepted and closes the files.
    fn stop_recording(&mut self) -> FleetResult<FlushSummary>;
}

type BackendFactory = Box<dyn Fn(&SaverConfig) -> Box<dyn SaverBackend> + Send + Sync>;

/// Backends compiled out of this build, with the feature that enables them.
const GATED: &[(&str, &str)] = &[
    ("tabular", "storage_csv"),
    ("frames", "storage_csv"),
    ("hierarchical", "storage_hdf5"),
];

/// Maps backend names to factories. Built-in backends register according to enabled features.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    /// Registry with the built-in backends of this build.
    pub fn new() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self {
            factories: HashMap::new(),
        };

        #[cfg(feature = "storage_csv")]
        registry.register("tabular", |config| {
            Box::new(TabularBackend::new(config.file_suffix.clone()))
        });

        #[cfg(feature = "storage_csv")]
        registry.register("frames", |config| {
            Box::new(FramesBackend::new(config.file_suffix.clone()))
        });

        #[cfg(feature = "storage_hdf5")]
        registry.register("hierarchical", |config| {
            Box::new(HierarchicalBackend::new(config.file_suffix.clone()))
        });

        registry
    }

    /// Registers a custom backend, replacing any built-in of the same name.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&SaverConfig) -> Box<dyn SaverBackend> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Creates the backend a saver is configured with.
    pub fn create(&self, config: &SaverConfig) -> FleetResult<Box<dyn SaverBackend>> {
        if let Some(factory) = self.factories.get(&config.backend) {
            return Ok(factory(config));
        }
        if let Some((_, feature)) = GATED.iter().find(|(name, _)| *name == config.backend) {
            return Err(FleetError::FeatureNotEnabled(format!(
                "backend '{}' requires feature '{feature}'",
                config.backend
            )));
        }
        Err(FleetError::Storage(format!(
            "unknown backend '{}' for saver '{}'; available: [{}]",
            config.backend,
            config.name,
            self.list().join(", ")
        )))
    }

    /// Registered backend names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a backend of this name is registered.
    pub fn is_available(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}
