use crate::concurrency::StoreLock;
use crate::config::BuildOptions;
use crate::context::BuildContext;
use serde::Serialize;
use stratum_runtime::RegistryMount;
use stratum_schema::{Image, ImageId, Layer};

/// How one new layer was realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerOutcome {
    CacheHit,
    Executed,
    /// Lite build only: the instruction failed and the layer has no id.
    Skipped,
    /// The registry snapshot appended after all instructions ran.
    Captured,
}

/// State threaded through the build stages.
///
/// `image` starts as the parsed Kubefile and ends as the finalized document.
/// `base_layers` are the parent image's layers and never change after the
/// base image is ensured; `new_layers` are the instructions after FROM.
/// Dropping a session releases any registry mount it still holds.
pub struct BuildSession {
    pub name: String,
    pub context: BuildContext,
    pub options: BuildOptions,
    pub image: Image,
    pub base_layers: Vec<Layer>,
    pub new_layers: Vec<Layer>,
    /// One entry per element of `new_layers` once layers are executed.
    pub outcomes: Vec<LayerOutcome>,
    pub registry: Option<RegistryMount>,
    pub(crate) registry_lock: Option<StoreLock>,
}

impl BuildSession {
    pub fn new(name: &str, context: BuildContext, options: BuildOptions) -> Self {
        Self {
            name: name.to_owned(),
            context,
            options,
            image: Image::default(),
            base_layers: Vec::new(),
            new_layers: Vec::new(),
            outcomes: Vec::new(),
            registry: None,
            registry_lock: None,
        }
    }

    pub fn layer_count(&self) -> usize {
        self.base_layers.len() + self.new_layers.len()
    }

    /// Release the registry mount and its target lock. Safe to call twice.
    pub fn release_registry(&mut self) -> Result<(), stratum_runtime::RuntimeError> {
        let result = match self.registry.as_mut() {
            Some(mount) => mount.release(),
            None => Ok(()),
        };
        self.registry = None;
        self.registry_lock = None;
        result
    }

    pub fn into_result(self) -> BuildResult {
        BuildResult {
            image_id: self.image.id.clone(),
            name: self.name.clone(),
            layers: self.image.layers.clone(),
            outcomes: self.outcomes.clone(),
        }
    }
}

/// Summary of a finished build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub image_id: ImageId,
    pub name: String,
    pub layers: Vec<Layer>,
    pub outcomes: Vec<LayerOutcome>,
}

impl BuildResult {
    pub fn count(&self, outcome: LayerOutcome) -> usize {
        self.outcomes.iter().filter(|o| **o == outcome).count()
    }
}
