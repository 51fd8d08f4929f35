//! Build pipeline for Stratum cluster images.
//!
//! This crate ties together schema parsing, the content-addressable stores,
//! and the runtime collaborators into `LocalBuilder`: a fixed stage list
//! (init spec, ensure base image, execute layers, capture registry cache,
//! finalize metadata, cleanup) threaded over an explicit `BuildSession`.
//! The layer engine realizes instructions in order against a chain-id cache,
//! the registry capture snapshots what the cluster pulled once it is steady,
//! and the finalizer embeds the Clusterfile and persists the image.

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod engine;
pub mod finalize;
pub mod pipeline;
pub mod registry;
pub mod session;

pub use cache::{CacheProbe, StoreProbe, CACHE_ID_KEY};
pub use concurrency::StoreLock;
pub use config::{BuildMode, BuildOptions, ReadinessPolicy, StratumConfig};
pub use context::{resolve_context, validate_context_dir, BuildContext};
pub use engine::{check_layer_limit, LayerEngine};
pub use finalize::{finalize_metadata, resolve_clusterfile};
pub use pipeline::{LocalBuilder, Stage};
pub use registry::{capture_registry_cache, wait_for_steady_state};
pub use session::{BuildResult, BuildSession, LayerOutcome};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("failed to execute '{instruction}': {reason}")]
    Execution { instruction: String, reason: String },
    #[error("cluster pods not running after {attempts} readiness checks")]
    ReadinessTimeout { attempts: u32 },
    #[error("too many layers: {count} exceeds the limit of {max}")]
    LayerLimit { count: usize, max: usize },
    #[error("no Clusterfile found: {0}")]
    MissingClusterfile(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("kubefile error: {0}")]
    Kubefile(#[from] stratum_schema::KubefileError),
    #[error("schema error: {0}")]
    Schema(#[from] stratum_schema::SchemaError),
    #[error("store error: {0}")]
    Store(#[from] stratum_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] stratum_runtime::RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<CoreError>,
    },
}

impl CoreError {
    /// Annotate with the stage that produced the error. Already annotated
    /// errors keep their original stage.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            e @ CoreError::Stage { .. } => e,
            e => CoreError::Stage {
                stage,
                source: Box::new(e),
            },
        }
    }

    /// The error with any stage annotation stripped.
    pub fn root_cause(&self) -> &CoreError {
        match self {
            CoreError::Stage { source, .. } => source.root_cause(),
            e => e,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            CoreError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
