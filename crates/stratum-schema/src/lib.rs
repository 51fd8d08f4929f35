//! Image document, instruction parsing, and digest identity for Stratum.
//!
//! This crate defines the schema layer: the cluster-image document (`Image`,
//! `Layer`, `LayerType`), the Kubefile parser that turns build instructions
//! into an unrealized image, the Clusterfile document embedded as an image
//! annotation, and the pure digest functions behind chain ids, cache keys,
//! and image ids.

pub mod cluster;
pub mod identity;
pub mod image;
pub mod kubefile;
pub mod types;

pub use cluster::{rewrite_clusterfile_image, ClusterDocument, ClusterSpec, ClusterfileError};
pub use identity::{combine_chain_id, command_cache_key, copy_cache_key, CACHE_FORMAT_VERSION};
pub use image::{Image, Layer, LayerType};
pub use kubefile::{parse_instructions, parse_kubefile, parse_kubefile_str, Instruction, KubefileError};
pub use types::{ChainId, ImageId, LayerId};

use thiserror::Error;

/// Base-image literal for an image with no parent layers.
pub const SCRATCH_IMAGE: &str = "scratch";

/// Reserved Clusterfile name, both as a COPY source and as the default file
/// staged for scratch builds.
pub const CLUSTERFILE_NAME: &str = "Clusterfile";

/// Annotation key holding the serialized Clusterfile.
pub const CLUSTERFILE_ANNOTATION: &str = "stratum.dev/clusterfile";

/// Conventional instruction-file name at the context root.
pub const DEFAULT_KUBEFILE: &str = "Kubefile";

/// Upper bound on base + new layers in one image.
pub const MAX_LAYER_DEPTH: usize = 128;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("kubefile error: {0}")]
    Kubefile(#[from] KubefileError),
    #[error("clusterfile error: {0}")]
    Clusterfile(#[from] ClusterfileError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
