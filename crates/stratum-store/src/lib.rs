//! Content-addressable layer store, image store, and chain cache for Stratum.
//!
//! This crate provides the storage layer: `LayerStore` registers directory
//! trees under the blake3 digest of their deterministic tar packing and keeps
//! per-layer metadata, `ImageStore` persists image documents by id and maps
//! names onto them, `FileChainCache` is the append-only chain-id to layer-id
//! association log, and `StoreLayout` owns the directory structure.

pub mod cache;
pub mod images;
pub mod layers;
pub mod layout;

pub use cache::{CacheRecord, ChainCache, FileChainCache};
pub use images::{validate_image_name, ImageStore};
pub use layers::{content_digest, pack_layer, unpack_layer, LayerStore};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee a rename is durable without syncing the parent
/// directory; calling `fsync()` on it makes it so on every filesystem.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{hash}': expected {expected}, got {actual}")]
    IntegrityFailure {
        hash: String,
        expected: String,
        actual: String,
    },
    #[error("layer not found: {0}")]
    LayerNotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("schema error: {0}")]
    Schema(#[from] stratum_schema::SchemaError),
    #[error("invalid name: {0}")]
    InvalidName(String),
}
