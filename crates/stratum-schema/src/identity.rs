//! Digest functions that define cache identity.
//!
//! Every cache key mixes in [`CACHE_FORMAT_VERSION`]. Any change to how keys
//! are derived must bump it, which invalidates all previously recorded
//! chain ids instead of silently matching stale ones.

use crate::image::LayerType;
use crate::types::ChainId;

pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Cache key of a RUN or CMD instruction: its type and exact text. The
/// filesystem state it runs against is carried by the parent chain id.
pub fn command_cache_key(layer_type: LayerType, value: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(format!("stratum-cache-v{CACHE_FORMAT_VERSION}\0").as_bytes());
    hasher.update(format!("{layer_type}\0").as_bytes());
    hasher.update(value.trim().as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Cache key of a COPY instruction: the digest of the source tree plus the
/// destination it lands at. Independent of anything executed before it.
pub fn copy_cache_key(source_digest: &str, destination: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(format!("stratum-cache-v{CACHE_FORMAT_VERSION}\0").as_bytes());
    hasher.update(b"COPY\0");
    hasher.update(source_digest.as_bytes());
    hasher.update(b"\0");
    hasher.update(destination.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Extend a lineage: `chain(n) = digest(chain(n-1), key(n))`.
///
/// The root of every lineage is the empty [`ChainId`].
pub fn combine_chain_id(parent: &ChainId, cache_key: &str) -> ChainId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(parent.as_bytes());
    hasher.update(b" ");
    hasher.update(cache_key.as_bytes());
    ChainId::new(hasher.finalize().to_hex().to_string())
}
