use std::sync::Arc;
use stratum_schema::{ChainId, Layer, LayerId, LayerType};
use stratum_store::{ChainCache, LayerStore};
use tracing::{debug, warn};

/// Layer metadata key holding the cache key a COPY layer was realized from.
pub const CACHE_ID_KEY: &str = "cache-id";

/// Decides whether a previously realized layer can stand in for `layer`.
pub trait CacheProbe: Send + Sync {
    /// The reusable layer id, or `None` on a miss. Lookup failures are
    /// misses.
    fn probe(&self, chain_id: &ChainId, layer: &Layer, cache_key: &str) -> Option<LayerId>;
}

/// Probes the chain cache, then for COPY the `cache-id` layer metadata.
/// A hit only counts if the layer is still present in the store.
pub struct StoreProbe {
    cache: Arc<dyn ChainCache>,
    layers: LayerStore,
}

impl StoreProbe {
    pub fn new(cache: Arc<dyn ChainCache>, layers: LayerStore) -> Self {
        Self { cache, layers }
    }

    fn present(&self, id: LayerId) -> Option<LayerId> {
        if self.layers.exists(&id) {
            Some(id)
        } else {
            debug!("cached layer {} no longer in store", id.short());
            None
        }
    }
}

impl CacheProbe for StoreProbe {
    fn probe(&self, chain_id: &ChainId, layer: &Layer, cache_key: &str) -> Option<LayerId> {
        match self.cache.lookup(chain_id) {
            Ok(Some(id)) => {
                if let Some(id) = self.present(id) {
                    return Some(id);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("chain cache lookup failed for {}: {e}", chain_id.short()),
        }

        if layer.layer_type != LayerType::Copy {
            return None;
        }
        match self
            .layers
            .find_by_metadata(CACHE_ID_KEY, cache_key.as_bytes())
        {
            Ok(Some(id)) => self.present(id),
            Ok(None) => None,
            Err(e) => {
                warn!("cache-id lookup failed: {e}");
                None
            }
        }
    }
}
