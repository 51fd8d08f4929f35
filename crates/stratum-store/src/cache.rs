use crate::layout::StoreLayout;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use stratum_schema::{ChainId, LayerId};
use tracing::{debug, warn};

/// Association between a build lineage and the layer it produced.
pub trait ChainCache: Send + Sync {
    fn lookup(&self, chain_id: &ChainId) -> Result<Option<LayerId>, StoreError>;

    fn record(&self, chain_id: &ChainId, layer_id: &LayerId) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheRecord {
    pub chain_id: ChainId,
    pub layer_id: LayerId,
    pub recorded_at: String,
}

/// Append-only chain cache backed by a JSON-lines log.
///
/// The log is replayed into an in-memory index on open; a later record for
/// the same chain id shadows an earlier one. Unparseable lines (for example a
/// torn final write) are skipped with a warning.
pub struct FileChainCache {
    path: PathBuf,
    index: Mutex<HashMap<ChainId, LayerId>>,
}

impl FileChainCache {
    pub fn open(layout: &StoreLayout) -> Result<Self, StoreError> {
        let path = layout.chain_log();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut index = HashMap::new();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            for (n, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CacheRecord>(line) {
                    Ok(rec) => {
                        index.insert(rec.chain_id, rec.layer_id);
                    }
                    Err(e) => warn!("skipping corrupted cache record at line {}: {e}", n + 1),
                }
            }
        }
        debug!("loaded {} chain cache records", index.len());

        Ok(Self {
            path,
            index: Mutex::new(index),
        })
    }

    pub fn len(&self) -> usize {
        self.index.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChainCache for FileChainCache {
    fn lookup(&self, chain_id: &ChainId) -> Result<Option<LayerId>, StoreError> {
        let index = self
            .index
            .lock()
            .map_err(|e| StoreError::LockFailed(format!("chain cache mutex poisoned: {e}")))?;
        Ok(index.get(chain_id).cloned())
    }

    fn record(&self, chain_id: &ChainId, layer_id: &LayerId) -> Result<(), StoreError> {
        let mut index = self
            .index
            .lock()
            .map_err(|e| StoreError::LockFailed(format!("chain cache mutex poisoned: {e}")))?;
        if index.get(chain_id) == Some(layer_id) {
            return Ok(());
        }

        let rec = CacheRecord {
            chain_id: chain_id.clone(),
            layer_id: layer_id.clone(),
            recorded_at: chrono::Utc::now().to_rfc3339(),
        };
        let mut line = serde_json::to_string(&rec)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        index.insert(rec.chain_id, rec.layer_id);
        Ok(())
    }
}
