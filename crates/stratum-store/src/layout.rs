use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout for the Stratum store.
///
/// Manages paths for layers, image documents, the chain-id cache, staging,
/// and registry mount scratch space. All subdirectories are created lazily on
/// [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn layers_dir(&self) -> PathBuf {
        self.root.join("store").join("layers")
    }

    /// Directory of one registered layer: `data/` holds the tree, `meta/`
    /// holds per-layer key/value metadata.
    #[inline]
    pub fn layer_path(&self, layer_id: &str) -> PathBuf {
        self.layers_dir().join(layer_id)
    }

    #[inline]
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("store").join("images")
    }

    #[inline]
    pub fn image_index(&self) -> PathBuf {
        self.images_dir().join("index.json")
    }

    #[inline]
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("store").join("cache")
    }

    /// Append-only chain-id association log.
    #[inline]
    pub fn chain_log(&self) -> PathBuf {
        self.cache_dir().join("chains.jsonl")
    }

    /// Temporary staging area for layer registration and RUN scratch dirs.
    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("store").join("staging")
    }

    /// Upper/work directories of registry overlay mounts live here.
    #[inline]
    pub fn mounts_dir(&self) -> PathBuf {
        self.root.join("mounts")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join("store").join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.layers_dir())?;
        fs::create_dir_all(self.images_dir())?;
        fs::create_dir_all(self.cache_dir())?;
        fs::create_dir_all(self.staging_dir())?;
        fs::create_dir_all(self.mounts_dir())?;

        let version_path = self.root.join("store").join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let store_dir = self.root.join("store");
            let mut tmp = NamedTempFile::new_in(&store_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&store_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.root.join("store").join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
