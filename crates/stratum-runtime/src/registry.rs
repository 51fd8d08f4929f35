use crate::overlay::{mount_overlay, unmount_overlay, OverlaySpec};
use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

pub trait Mounter: Send + Sync {
    fn mount(&self, spec: &OverlaySpec) -> Result<(), RuntimeError>;

    fn unmount(&self, merged: &Path) -> Result<(), RuntimeError>;
}

pub struct FuseMounter;

impl Mounter for FuseMounter {
    fn mount(&self, spec: &OverlaySpec) -> Result<(), RuntimeError> {
        mount_overlay(spec)
    }

    fn unmount(&self, merged: &Path) -> Result<(), RuntimeError> {
        unmount_overlay(merged)
    }
}

/// Overlay over the registry storage directory for the duration of a build.
///
/// The registry keeps writing to its usual path; everything it writes lands
/// in [`upper_dir`](Self::upper_dir), which is what gets snapshotted. The
/// mount is released exactly once: by [`release`](Self::release) or, on any
/// early exit, when the guard is dropped.
pub struct RegistryMount {
    mounter: Arc<dyn Mounter>,
    target: PathBuf,
    upper: PathBuf,
    released: bool,
    _scratch: TempDir,
}

impl RegistryMount {
    pub fn acquire(
        mounter: Arc<dyn Mounter>,
        target: &Path,
        scratch_root: &Path,
    ) -> Result<Self, RuntimeError> {
        if !target.is_dir() {
            return Err(RuntimeError::MountFailed(format!(
                "registry directory {} does not exist",
                target.display()
            )));
        }
        std::fs::create_dir_all(scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix("registry-")
            .tempdir_in(scratch_root)?;

        let spec = OverlaySpec {
            lower: vec![target.to_path_buf()],
            upper: scratch.path().join("upper"),
            work: scratch.path().join("work"),
            merged: target.to_path_buf(),
        };
        mounter.mount(&spec)?;
        info!("registry cache mounted over {}", target.display());

        Ok(Self {
            mounter,
            target: target.to_path_buf(),
            upper: spec.upper,
            released: false,
            _scratch: scratch,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn upper_dir(&self) -> &Path {
        &self.upper
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn release(&mut self) -> Result<(), RuntimeError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        debug!("releasing registry mount {}", self.target.display());
        self.mounter.unmount(&self.target)
    }
}

impl Drop for RegistryMount {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(
                "failed to release registry mount {}: {e}",
                self.target.display()
            );
        }
    }
}
