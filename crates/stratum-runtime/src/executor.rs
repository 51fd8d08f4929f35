use crate::overlay::{mount_overlay, unmount_overlay, OverlaySpec};
use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::process::Command;
use stratum_schema::LayerType;
use tracing::{debug, warn};

/// One RUN or CMD instruction to execute.
///
/// `lower_dirs` is the accumulated filesystem view (base layers, then every
/// realized new layer) ordered bottom-most first. Anything the command writes
/// into the merged view lands in `upper_dir`, which becomes the layer.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub layer_type: LayerType,
    pub command: String,
    pub lower_dirs: Vec<PathBuf>,
    pub upper_dir: PathBuf,
    pub context_dir: PathBuf,
}

pub trait LayerExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, request: &ExecRequest) -> Result<(), RuntimeError>;
}

pub fn select_executor(
    name: &str,
    shell: &str,
    scratch_root: &Path,
) -> Result<Box<dyn LayerExecutor>, RuntimeError> {
    match name {
        "overlay" => Ok(Box::new(OverlayExecutor::new(shell, scratch_root))),
        "mock" => Ok(Box::new(crate::mock::MockExecutor::new())),
        other => Err(RuntimeError::ExecutorUnavailable(other.to_owned())),
    }
}

/// Runs commands through a shell inside a fuse-overlayfs view of the layers.
///
/// The working directory is the merged root; `STRATUM_ROOTFS` and
/// `STRATUM_CONTEXT` are exported so scripts can address both.
pub struct OverlayExecutor {
    shell: String,
    scratch_root: PathBuf,
}

impl OverlayExecutor {
    pub fn new(shell: &str, scratch_root: &Path) -> Self {
        Self {
            shell: shell.to_owned(),
            scratch_root: scratch_root.to_path_buf(),
        }
    }
}

struct MountGuard {
    merged: PathBuf,
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if let Err(e) = unmount_overlay(&self.merged) {
            warn!("failed to unmount {}: {e}", self.merged.display());
        }
    }
}

impl LayerExecutor for OverlayExecutor {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn execute(&self, request: &ExecRequest) -> Result<(), RuntimeError> {
        std::fs::create_dir_all(&self.scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix("exec-")
            .tempdir_in(&self.scratch_root)?;

        let mut lower = request.lower_dirs.clone();
        if lower.is_empty() {
            let empty = scratch.path().join("empty");
            std::fs::create_dir_all(&empty)?;
            lower.push(empty);
        }

        let spec = OverlaySpec {
            lower,
            upper: request.upper_dir.clone(),
            work: scratch.path().join("work"),
            merged: scratch.path().join("merged"),
        };
        mount_overlay(&spec)?;
        let _guard = MountGuard {
            merged: spec.merged.clone(),
        };

        debug!(
            "{} {} over {} lower dirs",
            request.layer_type,
            request.command,
            spec.lower.len()
        );
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&request.command)
            .current_dir(&spec.merged)
            .env("STRATUM_ROOTFS", &spec.merged)
            .env("STRATUM_CONTEXT", &request.context_dir)
            .output()
            .map_err(|e| RuntimeError::ExecFailed(format!("failed to spawn {}: {e}", self.shell)))?;

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: request.command.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_executors() {
        assert!(select_executor("overlay", "/bin/sh", Path::new("/tmp/s")).is_ok());
        assert!(select_executor("mock", "/bin/sh", Path::new("/tmp/s")).is_ok());
    }

    #[test]
    fn select_unknown_executor_fails() {
        assert!(matches!(
            select_executor("docker", "/bin/sh", Path::new("/tmp/s")),
            Err(RuntimeError::ExecutorUnavailable(_))
        ));
    }

    #[test]
    fn overlay_executor_name() {
        assert_eq!(OverlayExecutor::new("/bin/sh", Path::new("/tmp")).name(), "overlay");
    }
}
