use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// A fuse-overlayfs mount: `lower` is ordered bottom-most first, the way
/// layers are applied.
#[derive(Debug, Clone)]
pub struct OverlaySpec {
    pub lower: Vec<PathBuf>,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
}

impl OverlaySpec {
    /// fuse-overlayfs takes the top-most lower dir first.
    fn lowerdir_option(&self) -> String {
        self.lower
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }

    fn mount_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lowerdir_option(),
            self.upper.display(),
            self.work.display()
        )
    }
}

pub fn mount_overlay(spec: &OverlaySpec) -> Result<(), RuntimeError> {
    if spec.lower.is_empty() {
        return Err(RuntimeError::MountFailed(
            "overlay needs at least one lower directory".to_owned(),
        ));
    }
    let _ = unmount_overlay(&spec.merged);

    if spec.work.exists() {
        let _ = std::fs::remove_dir_all(&spec.work);
    }
    for dir in [&spec.upper, &spec.work, &spec.merged] {
        std::fs::create_dir_all(dir)?;
    }

    let options = spec.mount_options();
    debug!("fuse-overlayfs -o {options} {}", spec.merged.display());
    let status = Command::new("fuse-overlayfs")
        .args(["-o", &options, &spec.merged.to_string_lossy()])
        .status()
        .map_err(|e| {
            RuntimeError::MountFailed(format!(
                "fuse-overlayfs not found or failed to start: {e}"
            ))
        })?;

    if !status.success() {
        return Err(RuntimeError::MountFailed(format!(
            "fuse-overlayfs mount of {} failed",
            spec.merged.display()
        )));
    }
    Ok(())
}

/// Check if a path is currently a mount point by inspecting /proc/mounts.
pub fn is_mounted(path: &Path) -> bool {
    let canonical = match std::fs::canonicalize(path) {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    };
    match std::fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounts
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(&canonical)),
        Err(_) => false,
    }
}

pub fn unmount_overlay(merged: &Path) -> Result<(), RuntimeError> {
    if !merged.exists() || !is_mounted(merged) {
        return Ok(());
    }
    let _ = Command::new("fusermount3")
        .args(["-u", &merged.to_string_lossy()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if is_mounted(merged) {
        let _ = Command::new("fusermount")
            .args(["-u", &merged.to_string_lossy()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    if is_mounted(merged) {
        return Err(RuntimeError::MountFailed(format!(
            "{} is still mounted",
            merged.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowerdir_is_top_most_first() {
        let spec = OverlaySpec {
            lower: vec![PathBuf::from("/l/base"), PathBuf::from("/l/copy")],
            upper: PathBuf::from("/o/upper"),
            work: PathBuf::from("/o/work"),
            merged: PathBuf::from("/o/merged"),
        };
        assert_eq!(
            spec.mount_options(),
            "lowerdir=/l/copy:/l/base,upperdir=/o/upper,workdir=/o/work"
        );
    }

    #[test]
    fn mount_without_lower_dirs_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spec = OverlaySpec {
            lower: Vec::new(),
            upper: dir.path().join("upper"),
            work: dir.path().join("work"),
            merged: dir.path().join("merged"),
        };
        assert!(matches!(
            mount_overlay(&spec).unwrap_err(),
            RuntimeError::MountFailed(_)
        ));
    }

    #[test]
    fn is_mounted_returns_false_for_regular_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mounted(dir.path()));
    }

    #[test]
    fn unmount_noop_on_non_mounted() {
        let dir = tempfile::tempdir().unwrap();
        assert!(unmount_overlay(dir.path()).is_ok());
        assert!(unmount_overlay(&dir.path().join("missing")).is_ok());
    }
}
