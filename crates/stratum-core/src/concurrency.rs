use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on a file, released on drop.
pub struct StoreLock {
    lock_file: File,
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl StoreLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

/// Directory under the system temp dir holding one lock per registry mount
/// target. Shared by every store on the host.
pub const MOUNT_LOCK_DIR: &str = "stratum-mounts";

/// Lock file guarding one registry mount target, keyed by its canonical path
/// so aliases of the same directory share a lock.
pub fn mount_lock_path(target: &Path) -> Result<PathBuf, CoreError> {
    let canonical = std::fs::canonicalize(target).map_err(|e| {
        CoreError::Validation(format!(
            "registry directory {} is unusable: {e}",
            target.display()
        ))
    })?;
    let digest = blake3::hash(canonical.as_os_str().as_bytes())
        .to_hex()
        .to_string();
    Ok(std::env::temp_dir()
        .join(MOUNT_LOCK_DIR)
        .join(format!("{}.lock", &digest[..16])))
}

/// Take the per-target lock without waiting: two builds may not overlay the
/// same registry directory at once, whichever store they build into.
pub fn lock_mount_target(target: &Path) -> Result<StoreLock, CoreError> {
    StoreLock::try_acquire(&mount_lock_path(target)?)?.ok_or_else(|| {
        CoreError::Validation(format!(
            "registry directory {} is mounted by another build",
            target.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        {
            let _lock = StoreLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        let _lock = StoreLock::acquire(&lock_path).unwrap();
        let result = StoreLock::try_acquire(&lock_path).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        {
            let _lock = StoreLock::acquire(&lock_path).unwrap();
        }

        let lock2 = StoreLock::try_acquire(&lock_path).unwrap();
        assert!(lock2.is_some());
    }

    #[test]
    fn mount_target_cannot_be_shared() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("registry");
        let other = dir.path().join("other");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::create_dir_all(&other).unwrap();

        let held = lock_mount_target(&target).unwrap();
        assert!(matches!(
            lock_mount_target(&target),
            Err(CoreError::Validation(_))
        ));
        assert!(lock_mount_target(&other).is_ok());

        drop(held);
        assert!(lock_mount_target(&target).is_ok());
    }

    #[test]
    fn mount_target_aliases_share_a_lock() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("registry");
        std::fs::create_dir_all(&target).unwrap();
        let link = dir.path().join("alias");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let _held = lock_mount_target(&target).unwrap();
        let mut slashed = target.clone().into_os_string();
        slashed.push("/");
        assert!(lock_mount_target(Path::new(&slashed)).is_err());
        assert!(lock_mount_target(&target.join(".")).is_err());
        assert!(lock_mount_target(&link).is_err());
        assert_eq!(
            mount_lock_path(&link).unwrap(),
            mount_lock_path(&target).unwrap()
        );
    }

    #[test]
    fn missing_mount_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            lock_mount_target(&dir.path().join("missing")),
            Err(CoreError::Validation(_))
        ));
    }
}
