use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use std::ffi::CString;
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use stratum_schema::LayerId;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const DATA_DIR: &str = "data";
const META_DIR: &str = "meta";

/// Content-addressable layer store.
///
/// A layer's id is the blake3 digest of the deterministic tar packing of its
/// tree (see [`pack_layer`]). Registering the same tree twice yields the same
/// id and is a no-op the second time.
#[derive(Debug)]
pub struct LayerStore {
    layout: StoreLayout,
}

impl LayerStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Compute the id that [`register`](Self::register) would assign to
    /// `source_dir`, without writing anything.
    pub fn compute_id(source_dir: &Path) -> Result<LayerId, StoreError> {
        let tar = pack_layer(source_dir)?;
        Ok(LayerId::new(blake3::hash(&tar).to_hex().to_string()))
    }

    /// Register a directory tree as a layer and return its content digest.
    ///
    /// The tree is re-materialized from its tar packing, so the stored copy is
    /// exactly what the digest covers. `source_dir` is left untouched.
    pub fn register(&self, source_dir: &Path) -> Result<LayerId, StoreError> {
        let tar = pack_layer(source_dir)?;
        let id = LayerId::new(blake3::hash(&tar).to_hex().to_string());
        let dest = self.layout.layer_path(&id);

        if dest.join(DATA_DIR).is_dir() {
            debug!("layer {} already registered", id.short());
            return Ok(id);
        }

        let staging = self.layout.staging_dir();
        fs::create_dir_all(&staging)?;
        let tmp = tempfile::Builder::new()
            .prefix("layer-")
            .tempdir_in(&staging)?;
        unpack_layer(&tar, &tmp.path().join(DATA_DIR))?;
        fs::create_dir_all(tmp.path().join(META_DIR))?;

        let layers_dir = self.layout.layers_dir();
        fs::create_dir_all(&layers_dir)?;
        if let Err(e) = fs::rename(tmp.path(), &dest) {
            // A concurrent registration of identical content won the race.
            if dest.join(DATA_DIR).is_dir() {
                return Ok(id);
            }
            return Err(e.into());
        }
        fsync_dir(&layers_dir)?;

        debug!("registered layer {} ({} bytes packed)", id.short(), tar.len());
        Ok(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        !id.is_empty() && self.layout.layer_path(id).join(DATA_DIR).is_dir()
    }

    /// Directory holding the layer's tree, used as an overlay lower dir.
    pub fn data_dir(&self, id: &str) -> PathBuf {
        self.layout.layer_path(id).join(DATA_DIR)
    }

    pub fn set_metadata(&self, id: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if !self.exists(id) {
            return Err(StoreError::LayerNotFound(id.to_owned()));
        }
        validate_metadata_key(key)?;
        let dir = self.layout.layer_path(id).join(META_DIR);
        fs::create_dir_all(&dir)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(value)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(key))
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }

    pub fn get_metadata(&self, id: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if !self.exists(id) {
            return Err(StoreError::LayerNotFound(id.to_owned()));
        }
        validate_metadata_key(key)?;
        let path = self.layout.layer_path(id).join(META_DIR).join(key);
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// First layer (in id order) whose metadata `key` equals `value`.
    pub fn find_by_metadata(&self, key: &str, value: &[u8]) -> Result<Option<LayerId>, StoreError> {
        for id in self.list()? {
            match self.get_metadata(&id, key) {
                Ok(Some(v)) if v == value => return Ok(Some(id)),
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable metadata of layer {}: {e}", id.short()),
            }
        }
        Ok(None)
    }

    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let path = self.layout.layer_path(id);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<LayerId>, StoreError> {
        let dir = self.layout.layers_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') && entry.path().join(DATA_DIR).is_dir() {
                    ids.push(LayerId::new(name));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn validate_metadata_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
        && !key.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidName(format!("metadata key '{key}'")))
    }
}

/// Digest of a file or directory tree, stable across runs and hosts.
///
/// Directories hash their deterministic tar packing. Regular files hash their
/// mode and bytes; symlinks hash their target.
pub fn content_digest(path: &Path) -> Result<String, StoreError> {
    let meta = path.symlink_metadata()?;
    let mut hasher = blake3::Hasher::new();
    if meta.is_dir() {
        hasher.update(b"dir\0");
        hasher.update(&pack_layer(path)?);
    } else if meta.file_type().is_symlink() {
        hasher.update(b"symlink\0");
        hasher.update(fs::read_link(path)?.as_os_str().as_bytes());
    } else {
        hasher.update(b"file\0");
        hasher.update(&meta.permissions().mode().to_le_bytes());
        hasher.update(&fs::read(path)?);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Prefix marking a deleted entry in a layer, as OCI layers and overlay
/// lower dirs spell it.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Marker file making a directory opaque: lower entries below it are hidden.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Mode of a marker entry: a regular file, rw-r--r--.
const MARKER_MODE: u32 = 0o100_644;

const OPAQUE_XATTRS: [&str; 3] = [
    "trusted.overlay.opaque",
    "user.overlay.opaque",
    "user.fuseoverlayfs.opaque",
];

/// One tar entry: either something on disk or a zero-length marker.
enum Entry {
    Disk(PathBuf),
    Marker,
}

/// Create a deterministic tar archive from a directory.
///
/// Supports regular files, directories, and symlinks. Overlay whiteouts
/// (0/0 character devices) become `.wh.<name>` markers and opaque directories
/// get a `.wh..wh..opq` marker, so a delta keeps its deletions. Other device
/// nodes, sockets, and FIFOs are skipped with warnings.
///
/// Determinism guarantees:
/// - Entries sorted by relative path
/// - All timestamps set to 0 (Unix epoch)
/// - All ownership set to 0:0 (root:root)
/// - Permissions preserved as-is from source
pub fn pack_layer(source_dir: &Path) -> Result<Vec<u8>, StoreError> {
    let mut entries = collect_entries(source_dir, source_dir)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut ar = tar::Builder::new(Vec::new());
    ar.follow_symlinks(false);

    for (rel_path, entry) in &entries {
        let full_path = match entry {
            Entry::Marker => {
                append_marker(&mut ar, rel_path)?;
                continue;
            }
            Entry::Disk(full_path) => full_path,
        };
        let ft = match full_path.symlink_metadata() {
            Ok(m) => m.file_type(),
            Err(e) => {
                warn!("skipping {}: metadata error: {e}", rel_path.display());
                continue;
            }
        };

        if ft.is_file() {
            append_file(&mut ar, rel_path, full_path)?;
        } else if ft.is_dir() {
            append_dir(&mut ar, rel_path, full_path)?;
        } else if ft.is_symlink() {
            append_symlink(&mut ar, rel_path, full_path)?;
        } else {
            warn!("skipping unsupported file type: {}", rel_path.display());
        }
    }

    let data = ar.into_inner()?;
    Ok(data)
}

/// Extract a tar archive to a target directory.
///
/// Whiteout and opaque markers are restored as the empty `.wh.` files they
/// were packed as; fuse-overlayfs honors them in lower dirs.
pub fn unpack_layer(tar_data: &[u8], target_dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(target_dir)?;
    let mut ar = tar::Archive::new(tar_data);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);
    ar.unpack(target_dir)?;
    Ok(())
}

/// Recursively collect (relative_path, entry) pairs from a directory tree.
fn collect_entries(root: &Path, current: &Path) -> Result<Vec<(PathBuf, Entry)>, StoreError> {
    let mut result = Vec::new();
    if !current.exists() {
        return Ok(result);
    }
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let full = entry.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| StoreError::Io(std::io::Error::other(format!("path strip: {e}"))))?
            .to_path_buf();

        let meta = full.symlink_metadata()?;
        if meta.is_dir() {
            if is_opaque_dir(&full) {
                result.push((rel.join(OPAQUE_MARKER), Entry::Marker));
            }
            result.push((rel, Entry::Disk(full.clone())));
            result.extend(collect_entries(root, &full)?);
        } else if is_whiteout(&meta) {
            let mut name = std::ffi::OsString::from(WHITEOUT_PREFIX);
            name.push(entry.file_name());
            result.push((rel.with_file_name(name), Entry::Marker));
        } else {
            result.push((rel, Entry::Disk(full)));
        }
    }
    Ok(result)
}

/// Overlay whiteout: a character device with device number 0/0.
fn is_whiteout(meta: &fs::Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

fn is_opaque_dir(dir: &Path) -> bool {
    if dir.join(OPAQUE_MARKER).exists() {
        return false;
    }
    OPAQUE_XATTRS.iter().any(|name| xattr_is_yes(dir, name))
}

#[allow(unsafe_code)]
fn xattr_is_yes(path: &Path, name: &str) -> bool {
    let (Ok(c_path), Ok(c_name)) = (
        CString::new(path.as_os_str().as_bytes()),
        CString::new(name),
    ) else {
        return false;
    };
    let mut value = [0u8; 8];
    // SAFETY: both strings are NUL-terminated and `value` is writable for its full length.
    let len = unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_mut_ptr().cast(),
            value.len(),
        )
    };
    len == 1 && value[0] == b'y'
}

fn make_header(full_path: &Path, entry_type: tar::EntryType) -> Result<tar::Header, StoreError> {
    let meta = full_path.symlink_metadata()?;
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(meta.permissions().mode());
    Ok(header)
}

fn append_marker(ar: &mut tar::Builder<Vec<u8>>, rel_path: &Path) -> Result<(), StoreError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(MARKER_MODE);
    header.set_size(0);
    header.set_cksum();
    ar.append_data(&mut header, rel_path, &[] as &[u8])?;
    Ok(())
}

fn append_file(
    ar: &mut tar::Builder<Vec<u8>>,
    rel_path: &Path,
    full_path: &Path,
) -> Result<(), StoreError> {
    let data = fs::read(full_path)?;
    let mut header = make_header(full_path, tar::EntryType::Regular)?;
    header.set_size(data.len() as u64);
    header.set_cksum();
    ar.append_data(&mut header, rel_path, data.as_slice())?;
    Ok(())
}

fn append_dir(
    ar: &mut tar::Builder<Vec<u8>>,
    rel_path: &Path,
    full_path: &Path,
) -> Result<(), StoreError> {
    let mut header = make_header(full_path, tar::EntryType::Directory)?;
    header.set_size(0);
    header.set_cksum();
    ar.append_data(&mut header, rel_path, &[] as &[u8])?;
    Ok(())
}

fn append_symlink(
    ar: &mut tar::Builder<Vec<u8>>,
    rel_path: &Path,
    full_path: &Path,
) -> Result<(), StoreError> {
    let target = fs::read_link(full_path)?;
    let mut header = make_header(full_path, tar::EntryType::Symlink)?;
    header.set_size(0);
    header.set_cksum();
    ar.append_link(&mut header, rel_path, &target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_layer_store() -> (tempfile::TempDir, LayerStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, LayerStore::new(layout))
    }

    fn create_fixture_dir(dir: &Path) {
        fs::write(dir.join("hello.txt"), "hello world").unwrap();
        fs::write(dir.join("binary.bin"), [0u8, 1, 2, 255]).unwrap();
        fs::create_dir_all(dir.join("subdir")).unwrap();
        fs::write(dir.join("subdir").join("nested.txt"), "nested content").unwrap();
        fs::create_dir_all(dir.join("empty_dir")).unwrap();
        std::os::unix::fs::symlink("hello.txt", dir.join("link_to_hello")).unwrap();
    }

    #[test]
    fn register_materializes_tree() {
        let (_dir, store) = test_layer_store();
        let src = tempfile::tempdir().unwrap();
        create_fixture_dir(src.path());

        let id = store.register(src.path()).unwrap();
        assert!(store.exists(&id));

        let data = store.data_dir(&id);
        assert_eq!(
            fs::read_to_string(data.join("hello.txt")).unwrap(),
            "hello world"
        );
        assert_eq!(
            fs::read_to_string(data.join("subdir").join("nested.txt")).unwrap(),
            "nested content"
        );
        assert!(data.join("empty_dir").is_dir());
        let link = data.join("link_to_hello");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());

        // source is left in place
        assert!(src.path().join("hello.txt").exists());
    }

    #[test]
    fn register_is_idempotent_and_content_addressed() {
        let (_dir, store) = test_layer_store();
        let src = tempfile::tempdir().unwrap();
        create_fixture_dir(src.path());

        let a = store.register(src.path()).unwrap();
        let b = store.register(src.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list().unwrap(), vec![a.clone()]);
        assert_eq!(LayerStore::compute_id(src.path()).unwrap(), a);
    }

    #[test]
    fn identical_trees_in_different_places_share_an_id() {
        let (_dir, store) = test_layer_store();
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        fs::write(one.path().join("f"), "same").unwrap();
        fs::write(two.path().join("f"), "same").unwrap();
        assert_eq!(
            store.register(one.path()).unwrap(),
            store.register(two.path()).unwrap()
        );
    }

    #[test]
    fn empty_tree_registers() {
        let (_dir, store) = test_layer_store();
        let src = tempfile::tempdir().unwrap();
        let id = store.register(src.path()).unwrap();
        assert!(store.exists(&id));
        assert_eq!(id.len(), 64);
    }

    #[test]
    fn metadata_roundtrip() {
        let (_dir, store) = test_layer_store();
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("f"), "x").unwrap();
        let id = store.register(src.path()).unwrap();

        assert_eq!(store.get_metadata(&id, "cache-id").unwrap(), None);
        store.set_metadata(&id, "cache-id", b"abc").unwrap();
        assert_eq!(
            store.get_metadata(&id, "cache-id").unwrap(),
            Some(b"abc".to_vec())
        );
        assert_eq!(
            store.find_by_metadata("cache-id", b"abc").unwrap(),
            Some(id.clone())
        );
        assert_eq!(store.find_by_metadata("cache-id", b"zzz").unwrap(), None);
    }

    #[test]
    fn metadata_on_missing_layer_fails() {
        let (_dir, store) = test_layer_store();
        assert!(matches!(
            store.set_metadata("missing", "k", b"v").unwrap_err(),
            StoreError::LayerNotFound(_)
        ));
    }

    #[test]
    fn metadata_key_cannot_escape() {
        let (_dir, store) = test_layer_store();
        let src = tempfile::tempdir().unwrap();
        let id = store.register(src.path()).unwrap();
        assert!(store.set_metadata(&id, "../evil", b"v").is_err());
        assert!(store.set_metadata(&id, "", b"v").is_err());
    }

    #[test]
    fn remove_layer() {
        let (_dir, store) = test_layer_store();
        let src = tempfile::tempdir().unwrap();
        let id = store.register(src.path()).unwrap();
        store.remove(&id).unwrap();
        assert!(!store.exists(&id));
        assert!(store.remove(&id).is_ok());
    }

    #[test]
    fn content_digest_of_file_and_dir() {
        let src = tempfile::tempdir().unwrap();
        create_fixture_dir(src.path());
        let d1 = content_digest(src.path()).unwrap();
        let d2 = content_digest(src.path()).unwrap();
        assert_eq!(d1, d2);

        let f1 = content_digest(&src.path().join("hello.txt")).unwrap();
        assert_ne!(f1, d1);
        fs::write(src.path().join("hello.txt"), "changed").unwrap();
        assert_ne!(content_digest(&src.path().join("hello.txt")).unwrap(), f1);
        assert_ne!(content_digest(src.path()).unwrap(), d1);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let src = tempfile::tempdir().unwrap();
        create_fixture_dir(src.path());

        let tar_data = pack_layer(src.path()).unwrap();
        let dst = tempfile::tempdir().unwrap();
        unpack_layer(&tar_data, dst.path()).unwrap();

        assert_eq!(
            fs::read(dst.path().join("binary.bin")).unwrap(),
            &[0u8, 1, 2, 255]
        );
        assert_eq!(
            fs::read_link(dst.path().join("link_to_hello"))
                .unwrap()
                .to_string_lossy(),
            "hello.txt"
        );
    }

    /// Create an overlay whiteout the way fuse-overlayfs does. Unprivileged
    /// whiteout creation needs Linux 5.8 or later; returns false when the
    /// host refuses.
    fn make_whiteout(path: &Path) -> bool {
        std::process::Command::new("mknod")
            .arg(path)
            .args(["c", "0", "0"])
            .status()
            .is_ok_and(|s| s.success())
    }

    #[test]
    fn whiteouts_survive_registration() {
        let (_dir, store) = test_layer_store();
        let upper = tempfile::tempdir().unwrap();
        fs::write(upper.path().join("added.txt"), "new").unwrap();
        fs::create_dir_all(upper.path().join("charts")).unwrap();
        if !make_whiteout(&upper.path().join("deleted.txt"))
            || !make_whiteout(&upper.path().join("charts/old.yaml"))
        {
            eprintln!("skipping: cannot create whiteout devices on this host");
            return;
        }

        let id = store.register(upper.path()).unwrap();
        let data = store.data_dir(&id);
        assert!(data.join("added.txt").is_file());
        assert!(!data.join("deleted.txt").exists());
        let marker = data.join(".wh.deleted.txt");
        assert!(marker.is_file());
        assert_eq!(fs::metadata(&marker).unwrap().len(), 0);
        assert!(data.join("charts/.wh.old.yaml").is_file());

        // Re-packing the stored layer yields the same id.
        assert_eq!(LayerStore::compute_id(&data).unwrap(), id);
    }

    #[test]
    fn whiteout_changes_layer_id() {
        let with = tempfile::tempdir().unwrap();
        fs::write(with.path().join("a"), "x").unwrap();
        if !make_whiteout(&with.path().join("gone")) {
            eprintln!("skipping: cannot create whiteout devices on this host");
            return;
        }
        let without = tempfile::tempdir().unwrap();
        fs::write(without.path().join("a"), "x").unwrap();
        assert_ne!(
            LayerStore::compute_id(with.path()).unwrap(),
            LayerStore::compute_id(without.path()).unwrap()
        );
    }

    #[test]
    fn whiteout_marker_files_pass_through() {
        let (_dir, store) = test_layer_store();
        let upper = tempfile::tempdir().unwrap();
        fs::create_dir_all(upper.path().join("opaque")).unwrap();
        fs::write(upper.path().join("opaque").join(OPAQUE_MARKER), "").unwrap();
        fs::write(upper.path().join(".wh.removed"), "").unwrap();

        let id = store.register(upper.path()).unwrap();
        let data = store.data_dir(&id);
        assert!(data.join("opaque").join(OPAQUE_MARKER).is_file());
        assert!(data.join(".wh.removed").is_file());
    }

    #[test]
    fn non_utf8_names_are_kept() {
        use std::ffi::OsStr;

        let (_dir, store) = test_layer_store();
        let src = tempfile::tempdir().unwrap();
        let name = OsStr::from_bytes(b"caf\xe9.txt");
        if fs::write(src.path().join(name), "bytes").is_err() {
            eprintln!("skipping: filesystem rejects non-UTF-8 names");
            return;
        }
        let id = store.register(src.path()).unwrap();
        assert_eq!(
            fs::read_to_string(store.data_dir(&id).join(name)).unwrap(),
            "bytes"
        );
    }

    #[test]
    fn pack_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        create_fixture_dir(src.path());
        assert_eq!(pack_layer(src.path()).unwrap(), pack_layer(src.path()).unwrap());
    }

    #[test]
    fn pack_different_content_different_hash() {
        let src1 = tempfile::tempdir().unwrap();
        fs::write(src1.path().join("a.txt"), "aaa").unwrap();
        let src2 = tempfile::tempdir().unwrap();
        fs::write(src2.path().join("a.txt"), "bbb").unwrap();

        assert_ne!(
            LayerStore::compute_id(src1.path()).unwrap(),
            LayerStore::compute_id(src2.path()).unwrap()
        );
    }
}
