use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use stratum_schema::{Image, ImageId};
use tempfile::NamedTempFile;
use tracing::debug;

/// Image names look like `registry.local/team/app:v1`: lowercase
/// alphanumerics plus `. _ - / : @`, at most 255 bytes.
pub fn validate_image_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.len() > 255 {
        return Err(StoreError::InvalidName(
            "image name must be 1-255 characters".to_owned(),
        ));
    }
    if !name.bytes().all(|b| {
        b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-' | b'/' | b':' | b'@')
    }) {
        return Err(StoreError::InvalidName(format!(
            "'{name}' must match [a-z0-9._/:@-]"
        )));
    }
    let first = name.as_bytes()[0];
    if !first.is_ascii_alphanumeric() {
        return Err(StoreError::InvalidName(format!(
            "'{name}' must start with a letter or digit"
        )));
    }
    Ok(())
}

/// Persists image documents by id and maps names to ids.
///
/// Documents are stored as `images/<id>.json`; on read the id is recomputed
/// from the document and must match. The name index is rewritten atomically.
#[derive(Debug)]
pub struct ImageStore {
    layout: StoreLayout,
}

impl ImageStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Save a finalized image under `name`. The document's id must equal its
    /// recomputed content digest.
    pub fn save(&self, image: &Image, name: &str) -> Result<ImageId, StoreError> {
        validate_image_name(name)?;
        let actual = image.compute_id()?;
        if image.id != actual {
            return Err(StoreError::IntegrityFailure {
                hash: name.to_owned(),
                expected: image.id.to_string(),
                actual: actual.to_string(),
            });
        }

        let dir = self.layout.images_dir();
        fs::create_dir_all(&dir)?;
        let dest = dir.join(format!("{actual}.json"));
        if !dest.exists() {
            let content = serde_json::to_string_pretty(image)?;
            write_atomic(&dir, &dest, content.as_bytes())?;
        }

        let mut index = self.read_index()?;
        index.insert(name.to_owned(), actual.clone());
        self.write_index(&index)?;

        debug!("saved image {name} as {}", actual.short());
        Ok(actual)
    }

    pub fn get(&self, id: &str) -> Result<Image, StoreError> {
        let path = self.layout.images_dir().join(format!("{id}.json"));
        if !path.exists() {
            return Err(StoreError::ImageNotFound(id.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let image: Image = serde_json::from_str(&content)?;

        let actual = image.compute_id()?;
        if actual != id || image.id != id {
            return Err(StoreError::IntegrityFailure {
                hash: id.to_owned(),
                expected: id.to_owned(),
                actual: actual.to_string(),
            });
        }
        Ok(image)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Image, StoreError> {
        let index = self.read_index()?;
        let id = index
            .get(name)
            .ok_or_else(|| StoreError::ImageNotFound(name.to_owned()))?;
        self.get(id)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.read_index()
            .map(|index| index.contains_key(name))
            .unwrap_or(false)
    }

    /// All named images, sorted by name.
    pub fn list(&self) -> Result<Vec<(String, ImageId)>, StoreError> {
        Ok(self.read_index()?.into_iter().collect())
    }

    /// Drop a name. The document stays behind, it may be shared by other names.
    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let mut index = self.read_index()?;
        if index.remove(name).is_none() {
            return Err(StoreError::ImageNotFound(name.to_owned()));
        }
        self.write_index(&index)
    }

    fn read_index(&self) -> Result<BTreeMap<String, ImageId>, StoreError> {
        let path = self.layout.image_index();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_index(&self, index: &BTreeMap<String, ImageId>) -> Result<(), StoreError> {
        let dir = self.layout.images_dir();
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(index)?;
        write_atomic(&dir, &self.layout.image_index(), content.as_bytes())
    }
}

fn write_atomic(dir: &Path, dest: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}
