use crate::RuntimeError;
use stratum_store::{ImageStore, LayerStore};

/// Provides base images that are not yet in the local store.
///
/// A successful `fetch` leaves the image saved under `name` in `images` and
/// every one of its layers registered in `layers`.
pub trait ImageSource: Send + Sync {
    fn fetch(&self, name: &str, layers: &LayerStore, images: &ImageStore)
        -> Result<(), RuntimeError>;
}

/// Refuses every fetch. Base images must already be in the local store.
pub struct LocalOnlySource;

impl ImageSource for LocalOnlySource {
    fn fetch(
        &self,
        name: &str,
        _layers: &LayerStore,
        _images: &ImageStore,
    ) -> Result<(), RuntimeError> {
        Err(RuntimeError::ImageNotFound(format!(
            "{name} is not in the local store and no remote source is configured"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_store::StoreLayout;

    #[test]
    fn local_only_source_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let err = LocalOnlySource
            .fetch(
                "kubernetes:v1.19.8",
                &LayerStore::new(layout.clone()),
                &ImageStore::new(layout),
            )
            .unwrap_err();
        assert!(err.to_string().contains("kubernetes:v1.19.8"));
    }
}
