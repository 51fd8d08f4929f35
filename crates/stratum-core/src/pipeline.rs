use crate::cache::{CacheProbe, StoreProbe};
use crate::concurrency::{lock_mount_target, StoreLock};
use crate::config::{BuildOptions, ReadinessPolicy, StratumConfig};
use crate::context::resolve_context;
use crate::engine::{check_layer_limit, LayerEngine};
use crate::finalize::finalize_metadata;
use crate::registry::capture_registry_cache;
use crate::session::{BuildResult, BuildSession};
use crate::CoreError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratum_runtime::{
    select_executor, ClusterInspector, FuseMounter, ImageSource, KubectlInspector, LayerExecutor,
    LocalOnlySource, Mounter, OverlayExecutor, RegistryMount,
};
use stratum_schema::parse_kubefile;
use stratum_store::{
    validate_image_name, ChainCache, FileChainCache, ImageStore, LayerStore, StoreError,
    StoreLayout,
};
use tracing::{debug, info};

/// The fixed, ordered build stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Stage {
    InitSpec,
    EnsureBaseImage,
    ExecuteLayers,
    CaptureRegistryCache,
    FinalizeMetadata,
    Cleanup,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::InitSpec,
        Stage::EnsureBaseImage,
        Stage::ExecuteLayers,
        Stage::CaptureRegistryCache,
        Stage::FinalizeMetadata,
        Stage::Cleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::InitSpec => "InitSpec",
            Stage::EnsureBaseImage => "EnsureBaseImage",
            Stage::ExecuteLayers => "ExecuteLayers",
            Stage::CaptureRegistryCache => "CaptureRegistryCache",
            Stage::FinalizeMetadata => "FinalizeMetadata",
            Stage::Cleanup => "Cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds cluster images from a local context.
///
/// Owns the stores and every external collaborator. Each one can be swapped
/// with the `with_*` methods; independent builds may share one builder since
/// all per-build state lives in the [`BuildSession`].
pub struct LocalBuilder {
    layout: StoreLayout,
    layers: LayerStore,
    images: ImageStore,
    cache: Arc<dyn ChainCache>,
    probe: Arc<dyn CacheProbe>,
    executor: Arc<dyn LayerExecutor>,
    cluster: Arc<dyn ClusterInspector>,
    mounter: Arc<dyn Mounter>,
    image_source: Arc<dyn ImageSource>,
    readiness: ReadinessPolicy,
    registry_dir: Option<PathBuf>,
}

impl LocalBuilder {
    /// Open (initializing if needed) the store at `store_root` with the
    /// default collaborators: overlay executor, kubectl, fuse mounts, and no
    /// remote base images.
    pub fn new(store_root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let layout = StoreLayout::new(store_root.into());
        layout.initialize()?;
        let cache: Arc<dyn ChainCache> = Arc::new(FileChainCache::open(&layout)?);
        let probe: Arc<dyn CacheProbe> = Arc::new(StoreProbe::new(
            cache.clone(),
            LayerStore::new(layout.clone()),
        ));
        let executor = Arc::new(OverlayExecutor::new("/bin/sh", &layout.staging_dir()));

        Ok(Self {
            layers: LayerStore::new(layout.clone()),
            images: ImageStore::new(layout.clone()),
            layout,
            cache,
            probe,
            executor,
            cluster: Arc::new(KubectlInspector::default()),
            mounter: Arc::new(FuseMounter),
            image_source: Arc::new(LocalOnlySource),
            readiness: ReadinessPolicy::default(),
            registry_dir: None,
        })
    }

    pub fn from_config(config: &StratumConfig, store_root: &Path) -> Result<Self, CoreError> {
        let builder = Self::new(store_root)?;
        let executor = select_executor(
            &config.executor.backend,
            &config.executor.shell,
            &builder.layout.staging_dir(),
        )?;
        Ok(builder
            .with_executor(Arc::from(executor))
            .with_cluster(Arc::new(KubectlInspector::new(
                &config.executor.kubectl,
                None,
            )))
            .with_readiness(config.readiness_policy())
            .with_registry_dir(config.registry.bind_dir.clone()))
    }

    /// Replace the chain cache. The default probe is rebuilt over it.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn ChainCache>) -> Self {
        self.probe = Arc::new(StoreProbe::new(
            cache.clone(),
            LayerStore::new(self.layout.clone()),
        ));
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn CacheProbe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn LayerExecutor>) -> Self {
        self.executor = executor;
        self
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterInspector>) -> Self {
        self.cluster = cluster;
        self
    }

    #[must_use]
    pub fn with_mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    #[must_use]
    pub fn with_image_source(mut self, source: Arc<dyn ImageSource>) -> Self {
        self.image_source = source;
        self
    }

    #[must_use]
    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Registry storage directory to overlay during builds; `None` disables
    /// registry cache capture.
    #[must_use]
    pub fn with_registry_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.registry_dir = dir;
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn layers(&self) -> &LayerStore {
        &self.layers
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    /// Build `context` into an image named `name`.
    ///
    /// The context is resolved and validated before any stage runs; stages
    /// then run in order and the first failure aborts the build. A registry
    /// mount taken during the build is released on every exit path.
    pub fn build(
        &self,
        name: &str,
        context: &Path,
        kubefile: Option<&str>,
        options: BuildOptions,
    ) -> Result<BuildResult, CoreError> {
        info!("building {name} from {}", context.display());
        validate_image_name(name)?;
        let ctx = resolve_context(context, kubefile)?;
        let session = BuildSession::new(name, ctx, options);
        let session = self.run_stages(session, Stage::InitSpec)?;
        Ok(session.into_result())
    }

    /// Run every stage from `from` onward, in order.
    pub fn run_stages(&self, session: BuildSession, from: Stage) -> Result<BuildSession, CoreError> {
        let mut session = session;
        for stage in Stage::ALL.into_iter().filter(|s| *s >= from) {
            session = self.run_stage(stage, session)?;
        }
        Ok(session)
    }

    pub fn run_stage(&self, stage: Stage, session: BuildSession) -> Result<BuildSession, CoreError> {
        debug!("stage {stage}");
        let result = match stage {
            Stage::InitSpec => self.init_spec(session),
            Stage::EnsureBaseImage => self.ensure_base_image(session),
            Stage::ExecuteLayers => self.execute_layers(session),
            Stage::CaptureRegistryCache => self.capture_registry(session),
            Stage::FinalizeMetadata => self.finalize(session),
            Stage::Cleanup => self.cleanup(session),
        };
        result.map_err(|e| e.in_stage(stage))
    }

    fn init_spec(&self, mut session: BuildSession) -> Result<BuildSession, CoreError> {
        let image = parse_kubefile(&session.context.kubefile)?;
        session.new_layers = image.layers.iter().skip(1).cloned().collect();
        session.base_layers.clear();
        session.outcomes.clear();
        session.image = image;
        info!("init image spec success");
        Ok(session)
    }

    fn ensure_base_image(&self, mut session: BuildSession) -> Result<BuildSession, CoreError> {
        if session.image.is_scratch() {
            debug!("scratch base, nothing to ensure");
            return Ok(session);
        }
        let base = session
            .image
            .base_name()
            .ok_or_else(|| CoreError::Validation("image has no FROM layer".to_owned()))?
            .to_owned();

        if !self.images.exists(&base) {
            info!("pulling base image {base}");
            self.image_source
                .fetch(&base, &self.layers, &self.images)?;
        }
        let parent = self.images.get_by_name(&base)?;
        if let Some(missing) = parent
            .layers
            .iter()
            .find(|l| l.is_realized() && !self.layers.exists(&l.id))
        {
            return Err(StoreError::LayerNotFound(missing.id.to_string()).into());
        }
        session.base_layers = parent.layers;
        info!("base image {base} ready ({} layers)", session.base_layers.len());
        Ok(session)
    }

    fn execute_layers(&self, mut session: BuildSession) -> Result<BuildSession, CoreError> {
        check_layer_limit(session.base_layers.len(), session.new_layers.len())?;

        if session.registry.is_none() {
            if let Some(target) = &self.registry_dir {
                let mounts = self.layout.mounts_dir();
                let lock = lock_mount_target(target)?;
                let mount = RegistryMount::acquire(self.mounter.clone(), target, &mounts)?;
                session.registry_lock = Some(lock);
                session.registry = Some(mount);
            }
        }

        let staging = self.layout.staging_dir();
        LayerEngine::new(
            &self.layers,
            self.cache.as_ref(),
            self.probe.as_ref(),
            self.executor.as_ref(),
            &staging,
        )
        .execute(&mut session)?;
        Ok(session)
    }

    fn capture_registry(&self, mut session: BuildSession) -> Result<BuildSession, CoreError> {
        capture_registry_cache(
            &mut session,
            &self.layers,
            self.cluster.as_ref(),
            &self.readiness,
        )?;
        Ok(session)
    }

    fn finalize(&self, mut session: BuildSession) -> Result<BuildSession, CoreError> {
        // The image index is rewritten whole; concurrent saves would drop names.
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        finalize_metadata(&mut session, &self.images)?;
        Ok(session)
    }

    fn cleanup(&self, mut session: BuildSession) -> Result<BuildSession, CoreError> {
        session.release_registry()?;
        info!("build {} finished as {}", session.name, session.image.id.short());
        Ok(session)
    }
}
