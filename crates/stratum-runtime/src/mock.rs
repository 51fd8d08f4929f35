//! Deterministic in-process fakes for every runtime collaborator.

use crate::cluster::{ClusterInspector, PodPhase, PodStatus};
use crate::executor::{ExecRequest, LayerExecutor};
use crate::image::ImageSource;
use crate::overlay::OverlaySpec;
use crate::registry::Mounter;
use crate::RuntimeError;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use stratum_schema::{Image, Layer, LayerType};
use stratum_store::{ImageStore, LayerStore};

fn poisoned<E: std::fmt::Display>(e: E) -> RuntimeError {
    RuntimeError::ExecFailed(format!("mutex poisoned: {e}"))
}

#[derive(Debug, Clone)]
pub struct ExecRecord {
    pub command: String,
    pub lower_dirs: Vec<PathBuf>,
}

/// Records every command and writes one file per command into the upper
/// dir, named after the command's digest, so layer content is a pure
/// function of the instruction text.
pub struct MockExecutor {
    records: Mutex<Vec<ExecRecord>>,
    fail_on: Vec<String>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_on: Vec::new(),
        }
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing any of `patterns` fail.
    pub fn failing_on(patterns: &[&str]) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_on: patterns.iter().map(|p| (*p).to_owned()).collect(),
        }
    }

    pub fn executions(&self) -> Vec<ExecRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn execution_count(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn executed(&self, command: &str) -> bool {
        self.executions().iter().any(|r| r.command == command)
    }
}

impl LayerExecutor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute(&self, request: &ExecRequest) -> Result<(), RuntimeError> {
        self.records.lock().map_err(poisoned)?.push(ExecRecord {
            command: request.command.clone(),
            lower_dirs: request.lower_dirs.clone(),
        });

        if self.fail_on.iter().any(|p| request.command.contains(p)) {
            return Err(RuntimeError::CommandFailed {
                command: request.command.clone(),
                status: "exit status: 1".to_owned(),
                stderr: "mock failure".to_owned(),
            });
        }

        let digest = blake3::hash(request.command.as_bytes()).to_hex().to_string();
        let out = request.upper_dir.join(".stratum-mock");
        std::fs::create_dir_all(&out)?;
        std::fs::write(
            out.join(&digest[..16]),
            format!("{} {}\n", request.layer_type, request.command),
        )?;
        Ok(())
    }
}

/// Replays a scripted sequence of pod listings, then repeats the fallback.
pub struct MockCluster {
    script: Mutex<VecDeque<Vec<PodStatus>>>,
    fallback: Vec<PodStatus>,
    polls: AtomicUsize,
}

impl MockCluster {
    fn with(script: Vec<Vec<PodStatus>>, fallback: Vec<PodStatus>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            polls: AtomicUsize::new(0),
        }
    }

    fn running() -> Vec<PodStatus> {
        vec![
            PodStatus::new("kube-system", "coredns", PodPhase::Running),
            PodStatus::new("default", "migrate", PodPhase::Succeeded),
        ]
    }

    fn pending() -> Vec<PodStatus> {
        vec![
            PodStatus::new("kube-system", "coredns", PodPhase::Running),
            PodStatus::new("default", "web", PodPhase::Pending),
        ]
    }

    pub fn ready() -> Self {
        Self::with(Vec::new(), Self::running())
    }

    pub fn never_ready() -> Self {
        Self::with(Vec::new(), Self::pending())
    }

    /// The first `n` polls report a pending pod.
    pub fn ready_after(n: usize) -> Self {
        Self::with(vec![Self::pending(); n], Self::running())
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl ClusterInspector for MockCluster {
    fn pods(&self) -> Result<Vec<PodStatus>, RuntimeError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().map_err(poisoned)?;
        Ok(script.pop_front().unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Counts mounts and unmounts. Mounting drops a fake registry blob into the
/// upper dir, standing in for what the cluster would pull during the build.
pub struct MockMounter {
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
}

impl Default for MockMounter {
    fn default() -> Self {
        Self {
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
        }
    }
}

impl MockMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn unmount_count(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }
}

impl Mounter for MockMounter {
    fn mount(&self, spec: &OverlaySpec) -> Result<(), RuntimeError> {
        let blobs = spec.upper.join("docker/registry/v2/blobs");
        std::fs::create_dir_all(&blobs)?;
        std::fs::create_dir_all(&spec.work)?;
        std::fs::write(blobs.join("mock-blob"), b"mock registry blob")?;
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unmount(&self, _merged: &Path) -> Result<(), RuntimeError> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Materializes any requested base image as a single rootfs layer carrying
/// the configured Clusterfile annotation.
pub struct MockImageSource {
    clusterfile: String,
    fetches: AtomicUsize,
}

pub const MOCK_BASE_CLUSTERFILE: &str = "\
apiVersion: stratum.dev/v1
kind: Cluster
metadata:
  name: my-cluster
spec:
  image: placeholder
  provider: BAREMETAL
";

impl Default for MockImageSource {
    fn default() -> Self {
        Self::with_clusterfile(MOCK_BASE_CLUSTERFILE)
    }
}

impl MockImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clusterfile(clusterfile: &str) -> Self {
        Self {
            clusterfile: clusterfile.to_owned(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ImageSource for MockImageSource {
    fn fetch(
        &self,
        name: &str,
        layers: &LayerStore,
        images: &ImageStore,
    ) -> Result<(), RuntimeError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let rootfs = tempfile::tempdir()?;
        std::fs::create_dir_all(rootfs.path().join("etc"))?;
        std::fs::write(
            rootfs.path().join("etc/os-release"),
            format!("NAME=\"mock base {name}\"\n"),
        )?;
        let layer_id = layers.register(rootfs.path())?;

        let mut layer = Layer::new(LayerType::Copy, "rootfs .");
        layer.id = layer_id;
        let mut image = Image::from_layers(vec![layer]);
        if !self.clusterfile.is_empty() {
            image.set_clusterfile(self.clusterfile.clone());
        }
        image.id = image
            .compute_id()
            .map_err(|e| RuntimeError::ExecFailed(format!("mock image id: {e}")))?;
        images.save(&image, name)?;
        Ok(())
    }
}
