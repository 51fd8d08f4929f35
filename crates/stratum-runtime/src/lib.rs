//! External collaborators of the Stratum build pipeline.
//!
//! This crate implements everything the build engine reaches outside the
//! process for, each behind a trait: `LayerExecutor` runs RUN/CMD
//! instructions over an overlay of realized layers, `Mounter` and the scoped
//! `RegistryMount` guard manage the registry cache overlay,
//! `ClusterInspector` reports pod phases, and `ImageSource` fetches missing
//! base images. The `mock` module provides deterministic in-process fakes.

pub mod cluster;
pub mod executor;
pub mod image;
pub mod mock;
pub mod overlay;
pub mod prereq;
pub mod registry;

pub use cluster::{all_pods_ready, ClusterInspector, KubectlInspector, PodPhase, PodStatus};
pub use executor::{select_executor, ExecRequest, LayerExecutor, OverlayExecutor};
pub use image::{ImageSource, LocalOnlySource};
pub use overlay::{is_mounted, mount_overlay, unmount_overlay, OverlaySpec};
pub use prereq::{check_cluster_prereqs, check_overlay_prereqs, format_missing, MissingPrereq};
pub use registry::{FuseMounter, Mounter, RegistryMount};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("executor '{0}' is not available on this system")]
    ExecutorUnavailable(String),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("command '{command}' exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("mount failed: {0}")]
    MountFailed(String),
    #[error("cluster query failed: {0}")]
    ClusterUnavailable(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("store error: {0}")]
    Store(#[from] stratum_store::StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display_names_command() {
        let e = RuntimeError::CommandFailed {
            command: "kubectl apply -f x".to_owned(),
            status: "exit status: 1".to_owned(),
            stderr: "boom".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("kubectl apply -f x"));
        assert!(msg.contains("boom"));
    }
}
