use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Running or Succeeded.
    pub fn is_steady(self) -> bool {
        matches!(self, PodPhase::Running | PodPhase::Succeeded)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub namespace: String,
    pub name: String,
    pub phase: PodPhase,
}

impl PodStatus {
    pub fn new(namespace: &str, name: &str, phase: PodPhase) -> Self {
        Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            phase,
        }
    }
}

/// Reports the phase of every pod in every namespace.
pub trait ClusterInspector: Send + Sync {
    fn pods(&self) -> Result<Vec<PodStatus>, RuntimeError>;
}

/// A cluster with no pods is considered steady.
pub fn all_pods_ready(pods: &[PodStatus]) -> bool {
    pods.iter().all(|p| p.phase.is_steady())
}

/// Queries the cluster through `kubectl get pods -A -o json`.
pub struct KubectlInspector {
    kubectl: String,
    kubeconfig: Option<PathBuf>,
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodItem>,
}

#[derive(Deserialize)]
struct PodItem {
    metadata: PodMeta,
    #[serde(default)]
    status: PodItemStatus,
}

#[derive(Deserialize)]
struct PodMeta {
    #[serde(default)]
    namespace: String,
    name: String,
}

#[derive(Deserialize, Default)]
struct PodItemStatus {
    #[serde(default)]
    phase: String,
}

impl KubectlInspector {
    pub fn new(kubectl: &str, kubeconfig: Option<PathBuf>) -> Self {
        Self {
            kubectl: kubectl.to_owned(),
            kubeconfig,
        }
    }
}

impl Default for KubectlInspector {
    fn default() -> Self {
        Self::new("kubectl", None)
    }
}

pub(crate) fn parse_pod_list(json: &[u8]) -> Result<Vec<PodStatus>, RuntimeError> {
    let list: PodList = serde_json::from_slice(json)
        .map_err(|e| RuntimeError::ClusterUnavailable(format!("malformed pod list: {e}")))?;
    Ok(list
        .items
        .into_iter()
        .map(|item| PodStatus {
            namespace: item.metadata.namespace,
            name: item.metadata.name,
            phase: PodPhase::parse(&item.status.phase),
        })
        .collect())
}

impl ClusterInspector for KubectlInspector {
    fn pods(&self) -> Result<Vec<PodStatus>, RuntimeError> {
        let mut cmd = Command::new(&self.kubectl);
        cmd.args(["get", "pods", "--all-namespaces", "-o", "json"]);
        if let Some(cfg) = &self.kubeconfig {
            cmd.env("KUBECONFIG", cfg);
        }
        let output = cmd.output().map_err(|e| {
            RuntimeError::ClusterUnavailable(format!("failed to run {}: {e}", self.kubectl))
        })?;
        if !output.status.success() {
            return Err(RuntimeError::ClusterUnavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        parse_pod_list(&output.stdout)
    }
}
