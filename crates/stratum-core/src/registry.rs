use crate::config::ReadinessPolicy;
use crate::session::{BuildSession, LayerOutcome};
use crate::CoreError;
use std::thread;
use stratum_runtime::{all_pods_ready, ClusterInspector};
use stratum_schema::{Layer, LayerType};
use stratum_store::LayerStore;
use tracing::{info, warn};

/// Block until every pod is Running or Succeeded.
///
/// Sleeps `policy.settle` once, then polls up to `policy.attempts` times,
/// `policy.interval` apart. A failed poll counts as a not-ready attempt.
pub fn wait_for_steady_state(
    cluster: &dyn ClusterInspector,
    policy: &ReadinessPolicy,
) -> Result<(), CoreError> {
    thread::sleep(policy.settle);
    for attempt in 1..=policy.attempts {
        match cluster.pods() {
            Ok(pods) if all_pods_ready(&pods) => {
                info!("cluster steady after {attempt} checks");
                return Ok(());
            }
            Ok(pods) => {
                for pod in pods.iter().filter(|p| !p.phase.is_steady()) {
                    info!("{}/{} is {}", pod.namespace, pod.name, pod.phase);
                }
                let waiting = pods.iter().filter(|p| !p.phase.is_steady()).count();
                info!("remaining {waiting} pods not running");
            }
            Err(e) => warn!("pod status check failed: {e}"),
        }
        if attempt < policy.attempts {
            thread::sleep(policy.interval);
        }
    }
    Err(CoreError::ReadinessTimeout {
        attempts: policy.attempts,
    })
}

/// Snapshot the registry overlay's upper dir as a REGISTRY-SNAPSHOT layer.
///
/// No-op without a registry mount. Fails the build if the cluster never
/// settles, leaving `new_layers` untouched.
pub fn capture_registry_cache(
    session: &mut BuildSession,
    layers: &LayerStore,
    cluster: &dyn ClusterInspector,
    policy: &ReadinessPolicy,
) -> Result<(), CoreError> {
    let Some(mount) = session.registry.as_ref() else {
        return Ok(());
    };

    wait_for_steady_state(cluster, policy)?;

    let id = layers.register(mount.upper_dir())?;
    let mut layer = Layer::new(LayerType::RegistrySnapshot, "");
    layer.id = id;
    info!("save registry cache as layer {}", layer.id.short());
    session.new_layers.push(layer);
    session.outcomes.push(LayerOutcome::Captured);
    Ok(())
}
