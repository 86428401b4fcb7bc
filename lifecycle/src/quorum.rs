use coxswain_cloud::fleet::{Fleet, Instance};
use coxswain_common::metrics::{MetricSink, Unit, names};

use crate::error::LifecycleError;

/// Minimum healthy control-plane instances that must remain after the
/// terminating one leaves. For any etcd cluster of three or more this
/// preserves a two-node majority.
pub const MIN_HEALTHY_PEERS: usize = 2;

/// Healthy control-plane instances excluding the terminating one.
pub async fn healthy_peers(
    fleet: &dyn Fleet,
    terminating_instance: &str,
) -> Result<Vec<Instance>, LifecycleError> {
    let peers = fleet
        .healthy_control_plane()
        .await?
        .into_iter()
        .filter(|instance| instance.instance_id != terminating_instance)
        .collect();
    Ok(peers)
}

/// Gate member removal on remaining quorum; emits `QuorumRiskDetected` on
/// refusal.
pub fn ensure_quorum_safe(
    terminating_instance: &str,
    peers: &[Instance],
    sink: &dyn MetricSink,
) -> Result<(), LifecycleError> {
    if peers.len() < MIN_HEALTHY_PEERS {
        sink.put_metric(names::QUORUM_RISK_DETECTED, 1.0, Unit::Count);
        tracing::error!(
            instance_id = terminating_instance,
            healthy_peers = peers.len(),
            "refusing removal: not enough healthy peers remain"
        );
        return Err(LifecycleError::QuorumRisk {
            instance_id: terminating_instance.to_string(),
            healthy_peers: peers.len(),
        });
    }
    Ok(())
}
