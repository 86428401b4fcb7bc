use coxswain_cloud::error::{ExecError, StoreError};
use coxswain_cloud::scripts::ScriptError;
use coxswain_common::retry::RetryError;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Removing this member would drop the cluster below a safe quorum.
    #[error("terminating {instance_id} would leave {healthy_peers} healthy peers")]
    QuorumRisk {
        instance_id: String,
        healthy_peers: usize,
    },

    #[error("etcd member removal failed: {0}")]
    RemovalFailed(#[source] RetryError<ExecError>),

    #[error("handler exceeded its wall-clock budget")]
    BudgetExceeded,

    #[error("handler interrupted by shutdown")]
    Interrupted,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Script(#[from] ScriptError),
}
