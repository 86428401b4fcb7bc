use coxswain_cloud::error::ExecError;
use coxswain_cloud::exec::{self, CommandRequest, RemoteExec};
use coxswain_cloud::fleet::Instance;
use coxswain_cloud::scripts::{self, DrainNode, DrainReport};
use coxswain_common::metrics::{MetricSink, Unit, names};
use coxswain_common::retry::{Retriable, RetryError, RetryPolicy, retry};
use coxswain_common::OpContext;
use tokio_util::sync::CancellationToken;

use crate::error::LifecycleError;

/// Drain errors are retriable by default; only a local interruption is not.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct DrainAttemptError(ExecError);

impl Retriable for DrainAttemptError {
    fn is_retriable(&self) -> bool {
        !matches!(self.0, ExecError::Interrupted)
    }
}

/// Cordon and evict the terminating node, via a healthy peer.
///
/// Exhausting the retries is deliberately non-fatal: a partially drained
/// node still has to leave etcd, so the handler logs, emits
/// `NodeDrainFailure`, and proceeds to member removal.
pub async fn drain_node(
    remote: &dyn RemoteExec,
    sink: &dyn MetricSink,
    ctx: &OpContext,
    peer: &Instance,
    node_name: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(), LifecycleError> {
    let script = match DrainNode::new(node_name).render() {
        Ok(script) => script,
        Err(err) => {
            // An unrenderable node name cannot be drained; same policy as
            // a failed drain.
            tracing::warn!(node_name, error = %err, "skipping drain");
            sink.put_metric(names::NODE_DRAIN_FAILURE, 1.0, Unit::Count);
            return Ok(());
        }
    };
    let request = CommandRequest {
        instance_id: peer.instance_id.clone(),
        script,
        timeout: exec::drain_command_timeout(),
    };

    let outcome = retry(policy, cancel, sink, "node-drain", |_attempt| {
        let request = request.clone();
        async move {
            exec::run(remote, ctx, &request, cancel)
                .await
                .map_err(DrainAttemptError)
        }
    })
    .await;

    match outcome {
        Ok(result) => {
            match scripts::parse_report::<DrainReport>(&result.stdout) {
                Ok(report) if report.node_absent => {
                    tracing::info!(node_name, "node already absent from cluster");
                }
                Ok(_) => tracing::info!(node_name, "node drained"),
                Err(err) => tracing::warn!(node_name, error = %err, "drain reported no trailer"),
            }
            sink.put_metric(names::NODE_DRAIN_SUCCESS, 1.0, Unit::Count);
            Ok(())
        }
        Err(RetryError::Cancelled { .. })
        | Err(RetryError::Fatal { source: DrainAttemptError(ExecError::Interrupted), .. }) => {
            Err(LifecycleError::Interrupted)
        }
        Err(err) => {
            tracing::warn!(
                node_name,
                error = %err,
                "drain failed; proceeding to member removal anyway"
            );
            sink.put_metric(names::NODE_DRAIN_FAILURE, 1.0, Unit::Count);
            Ok(())
        }
    }
}
