use coxswain_cloud::exec::{self, CommandRequest, RemoteExec};
use coxswain_cloud::fleet::Instance;
use coxswain_cloud::scripts::{self, RemoveEtcdMember, RemovalReport};
use coxswain_common::metrics::MetricSink;
use coxswain_common::retry::{RetryError, RetryPolicy, retry};
use coxswain_common::OpContext;
use tokio_util::sync::CancellationToken;

use crate::error::LifecycleError;

/// Remove the terminating member from etcd, via a healthy peer.
///
/// The script verifies endpoint health first and treats a member that is
/// already gone as success. Timeouts are retried; an explicit remote
/// failure is not.
pub async fn remove_member(
    remote: &dyn RemoteExec,
    sink: &dyn MetricSink,
    ctx: &OpContext,
    peer: &Instance,
    member_id: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<RemovalReport, LifecycleError> {
    let script = RemoveEtcdMember { member_id }.render()?;
    let request = CommandRequest {
        instance_id: peer.instance_id.clone(),
        script,
        timeout: exec::etcd_command_timeout(),
    };

    let result = retry(policy, cancel, sink, "etcd-member-remove", |_attempt| {
        let request = request.clone();
        async move { exec::run(remote, ctx, &request, cancel).await }
    })
    .await;

    match result {
        Ok(output) => {
            let report: RemovalReport = scripts::parse_report(&output.stdout)?;
            if report.member_absent {
                tracing::info!(member_id, "etcd member already removed");
            } else {
                tracing::info!(member_id, peer = %peer.instance_id, "etcd member removed");
            }
            Ok(report)
        }
        Err(RetryError::Cancelled { .. })
        | Err(RetryError::Fatal { source: coxswain_cloud::ExecError::Interrupted, .. }) => {
            Err(LifecycleError::Interrupted)
        }
        Err(err) => Err(LifecycleError::RemovalFailed(err)),
    }
}
