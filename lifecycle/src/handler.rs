use std::time::{Duration, Instant};

use chrono::Utc;
use coxswain_cloud::exec::RemoteExec;
use coxswain_cloud::fleet::{Fleet, LifecycleCompletion, LifecycleResult};
use coxswain_cloud::locks::{LockStore, MemberStatus};
use coxswain_common::OpContext;
use coxswain_common::metrics::{MetricSink, Unit, names};
use coxswain_common::retry::RetryPolicy;
use tokio_util::sync::CancellationToken;

use crate::drain;
use crate::error::LifecycleError;
use crate::event::LifecycleEvent;
use crate::quorum;
use crate::removal;

pub struct LifecycleDeps<'a> {
    pub locks: &'a dyn LockStore,
    pub exec: &'a dyn RemoteExec,
    pub fleet: &'a dyn Fleet,
    pub sink: &'a dyn MetricSink,
}

#[derive(Clone, Copy, Debug)]
pub struct HandlerConfig {
    /// Whole-handler wall-clock budget; well under the hook's own timeout.
    pub budget: Duration,
    pub drain_retry: RetryPolicy,
    pub removal_retry: RetryPolicy,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(600),
            drain_retry: RetryPolicy::default(),
            removal_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HandlerOutcome {
    pub result: LifecycleResult,
    pub error: Option<LifecycleError>,
}

enum StageOutcome {
    /// No member record (or already removed); nothing to clean.
    NothingToClean,
    Removed,
}

/// Handle one termination event end to end and complete the lifecycle
/// action. Always completes — the worst failure mode is a stalled scaling
/// group, so nothing past the completion call may raise.
pub async fn run(
    deps: &LifecycleDeps<'_>,
    config: HandlerConfig,
    ctx: &OpContext,
    event: &LifecycleEvent,
    cancel: &CancellationToken,
) -> HandlerOutcome {
    let started = Instant::now();
    let staged = tokio::time::timeout(config.budget, stages(deps, config, ctx, event, cancel)).await;

    let (result, error) = match staged {
        Ok(Ok(_)) => (LifecycleResult::Continue, None),
        Ok(Err(err)) => (LifecycleResult::Abandon, Some(err)),
        Err(_) => (LifecycleResult::Abandon, Some(LifecycleError::BudgetExceeded)),
    };

    complete_action(deps, event, result).await;

    deps.sink.put_metric(
        names::LIFECYCLE_HANDLER_DURATION,
        started.elapsed().as_millis() as f64,
        Unit::Milliseconds,
    );
    deps.sink.flush();

    HandlerOutcome { result, error }
}

async fn stages(
    deps: &LifecycleDeps<'_>,
    config: HandlerConfig,
    ctx: &OpContext,
    event: &LifecycleEvent,
    cancel: &CancellationToken,
) -> Result<StageOutcome, LifecycleError> {
    let Some(member) = deps.locks.member_by_instance(&event.instance_id).await? else {
        tracing::info!(
            instance_id = %event.instance_id,
            "no member record for terminating instance; nothing to clean"
        );
        return Ok(StageOutcome::NothingToClean);
    };

    if member.status == MemberStatus::Removed {
        tracing::info!(
            instance_id = %event.instance_id,
            member_id = %member.member_id,
            "member already removed; re-delivered event is a no-op"
        );
        return Ok(StageOutcome::NothingToClean);
    }

    let peers = quorum::healthy_peers(deps.fleet, &event.instance_id).await?;
    quorum::ensure_quorum_safe(&event.instance_id, &peers, deps.sink)?;
    // ensure_quorum_safe guarantees at least two peers remain.
    let peer = &peers[0];

    drain::drain_node(
        deps.exec,
        deps.sink,
        ctx,
        peer,
        &member.hostname,
        config.drain_retry,
        cancel,
    )
    .await?;

    let removed = removal::remove_member(
        deps.exec,
        deps.sink,
        ctx,
        peer,
        &member.member_id,
        config.removal_retry,
        cancel,
    )
    .await;

    match removed {
        Ok(_) => {
            deps.sink
                .put_metric(names::ETCD_MEMBER_REMOVAL_SUCCESS, 1.0, Unit::Count);
            deps.locks
                .update_member_status(
                    &member.member_id,
                    MemberStatus::Removed,
                    &ctx.request_id.to_string(),
                    Utc::now(),
                )
                .await?;
            Ok(StageOutcome::Removed)
        }
        Err(err) => {
            deps.sink
                .put_metric(names::ETCD_MEMBER_REMOVAL_FAILURE, 1.0, Unit::Count);
            if let Err(update_err) = deps
                .locks
                .update_member_status(
                    &member.member_id,
                    MemberStatus::RemovalFailed,
                    &ctx.request_id.to_string(),
                    Utc::now(),
                )
                .await
            {
                tracing::warn!(
                    member_id = %member.member_id,
                    error = %update_err,
                    "failed to record REMOVAL_FAILED status"
                );
            }
            Err(err)
        }
    }
}

/// Complete the lifecycle action. A hung hook stalls the whole scaling
/// group, so on failure retry once without the action token (instance-only
/// completion) and then give up quietly; the hook's own timeout is the
/// final backstop.
async fn complete_action(
    deps: &LifecycleDeps<'_>,
    event: &LifecycleEvent,
    result: LifecycleResult,
) {
    let completion = LifecycleCompletion {
        group_name: event.group_name.clone(),
        hook_name: event.hook_name.clone(),
        instance_id: event.instance_id.clone(),
        action_token: event.action_token.clone(),
        result,
    };

    match deps.fleet.complete_lifecycle_action(&completion).await {
        Ok(()) => {
            tracing::info!(
                instance_id = %event.instance_id,
                result = result.as_str(),
                "lifecycle action completed"
            );
            return;
        }
        Err(err) => {
            tracing::warn!(
                instance_id = %event.instance_id,
                error = %err,
                "lifecycle completion failed; retrying without action token"
            );
        }
    }

    let tokenless = LifecycleCompletion {
        action_token: None,
        ..completion
    };
    if let Err(err) = deps.fleet.complete_lifecycle_action(&tokenless).await {
        tracing::error!(
            instance_id = %event.instance_id,
            error = %err,
            "lifecycle completion failed twice; leaving the hook to time out"
        );
    }
}
