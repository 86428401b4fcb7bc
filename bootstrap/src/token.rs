use std::time::Duration;

use chrono::Utc;
use coxswain_cloud::exec::{self, CommandRequest};
use coxswain_cloud::locks::{self, LockAttempt, LockName, token_freshness_window};
use coxswain_cloud::params::{self, Param};
use coxswain_cloud::scripts::{self, CredentialReport, GenerateJoinCredentials};
use coxswain_common::retry::{RetryPolicy, retry};
use coxswain_common::{OpContext, timefmt};
use tokio_util::sync::CancellationToken;

use crate::error::BootstrapError;
use crate::run::{BootstrapDeps, BootstrapParams};
use crate::stage::{CleanupAction, CleanupStack};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A generator ran and fresh credentials are in the registry.
    Refreshed,
    /// Someone else refreshed within the freshness window; nothing to do.
    Skipped,
}

#[derive(Clone, Copy, Debug)]
pub struct RefreshConfig {
    pub wait_poll: Duration,
    pub wait_timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            wait_poll: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(120),
        }
    }
}

/// Token-generation protocol, requester side.
///
/// `token-refresh-lock` serializes requesters cluster-wide; the generation
/// script serializes on `token-gen-lock` on the generating peer. A token
/// updated within the last 60 s short-circuits the whole refresh. The
/// outer lock is released on every exit path.
pub async fn refresh_credentials(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    stack: &mut CleanupStack,
    config: &RefreshConfig,
    ctx: &OpContext,
    cancel: &CancellationToken,
) -> Result<RefreshOutcome, BootstrapError> {
    let deadline = tokio::time::Instant::now() + config.wait_timeout;
    loop {
        let now = Utc::now();
        match deps
            .locks
            .try_acquire(LockName::TokenRefresh, &params.instance_id, now)
            .await?
        {
            LockAttempt::Acquired => {
                let action = CleanupAction::ReleaseLock(LockName::TokenRefresh);
                stack.push(action.clone());

                // Another requester may have refreshed right before
                // releasing the lock to us.
                let result = if recently_updated(deps).await? {
                    tracing::info!("token already fresh; skipping generation");
                    Ok(RefreshOutcome::Skipped)
                } else {
                    generate_on_peer(deps, params, ctx, cancel)
                        .await
                        .map(|()| RefreshOutcome::Refreshed)
                };

                locks::release_best_effort(deps.locks, LockName::TokenRefresh).await;
                stack.discharge(&action);
                return result;
            }
            LockAttempt::HeldBy(_) => {
                if recently_updated(deps).await? {
                    tracing::info!("refresh in progress elsewhere and token is fresh; skipping");
                    return Ok(RefreshOutcome::Skipped);
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(
                        "gave up waiting for token-refresh-lock; joining with current credentials"
                    );
                    return Ok(RefreshOutcome::Skipped);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BootstrapError::Interrupted),
                    _ = tokio::time::sleep(config.wait_poll) => {}
                }
            }
        }
    }
}

async fn recently_updated(deps: &BootstrapDeps<'_>) -> Result<bool, BootstrapError> {
    let updated = params::get_timestamp(deps.registry, Param::JoinTokenUpdated).await?;
    Ok(updated
        .map(|when| timefmt::age(Utc::now(), when) < token_freshness_window())
        .unwrap_or(false))
}

async fn generate_on_peer(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    ctx: &OpContext,
    cancel: &CancellationToken,
) -> Result<(), BootstrapError> {
    let healthy = deps.fleet.healthy_control_plane().await?;
    let peer = healthy
        .iter()
        .find(|instance| instance.instance_id != params.instance_id)
        .ok_or(BootstrapError::NoPeer {
            operation: "token-generation",
        })?;

    let script = GenerateJoinCredentials {
        cluster: &params.cluster,
        table: &params.lock_table,
        region: &params.region,
    }
    .render()?;
    let request = CommandRequest {
        instance_id: peer.instance_id.clone(),
        script,
        timeout: exec::etcd_command_timeout(),
    };

    tracing::info!(peer = %peer.instance_id, "requesting credential generation");
    let output = retry(
        RetryPolicy::default(),
        cancel,
        deps.sink,
        "token-generation",
        |_attempt| {
            let request = request.clone();
            async move { exec::run(deps.exec, ctx, &request, cancel).await }
        },
    )
    .await
    .map_err(BootstrapError::CredentialGeneration)?;

    let report: CredentialReport = scripts::parse_report(&output.stdout)?;
    if !report.generated {
        tracing::warn!("generator reported nothing generated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use coxswain_cloud::locks::LockStore;

    use super::*;
    use crate::run::testing::{Fixture, test_params};

    fn fast_config() -> RefreshConfig {
        RefreshConfig {
            wait_poll: Duration::from_millis(5),
            wait_timeout: Duration::from_millis(100),
        }
    }

    const GENERATED: &str = r#"COXSWAIN_RESULT {"generated":true}"#;

    #[tokio::test]
    async fn generates_on_a_peer_and_releases_the_lock() {
        let fixture = Fixture::new();
        fixture.seed_initialized_cluster();
        fixture.exec.push_success(GENERATED);
        // Stale enough to need a refresh.
        fixture.registry.set(
            Param::JoinTokenUpdated,
            timefmt::format_utc(Utc::now() - ChronoDuration::hours(22)),
        );
        let params = test_params("i-new");
        let mut stack = CleanupStack::new();

        let outcome = refresh_credentials(
            &fixture.deps(),
            &params,
            &mut stack,
            &fast_config(),
            &OpContext::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RefreshOutcome::Refreshed);
        assert!(fixture.locks.held_locks().is_empty());

        let sent = fixture.exec.sent();
        assert_eq!(sent.len(), 1);
        assert_ne!(sent[0].instance_id, "i-new", "never generate on ourselves");
        assert!(sent[0].script.contains("token-gen-lock"));
    }

    #[tokio::test]
    async fn fresh_token_under_held_lock_skips_refresh() {
        let fixture = Fixture::new();
        fixture.seed_initialized_cluster();
        // Another requester holds the lock and refreshed 30 s ago.
        fixture
            .locks
            .try_acquire(LockName::TokenRefresh, "i-other", Utc::now())
            .await
            .unwrap();
        fixture.registry.set(
            Param::JoinTokenUpdated,
            timefmt::format_utc(Utc::now() - ChronoDuration::seconds(30)),
        );
        let params = test_params("i-new");
        let mut stack = CleanupStack::new();

        let outcome = refresh_credentials(
            &fixture.deps(),
            &params,
            &mut stack,
            &fast_config(),
            &OpContext::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RefreshOutcome::Skipped);
        assert!(fixture.exec.sent().is_empty());
    }

    #[tokio::test]
    async fn waits_out_a_stale_holder_then_gives_up_quietly() {
        let fixture = Fixture::new();
        fixture.seed_initialized_cluster();
        fixture
            .locks
            .try_acquire(LockName::TokenRefresh, "i-other", Utc::now())
            .await
            .unwrap();
        // Old token, so the freshness skip does not apply.
        fixture.registry.set(
            Param::JoinTokenUpdated,
            timefmt::format_utc(Utc::now() - ChronoDuration::hours(22)),
        );
        let params = test_params("i-new");
        let mut stack = CleanupStack::new();

        let outcome = refresh_credentials(
            &fixture.deps(),
            &params,
            &mut stack,
            &fast_config(),
            &OpContext::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RefreshOutcome::Skipped);
    }

    #[tokio::test]
    async fn no_peer_is_an_error() {
        let fixture = Fixture::new();
        // Only ourselves in the fleet.
        fixture
            .fleet
            .set_healthy(vec![coxswain_cloud::memory::instance("i-new", "10.0.1.20")]);
        fixture.registry.set(
            Param::JoinTokenUpdated,
            timefmt::format_utc(Utc::now() - ChronoDuration::hours(22)),
        );
        let params = test_params("i-new");
        let mut stack = CleanupStack::new();

        let err = refresh_credentials(
            &fixture.deps(),
            &params,
            &mut stack,
            &fast_config(),
            &OpContext::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, BootstrapError::NoPeer { .. }));
        assert!(fixture.locks.held_locks().is_empty(), "lock released on error too");
    }
}
