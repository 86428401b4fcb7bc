use chrono::{Duration, Utc};
use coxswain_cloud::params::{self, Param};
use coxswain_common::{OpContext, timefmt};
use tokio_util::sync::CancellationToken;

use crate::error::BootstrapError;
use crate::init;
use crate::run::{BootstrapDeps, BootstrapParams};
use crate::stage::{CleanupStack, Stage};
use crate::token::{self, RefreshConfig};
use crate::tool::JoinSpec;

/// kubeadm tokens live 24 h; refresh from 20 h so a join started near the
/// boundary still has hours of validity.
pub fn token_needs_refresh(age: Option<Duration>) -> bool {
    match age {
        None => true,
        Some(age) => age >= Duration::hours(20),
    }
}

/// Uploaded certs live 2 h; the 90 min threshold leaves buffer for the
/// join itself.
pub fn certificate_key_needs_refresh(age: Option<Duration>) -> bool {
    match age {
        None => true,
        Some(age) => age >= Duration::minutes(90),
    }
}

struct JoinMaterial {
    endpoint: String,
    token: String,
    ca_cert_hash: String,
    certificate_key: String,
}

/// Joiner path: validate the published parameters, proactively refresh
/// aging credentials, join, and on a failed join refresh once and retry
/// exactly once.
pub async fn run_join(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    stack: &mut CleanupStack,
    cancel: &CancellationToken,
) -> Result<(), BootstrapError> {
    stack.enter(Stage::KubeadmJoin);
    // Fail fast before touching anything if provisioning never completed.
    read_material(deps, params).await?;

    let ctx = OpContext::new();
    let now = Utc::now();
    let token_age = params::get_timestamp(deps.registry, Param::JoinTokenUpdated)
        .await?
        .map(|when| timefmt::age(now, when));
    let certificate_age = params::get_timestamp(deps.registry, Param::CertificateKeyUpdated)
        .await?
        .map(|when| timefmt::age(now, when));

    if token_needs_refresh(token_age) || certificate_key_needs_refresh(certificate_age) {
        tracing::info!(
            token_age_secs = token_age.map(|a| a.num_seconds()),
            certificate_age_secs = certificate_age.map(|a| a.num_seconds()),
            "credentials aging; refreshing before join"
        );
        token::refresh_credentials(deps, params, stack, &RefreshConfig::default(), &ctx, cancel)
            .await?;
    }

    let material = read_material(deps, params).await?;
    match attempt_join(deps, params, &material).await {
        Ok(()) => {}
        Err(first_failure) => {
            tracing::warn!(
                error = %first_failure,
                "join failed; refreshing credentials and retrying once"
            );
            token::refresh_credentials(deps, params, stack, &RefreshConfig::default(), &ctx, cancel)
                .await?;
            deps.tool.reset().await?;
            let material = read_material(deps, params).await?;
            attempt_join(deps, params, &material)
                .await
                .map_err(BootstrapError::JoinFailed)?;
        }
    }
    tracing::info!(node = %params.node_name, "joined the control plane");

    init::register_node(deps, params, stack).await
}

async fn attempt_join(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    material: &JoinMaterial,
) -> Result<(), crate::tool::ClusterToolError> {
    deps.tool
        .join(&JoinSpec {
            endpoint: material.endpoint.clone(),
            token: material.token.clone(),
            ca_cert_hash: material.ca_cert_hash.clone(),
            certificate_key: material.certificate_key.clone(),
            node_name: params.node_name.clone(),
        })
        .await
}

async fn read_material(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
) -> Result<JoinMaterial, BootstrapError> {
    Ok(JoinMaterial {
        endpoint: required(deps, params, Param::Endpoint).await?,
        token: required(deps, params, Param::JoinToken).await?,
        ca_cert_hash: required(deps, params, Param::CaCertHash).await?,
        certificate_key: required(deps, params, Param::CertificateKey).await?,
    })
}

async fn required(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    param: Param,
) -> Result<String, BootstrapError> {
    params::get_initialized_value(deps.registry, param)
        .await?
        .ok_or_else(|| BootstrapError::ParameterUninitialized(param.path(&params.cluster)))
}

#[cfg(test)]
mod tests {
    use coxswain_cloud::locks::MemberStatus;

    use super::*;
    use crate::run::testing::{Fixture, test_params};

    #[test]
    fn token_refresh_threshold_is_twenty_hours_inclusive() {
        assert!(token_needs_refresh(Some(Duration::hours(20))));
        assert!(token_needs_refresh(Some(Duration::hours(22))));
        assert!(!token_needs_refresh(Some(
            Duration::hours(20) - Duration::seconds(1)
        )));
        assert!(token_needs_refresh(None));
    }

    #[test]
    fn certificate_refresh_threshold_is_ninety_minutes_inclusive() {
        assert!(certificate_key_needs_refresh(Some(Duration::minutes(90))));
        assert!(!certificate_key_needs_refresh(Some(
            Duration::minutes(90) - Duration::seconds(1)
        )));
        assert!(certificate_key_needs_refresh(None));
    }

    #[tokio::test]
    async fn join_with_fresh_credentials_registers_the_node() {
        let fixture = Fixture::new();
        fixture.seed_initialized_cluster();
        let params = test_params("i-2");
        let mut stack = CleanupStack::new();

        run_join(&fixture.deps(), &params, &mut stack, &CancellationToken::new())
            .await
            .expect("join");

        let member = fixture.locks.member("8e9e05c52164694d").expect("member");
        assert_eq!(member.status, MemberStatus::Active);
        assert_eq!(member.instance_id, "i-2");
        assert!(fixture.exec.sent().is_empty(), "no refresh needed");
    }

    #[tokio::test]
    async fn missing_parameters_fail_before_any_join_attempt() {
        let fixture = Fixture::new();
        fixture.seed_initialized_cluster();
        fixture.registry.set(Param::JoinToken, "PENDING_INITIALIZATION");
        let params = test_params("i-2");
        let mut stack = CleanupStack::new();

        let err = run_join(&fixture.deps(), &params, &mut stack, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            BootstrapError::ParameterUninitialized(path) => {
                assert_eq!(path, "/prod/cluster/join-token");
            }
            other => panic!("expected uninitialized parameter, got {other:?}"),
        }
        assert!(fixture.tool.call_log().is_empty(), "no kubeadm calls");
    }

    #[tokio::test]
    async fn failed_join_resets_and_retries_exactly_once() {
        let fixture = Fixture::new();
        fixture.seed_initialized_cluster();
        fixture.tool.fail_joins(1);
        let params = test_params("i-2");
        let mut stack = CleanupStack::new();

        run_join(&fixture.deps(), &params, &mut stack, &CancellationToken::new())
            .await
            .expect("second join succeeds");

        let calls = fixture.tool.call_log();
        let joins = calls.iter().filter(|c| c.starts_with("join")).count();
        assert_eq!(joins, 2);
        assert!(calls.iter().any(|c| c == "reset"));
        // Token was updated within the freshness window, so the retry reuses
        // it instead of generating a new one.
        assert!(fixture.exec.sent().is_empty());
        assert!(fixture.locks.held_locks().is_empty());
    }

    #[tokio::test]
    async fn stale_token_on_failed_join_triggers_generation_before_the_retry() {
        let fixture = Fixture::new();
        fixture.seed_initialized_cluster();
        // Old enough that both the proactive gate and the retry regenerate.
        fixture.registry.set(
            Param::JoinTokenUpdated,
            timefmt::format_utc(Utc::now() - Duration::hours(22)),
        );
        fixture.tool.fail_joins(1);
        fixture
            .exec
            .push_success(r#"COXSWAIN_RESULT {"generated":true}"#);
        fixture
            .exec
            .push_success(r#"COXSWAIN_RESULT {"generated":true}"#);
        let params = test_params("i-2");
        let mut stack = CleanupStack::new();

        run_join(&fixture.deps(), &params, &mut stack, &CancellationToken::new())
            .await
            .expect("second join succeeds");

        let calls = fixture.tool.call_log();
        assert_eq!(calls.iter().filter(|c| c.starts_with("join")).count(), 2);
        assert_eq!(fixture.exec.sent().len(), 2, "proactive and retry generation");
        assert!(fixture.locks.held_locks().is_empty());
    }

    #[tokio::test]
    async fn second_join_failure_fails_bootstrap() {
        let fixture = Fixture::new();
        fixture.seed_initialized_cluster();
        fixture.tool.fail_joins(2);
        let params = test_params("i-2");
        let mut stack = CleanupStack::new();

        let err = run_join(&fixture.deps(), &params, &mut stack, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::JoinFailed(_)));
    }
}
