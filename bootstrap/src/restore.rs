use std::path::Path;

use chrono::Utc;
use coxswain_cloud::locks::{self, LockAttempt, LockName};
use coxswain_cloud::params::{self, Param};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::BootstrapError;
use crate::init;
use crate::run::{BootstrapDeps, BootstrapParams};
use crate::stage::{CleanupAction, CleanupStack, Stage};
use crate::tool::{InitSpec, RestoreSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// This instance restored the cluster from the snapshot.
    Restored,
    /// Another instance holds the restore lock; join normally once its
    /// parameters appear.
    LostRace,
}

/// Single-leader disaster recovery. A stale restore lock (a restorer that
/// died mid-flight) is force-released before the acquisition attempt.
pub async fn try_restore(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    stack: &mut CleanupStack,
    backup_key: &str,
    cancel: &CancellationToken,
) -> Result<RestoreOutcome, BootstrapError> {
    let now = Utc::now();
    if let Some(record) = deps.locks.inspect(LockName::Restore).await?
        && record.is_stale(LockName::Restore, now)
    {
        tracing::warn!(
            holder = %record.holder,
            age_secs = record.age(now).num_seconds(),
            "force-releasing stale restore lock"
        );
        locks::release_best_effort(deps.locks, LockName::Restore).await;
    }

    match deps
        .locks
        .try_acquire(LockName::Restore, &params.instance_id, now)
        .await?
    {
        LockAttempt::HeldBy(_) => Ok(RestoreOutcome::LostRace),
        LockAttempt::Acquired => {
            let action = CleanupAction::ReleaseLock(LockName::Restore);
            stack.push(action.clone());

            run_restore(deps, params, stack, backup_key, cancel).await?;

            locks::release_best_effort(deps.locks, LockName::Restore).await;
            stack.discharge(&action);
            Ok(RestoreOutcome::Restored)
        }
    }
}

async fn run_restore(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    stack: &mut CleanupStack,
    backup_key: &str,
    _cancel: &CancellationToken,
) -> Result<(), BootstrapError> {
    tracing::info!(backup = %backup_key, "starting disaster recovery restore");

    deps.snapshots
        .download(backup_key, Path::new(&params.restore_download_path))
        .await?;

    // Offline restore into a fresh data dir, single-member initial cluster
    // named after this node. kubeadm then adopts the pre-seeded directory.
    deps.tool
        .restore_snapshot(&RestoreSpec {
            snapshot_path: params.restore_download_path.clone(),
            node_name: params.node_name.clone(),
            peer_url: params.peer_url(),
            data_dir: params.etcd_data_dir.clone(),
        })
        .await?;

    stack.enter(Stage::KubeadmInit);
    let config_yaml = config::render_init_config(&params.cluster_settings())?;
    deps.tool
        .init(&InitSpec {
            config_yaml,
            ignore_preflight_errors: vec!["DirAvailable--var-lib-etcd".to_string()],
        })
        .await?;

    let credentials = init::mint_credentials(deps).await?;

    stack.enter(Stage::SsmParams);
    init::publish_cluster_parameters(deps, params, &credentials, Utc::now()).await?;
    params::put_bool(deps.registry, Param::RestoreMode, false).await?;

    init::register_node(deps, params, stack).await?;

    params::put_bool(deps.registry, Param::Initialized, true).await?;
    tracing::info!(backup = %backup_key, "disaster recovery complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use coxswain_cloud::locks::{LockStore, MemberStatus};

    use super::*;
    use crate::run::testing::{Fixture, test_params};

    const BACKUP_KEY: &str = "prod/etcd-snapshot-20250115-060000.db";

    fn seed_armed_recovery(fixture: &Fixture) {
        fixture.registry.set(Param::RestoreMode, "true");
        fixture.registry.set(Param::RestoreBackup, BACKUP_KEY);
        fixture.registry.set(Param::Initialized, "false");
        fixture
            .snapshots
            .add(BACKUP_KEY, Utc::now() - ChronoDuration::hours(3), vec![0xde, 0xad]);
    }

    fn restore_params(instance_id: &str, scratch: &tempfile::TempDir) -> crate::run::BootstrapParams {
        let mut params = test_params(instance_id);
        params.restore_download_path = scratch
            .path()
            .join("etcd-restore.db")
            .to_string_lossy()
            .into_owned();
        params
    }

    #[tokio::test]
    async fn winner_restores_publishes_and_unflags() {
        let fixture = Fixture::new();
        seed_armed_recovery(&fixture);
        let scratch = tempfile::tempdir().expect("tempdir");
        let params = restore_params("i-new", &scratch);
        let mut stack = CleanupStack::new();

        let outcome = try_restore(
            &fixture.deps(),
            &params,
            &mut stack,
            BACKUP_KEY,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RestoreOutcome::Restored);
        assert_eq!(fixture.registry.value(Param::RestoreMode).as_deref(), Some("false"));
        assert_eq!(fixture.registry.value(Param::Initialized).as_deref(), Some("true"));
        assert!(fixture.registry.value(Param::JoinToken).is_some());
        assert!(fixture.locks.held_locks().is_empty());

        let calls = fixture.tool.call_log();
        assert!(calls.iter().any(|c| c.starts_with("restore_snapshot")));
        assert!(
            calls
                .iter()
                .any(|c| c.contains("ignore_preflight=DirAvailable--var-lib-etcd")),
            "init must tolerate the pre-seeded etcd data dir"
        );

        let member = fixture.locks.member("8e9e05c52164694d").expect("member");
        assert_eq!(member.status, MemberStatus::Active);
    }

    #[tokio::test]
    async fn loser_of_the_race_joins_normally() {
        let fixture = Fixture::new();
        seed_armed_recovery(&fixture);
        fixture
            .locks
            .try_acquire(LockName::Restore, "i-other", Utc::now())
            .await
            .unwrap();
        let scratch = tempfile::tempdir().expect("tempdir");
        let params = restore_params("i-new", &scratch);
        let mut stack = CleanupStack::new();

        let outcome = try_restore(
            &fixture.deps(),
            &params,
            &mut stack,
            BACKUP_KEY,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RestoreOutcome::LostRace);
        assert!(fixture.tool.call_log().is_empty());
    }

    #[tokio::test]
    async fn stale_restore_lock_is_swept_at_the_ttl_boundary() {
        let fixture = Fixture::new();
        seed_armed_recovery(&fixture);
        // A restorer that died exactly 1800 s ago.
        fixture
            .locks
            .try_acquire(
                LockName::Restore,
                "i-dead",
                Utc::now() - ChronoDuration::seconds(1800),
            )
            .await
            .unwrap();
        let scratch = tempfile::tempdir().expect("tempdir");
        let params = restore_params("i-new", &scratch);
        let mut stack = CleanupStack::new();

        let outcome = try_restore(
            &fixture.deps(),
            &params,
            &mut stack,
            BACKUP_KEY,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RestoreOutcome::Restored, "stale lock must not block recovery");
    }

    #[tokio::test]
    async fn restore_is_idempotent_on_the_registry() {
        let fixture = Fixture::new();
        seed_armed_recovery(&fixture);
        let scratch = tempfile::tempdir().expect("tempdir");
        let params = restore_params("i-new", &scratch);

        let mut stack = CleanupStack::new();
        try_restore(&fixture.deps(), &params, &mut stack, BACKUP_KEY, &CancellationToken::new())
            .await
            .unwrap();
        let first_mode = fixture.registry.value(Param::RestoreMode);
        let first_initialized = fixture.registry.value(Param::Initialized);

        // Re-run with the same backup key (a re-armed flag or a replayed
        // boot); end state must not change.
        fixture.registry.set(Param::RestoreMode, "true");
        let mut stack = CleanupStack::new();
        let outcome = try_restore(
            &fixture.deps(),
            &params,
            &mut stack,
            BACKUP_KEY,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, RestoreOutcome::Restored);
        assert_eq!(fixture.registry.value(Param::RestoreMode), first_mode);
        assert_eq!(fixture.registry.value(Param::Initialized), first_initialized);
    }
}
