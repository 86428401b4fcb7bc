use std::time::Instant;

use coxswain_cloud::exec::RemoteExec;
use coxswain_cloud::fleet::Fleet;
use coxswain_cloud::locks::{self, LockStore};
use coxswain_cloud::params::{self, Param, ParameterRegistry};
use coxswain_cloud::snapshots::SnapshotStore;
use coxswain_common::metrics::{MetricSink, Unit, names};
use tokio_util::sync::CancellationToken;

use crate::config::ClusterSettings;
use crate::election::{self, Role};
use crate::error::BootstrapError;
use crate::restore::{self, RestoreOutcome};
use crate::stage::{CleanupAction, CleanupStack, Stage};
use crate::tool::ClusterTool;
use crate::{init, join};

pub struct BootstrapDeps<'a> {
    pub locks: &'a dyn LockStore,
    pub registry: &'a dyn ParameterRegistry,
    pub exec: &'a dyn RemoteExec,
    pub fleet: &'a dyn Fleet,
    pub snapshots: &'a dyn SnapshotStore,
    pub tool: &'a dyn ClusterTool,
    pub sink: &'a dyn MetricSink,
}

#[derive(Clone, Debug)]
pub struct BootstrapParams {
    pub cluster: String,
    pub lock_table: String,
    pub region: String,
    pub instance_id: String,
    pub node_name: String,
    pub private_ip: String,
    pub endpoint: String,
    pub kubernetes_version: String,
    pub pod_subnet: String,
    pub service_subnet: String,
    pub oidc_issuer: String,
    pub audit_policy_path: String,
    pub audit_log_max_size_mb: u32,
    pub audit_log_max_backups: u32,
    pub restore_download_path: String,
    pub etcd_data_dir: String,
}

impl BootstrapParams {
    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings {
            node_name: self.node_name.clone(),
            advertise_address: self.private_ip.clone(),
            control_plane_endpoint: self.endpoint.clone(),
            kubernetes_version: self.kubernetes_version.clone(),
            pod_subnet: self.pod_subnet.clone(),
            service_subnet: self.service_subnet.clone(),
            service_account_issuer: self.oidc_issuer.clone(),
            audit_policy_path: self.audit_policy_path.clone(),
            audit_log_max_size_mb: self.audit_log_max_size_mb,
            audit_log_max_backups: self.audit_log_max_backups,
        }
    }

    pub fn peer_url(&self) -> String {
        format!("https://{}:2380", self.private_ip)
    }
}

/// One full bootstrap run for this instance: disaster recovery when armed,
/// otherwise election into the init or join path. Failure or cancellation
/// runs the cleanup stack before returning.
pub async fn bootstrap(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    cancel: &CancellationToken,
) -> Result<(), BootstrapError> {
    let started = Instant::now();
    let mut stack = CleanupStack::new();

    let result = {
        let stages = run_stages(deps, params, &mut stack, cancel);
        tokio::pin!(stages);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BootstrapError::Interrupted),
            result = &mut stages => result,
        }
    };

    match result {
        Ok(()) => {
            stack.enter(Stage::Complete);
            tracing::info!(instance_id = %params.instance_id, "bootstrap complete");
            deps.sink.put_metric(names::BOOTSTRAP_SUCCESS, 1.0, Unit::Count);
            deps.sink.put_metric(
                names::BOOTSTRAP_DURATION,
                started.elapsed().as_millis() as f64,
                Unit::Milliseconds,
            );
            deps.sink.flush();
            Ok(())
        }
        Err(err) => {
            tracing::error!(
                stage = stack.stage().as_str(),
                error = %err,
                "bootstrap failed; running cleanup"
            );
            run_cleanup(deps, &mut stack).await;
            deps.sink.put_metric(names::BOOTSTRAP_FAILURE, 1.0, Unit::Count);
            deps.sink.put_metric(
                names::BOOTSTRAP_DURATION,
                started.elapsed().as_millis() as f64,
                Unit::Milliseconds,
            );
            deps.sink.flush();
            Err(err)
        }
    }
}

async fn run_stages(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    stack: &mut CleanupStack,
    cancel: &CancellationToken,
) -> Result<(), BootstrapError> {
    if params::get_bool(deps.registry, Param::RestoreMode).await? {
        match params::get_initialized_value(deps.registry, Param::RestoreBackup).await? {
            Some(backup_key) => {
                match restore::try_restore(deps, params, stack, &backup_key, cancel).await? {
                    RestoreOutcome::Restored => return Ok(()),
                    RestoreOutcome::LostRace => {
                        tracing::info!(
                            "another instance is restoring; continuing on the join path"
                        );
                    }
                }
            }
            None => {
                tracing::warn!("restore-mode set without a restore backup; ignoring the flag");
            }
        }
    }

    match election::elect(deps, params, stack, &election::ElectionConfig::default(), cancel)
        .await?
    {
        Role::Initializer => init::run_init(deps, params, stack, cancel).await,
        Role::Joiner => join::run_join(deps, params, stack, cancel).await,
    }
}

/// Best-effort teardown driven by the stage the flow failed in. Lock
/// releases come last (reverse acquisition order); local reset runs for
/// any failure past `Init`.
pub async fn run_cleanup(deps: &BootstrapDeps<'_>, stack: &mut CleanupStack) {
    let needs_reset = stack.needs_local_reset();
    for action in stack.drain() {
        match action {
            CleanupAction::ReleaseLock(lock) => {
                locks::release_best_effort(deps.locks, lock).await;
            }
            CleanupAction::DeregisterTarget { instance_id } => {
                if let Err(err) = deps.fleet.deregister_target(&instance_id).await {
                    tracing::warn!(instance_id = %instance_id, error = %err, "cleanup: deregister failed");
                }
            }
            CleanupAction::DeleteMember { member_id } => {
                if let Err(err) = deps.locks.delete_member(&member_id).await {
                    tracing::warn!(member_id = %member_id, error = %err, "cleanup: member delete failed");
                }
            }
        }
    }
    if needs_reset {
        if let Err(err) = deps.tool.reset().await {
            tracing::warn!(error = %err, "cleanup: local reset failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::Utc;
    use coxswain_cloud::memory::{
        MemoryExec, MemoryFleet, MemoryLockStore, MemoryRegistry, MemorySnapshots, instance,
    };
    use coxswain_cloud::params::Param;
    use coxswain_common::metrics::CollectingSink;

    use super::*;
    use crate::tool::testing::FakeTool;

    pub(crate) fn test_params(instance_id: &str) -> BootstrapParams {
        BootstrapParams {
            cluster: "prod".to_string(),
            lock_table: "k8s-cluster-state".to_string(),
            region: "us-east-1".to_string(),
            instance_id: instance_id.to_string(),
            node_name: format!("{instance_id}.ec2.internal"),
            private_ip: "10.0.1.20".to_string(),
            endpoint: "k8s.internal:6443".to_string(),
            kubernetes_version: "v1.29.4".to_string(),
            pod_subnet: "10.244.0.0/16".to_string(),
            service_subnet: "10.96.0.0/12".to_string(),
            oidc_issuer: "https://oidc-bucket.s3.amazonaws.com/prod".to_string(),
            audit_policy_path: "/etc/kubernetes/audit-policy.yaml".to_string(),
            audit_log_max_size_mb: 100,
            audit_log_max_backups: 5,
            restore_download_path: "/tmp/etcd-restore.db".to_string(),
            etcd_data_dir: "/var/lib/etcd".to_string(),
        }
    }

    pub(crate) struct Fixture {
        pub locks: MemoryLockStore,
        pub registry: MemoryRegistry,
        pub exec: MemoryExec,
        pub fleet: MemoryFleet,
        pub snapshots: MemorySnapshots,
        pub tool: FakeTool,
        pub sink: CollectingSink,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self {
                locks: MemoryLockStore::new(),
                registry: MemoryRegistry::new(),
                exec: MemoryExec::new(),
                fleet: MemoryFleet::new(),
                snapshots: MemorySnapshots::new(),
                tool: FakeTool::new(),
                sink: CollectingSink::new(),
            }
        }

        pub fn deps(&self) -> BootstrapDeps<'_> {
            BootstrapDeps {
                locks: &self.locks,
                registry: &self.registry,
                exec: &self.exec,
                fleet: &self.fleet,
                snapshots: &self.snapshots,
                tool: &self.tool,
                sink: &self.sink,
            }
        }

        /// Registry state as an already-initialized cluster would publish it.
        pub fn seed_initialized_cluster(&self) {
            self.registry.set(Param::Initialized, "true");
            self.registry.set(Param::Endpoint, "k8s.internal:6443");
            self.registry
                .set(Param::CaCertHash, "sha256:1b2c3d4e5f60718293a4b5c6d7e8f900");
            self.registry.set(Param::JoinToken, "abcdef.0123456789abcdef");
            self.registry.set(
                Param::JoinTokenUpdated,
                coxswain_common::timefmt::format_utc(Utc::now()),
            );
            self.registry.set(Param::CertificateKey, "b".repeat(64));
            self.registry.set(
                Param::CertificateKeyUpdated,
                coxswain_common::timefmt::format_utc(Utc::now()),
            );
            self.fleet.set_healthy(vec![
                instance("i-existing-1", "10.0.1.10"),
                instance("i-existing-2", "10.0.1.11"),
            ]);
        }
    }
}
