use chrono::{DateTime, Utc};
use coxswain_cloud::locks::{self, LockName, MemberRecord, MemberStatus};
use coxswain_cloud::params::{self, Param};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::BootstrapError;
use crate::run::{BootstrapDeps, BootstrapParams};
use crate::stage::{CleanupAction, CleanupStack, Stage};
use crate::tool::InitSpec;

pub(crate) struct Credentials {
    pub token: String,
    pub certificate_key: String,
    pub ca_cert_hash: String,
}

/// Initializer path: stand the control plane up, publish everything a
/// joiner needs, register this node, then flip the initialized flag and
/// hand the init lock back.
pub async fn run_init(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    stack: &mut CleanupStack,
    _cancel: &CancellationToken,
) -> Result<(), BootstrapError> {
    stack.enter(Stage::KubeadmInit);
    let config_yaml = config::render_init_config(&params.cluster_settings())?;
    deps.tool
        .init(&InitSpec {
            config_yaml,
            ignore_preflight_errors: Vec::new(),
        })
        .await?;
    tracing::info!(node = %params.node_name, "control plane initialized");

    let credentials = mint_credentials(deps).await?;

    stack.enter(Stage::SsmParams);
    publish_cluster_parameters(deps, params, &credentials, Utc::now()).await?;

    register_node(deps, params, stack).await?;

    // The flag is the last critical write: joiners polling it must find a
    // fully published cluster.
    params::put_bool(deps.registry, Param::Initialized, true).await?;

    let lock = CleanupAction::ReleaseLock(LockName::ClusterInit);
    deps.locks.release(LockName::ClusterInit).await?;
    stack.discharge(&lock);
    Ok(())
}

pub(crate) async fn mint_credentials(
    deps: &BootstrapDeps<'_>,
) -> Result<Credentials, BootstrapError> {
    let token = deps.tool.create_join_token().await?;
    let certificate_key = deps.tool.certificate_key().await?;
    deps.tool.upload_certs(&certificate_key).await?;
    let ca_cert_hash = deps.tool.discovery_hash().await?;
    Ok(Credentials {
        token,
        certificate_key,
        ca_cert_hash,
    })
}

/// Publish the registry entries joiners depend on, in a fixed order.
/// Any failure here is critical: the caller fails the whole bootstrap and
/// cleanup releases the init lock.
pub(crate) async fn publish_cluster_parameters(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    credentials: &Credentials,
    now: DateTime<Utc>,
) -> Result<(), BootstrapError> {
    let registry = deps.registry;
    registry.put(Param::Endpoint, &params.endpoint).await?;
    registry.put(Param::CaCertHash, &credentials.ca_cert_hash).await?;
    registry.put(Param::JoinToken, &credentials.token).await?;
    params::put_timestamp(registry, Param::JoinTokenUpdated, now).await?;
    registry
        .put(Param::CertificateKey, &credentials.certificate_key)
        .await?;
    params::put_timestamp(registry, Param::CertificateKeyUpdated, now).await?;
    registry
        .put(Param::KubernetesVersion, &params.kubernetes_version)
        .await?;
    registry.put(Param::OidcIssuer, &params.oidc_issuer).await?;
    tracing::info!("cluster parameters published");
    Ok(())
}

/// Register the local etcd member record and the load-balancer target,
/// pushing the matching undo actions.
pub(crate) async fn register_node(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    stack: &mut CleanupStack,
) -> Result<(), BootstrapError> {
    stack.enter(Stage::EtcdRegistration);
    let member_id = locks::member_id_hex(
        deps.tool.local_etcd_member_id(&params.node_name).await?,
    );
    let now = Utc::now();
    deps.locks
        .put_member(&MemberRecord {
            member_id: member_id.clone(),
            instance_id: params.instance_id.clone(),
            private_ip: params.private_ip.clone(),
            hostname: params.node_name.clone(),
            status: MemberStatus::Active,
            created_at: now,
            updated_at: now,
            request_id: None,
        })
        .await?;
    stack.push(CleanupAction::DeleteMember {
        member_id: member_id.clone(),
    });
    tracing::info!(member_id = %member_id, "etcd member registered");

    stack.enter(Stage::LbRegistration);
    deps.fleet.register_target(&params.instance_id).await?;
    stack.push(CleanupAction::DeregisterTarget {
        instance_id: params.instance_id.clone(),
    });
    Ok(())
}
