use anyhow::{Context, Result};
use clap::Parser;
use coxswain_bootstrap::kubeadm::KubeadmCli;
use coxswain_bootstrap::{BootstrapDeps, BootstrapParams, bootstrap};
use coxswain_cloud::exec::SsmRemoteExec;
use coxswain_cloud::fleet::Ec2Fleet;
use coxswain_cloud::locks::DynamoLockStore;
use coxswain_cloud::params::SsmParameterRegistry;
use coxswain_cloud::snapshots::S3SnapshotStore;
use coxswain_common::args::{AwsArgs, ClusterArgs, FleetArgs};
use coxswain_common::metrics::{EmfSink, cluster_namespace};
use coxswain_common::{OpContext, logging, shutdown};
use tracing::Instrument;

#[derive(Parser, Debug)]
#[command(author, version, about = "Control-plane bootstrap coordinator", long_about = None)]
struct Cli {
    #[command(flatten)]
    cluster: ClusterArgs,

    #[command(flatten)]
    aws: AwsArgs,

    #[command(flatten)]
    fleet: FleetArgs,

    /// This instance's EC2 id
    #[arg(long, env = "INSTANCE_ID", required = true)]
    instance_id: String,

    /// Kubernetes node name (the local hostname)
    #[arg(long, env = "NODE_NAME", required = true)]
    node_name: String,

    /// Private address advertised to peers
    #[arg(long, env = "PRIVATE_IP", required = true)]
    private_ip: String,

    /// API server endpoint (the load balancer address)
    #[arg(long, env = "CLUSTER_ENDPOINT", required = true)]
    endpoint: String,

    #[arg(long, env = "KUBERNETES_VERSION", required = true)]
    kubernetes_version: String,

    #[arg(long, env = "POD_SUBNET", default_value = "10.244.0.0/16")]
    pod_subnet: String,

    #[arg(long, env = "SERVICE_SUBNET", default_value = "10.96.0.0/12")]
    service_subnet: String,

    /// Object-store-hosted OIDC discovery issuer URL
    #[arg(long, env = "OIDC_ISSUER_URL", required = true)]
    oidc_issuer: String,

    #[arg(long, env = "AUDIT_POLICY_PATH", default_value = "/etc/kubernetes/audit-policy.yaml")]
    audit_policy_path: String,

    #[arg(long, env = "AUDIT_LOG_MAX_SIZE_MB", default_value_t = 100)]
    audit_log_max_size_mb: u32,

    #[arg(long, env = "AUDIT_LOG_MAX_BACKUPS", default_value_t = 5)]
    audit_log_max_backups: u32,

    /// Bucket holding etcd snapshots (restore source)
    #[arg(long, env = "SNAPSHOT_BUCKET", required = true)]
    snapshot_bucket: String,

    #[arg(long, env = "RESTORE_DOWNLOAD_PATH", default_value = "/tmp/etcd-restore.db")]
    restore_download_path: String,

    #[arg(long, env = "ETCD_DATA_DIR", default_value = "/var/lib/etcd")]
    etcd_data_dir: String,
}

impl Cli {
    fn params(&self) -> BootstrapParams {
        BootstrapParams {
            cluster: self.cluster.cluster_name.clone(),
            lock_table: self.cluster.lock_table.clone(),
            region: self.aws.region.clone(),
            instance_id: self.instance_id.clone(),
            node_name: self.node_name.clone(),
            private_ip: self.private_ip.clone(),
            endpoint: self.endpoint.clone(),
            kubernetes_version: self.kubernetes_version.clone(),
            pod_subnet: self.pod_subnet.clone(),
            service_subnet: self.service_subnet.clone(),
            oidc_issuer: self.oidc_issuer.clone(),
            audit_policy_path: self.audit_policy_path.clone(),
            audit_log_max_size_mb: self.audit_log_max_size_mb,
            audit_log_max_backups: self.audit_log_max_backups,
            restore_download_path: self.restore_download_path.clone(),
            etcd_data_dir: self.etcd_data_dir.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let params = cli.params();

    let ctx = OpContext::new();
    let span = ctx.span("bootstrap");
    span.in_scope(|| {
        tracing::info!(
            instance_id = %params.instance_id,
            node = %params.node_name,
            cluster = %params.cluster,
            "starting bootstrap"
        );
    });

    let sdk = coxswain_cloud::load_aws_config(&cli.aws).await;
    let locks = DynamoLockStore::new(
        aws_sdk_dynamodb::Client::new(&sdk),
        &cli.cluster.lock_table,
        &cli.cluster.cluster_name,
    );
    let registry = SsmParameterRegistry::new(
        aws_sdk_ssm::Client::new(&sdk),
        &cli.cluster.cluster_name,
    );
    let exec = SsmRemoteExec::new(aws_sdk_ssm::Client::new(&sdk));
    let fleet = Ec2Fleet::new(
        aws_sdk_autoscaling::Client::new(&sdk),
        aws_sdk_ec2::Client::new(&sdk),
        aws_sdk_elasticloadbalancingv2::Client::new(&sdk),
        &cli.fleet.group_name,
        &cli.fleet.target_group_arn,
    );
    let snapshots = S3SnapshotStore::new(aws_sdk_s3::Client::new(&sdk), &cli.snapshot_bucket);
    let tool = KubeadmCli::new();
    let sink = EmfSink::new(cluster_namespace(&cli.cluster.cluster_name))
        .with_dimension("ClusterName", &cli.cluster.cluster_name)
        .with_dimension("InstanceId", &cli.instance_id);

    let cancel = shutdown::cancel_on_shutdown();
    let deps = BootstrapDeps {
        locks: &locks,
        registry: &registry,
        exec: &exec,
        fleet: &fleet,
        snapshots: &snapshots,
        tool: &tool,
        sink: &sink,
    };

    bootstrap(&deps, &params, &cancel)
        .instrument(span)
        .await
        .context("bootstrap failed")?;
    Ok(())
}
