use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use coxswain_cloud::exec::SsmRemoteExec;
use coxswain_cloud::fleet::Ec2Fleet;
use coxswain_cloud::params::SsmParameterRegistry;
use coxswain_cloud::snapshots::S3SnapshotStore;
use coxswain_common::args::{AwsArgs, ClusterArgs, FleetArgs};
use coxswain_common::metrics::{BACKUP_NAMESPACE, EmfSink, HEALTH_NAMESPACE};
use coxswain_common::{OpContext, logging, shutdown};
use coxswain_warden::backup::{BackupConfig, BackupDeps, run_backup};
use coxswain_warden::health::{DEFAULT_FAILURE_THRESHOLD, HealthConfig, HealthDeps, run_health_check};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Snapshot etcd from a healthy member and upload it
    Backup(BackupArgs),

    /// Count healthy control-plane instances and arm recovery on total loss
    Health(HealthArgs),
}

#[derive(Parser, Debug)]
struct BackupArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    #[command(flatten)]
    aws: AwsArgs,

    #[command(flatten)]
    fleet: FleetArgs,

    /// Bucket receiving etcd snapshots
    #[arg(long, env = "SNAPSHOT_BUCKET", required = true)]
    bucket: String,

    /// Scratch path for the snapshot on the target instance
    #[arg(long, env = "SNAPSHOT_LOCAL_PATH", default_value = "/tmp/etcd-snapshot.db")]
    local_path: String,

    /// Seconds between runs; 0 runs once and exits
    #[arg(long, env = "BACKUP_INTERVAL_SECS", default_value_t = 0)]
    interval_secs: u64,
}

#[derive(Parser, Debug)]
struct HealthArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    #[command(flatten)]
    aws: AwsArgs,

    #[command(flatten)]
    fleet: FleetArgs,

    /// Bucket holding etcd snapshots (restore source)
    #[arg(long, env = "SNAPSHOT_BUCKET", required = true)]
    bucket: String,

    /// Consecutive all-unhealthy ticks before recovery is armed
    #[arg(long, env = "HEALTH_FAILURE_THRESHOLD", default_value_t = DEFAULT_FAILURE_THRESHOLD)]
    failure_threshold: u64,

    /// Seconds between runs; 0 runs once and exits
    #[arg(long, env = "HEALTH_INTERVAL_SECS", default_value_t = 0)]
    interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Backup(args) => run_backup_command(args).await,
        Commands::Health(args) => run_health_command(args).await,
    }
}

async fn run_backup_command(args: BackupArgs) -> Result<()> {
    let sdk = coxswain_cloud::load_aws_config(&args.aws).await;
    let exec = SsmRemoteExec::new(aws_sdk_ssm::Client::new(&sdk));
    let fleet = Ec2Fleet::new(
        aws_sdk_autoscaling::Client::new(&sdk),
        aws_sdk_ec2::Client::new(&sdk),
        aws_sdk_elasticloadbalancingv2::Client::new(&sdk),
        &args.fleet.group_name,
        &args.fleet.target_group_arn,
    );
    let config = BackupConfig {
        cluster: args.cluster.cluster_name.clone(),
        bucket: args.bucket.clone(),
        local_path: args.local_path.clone(),
        retry: Default::default(),
    };

    let cancel = shutdown::cancel_on_shutdown();
    run_on_schedule(args.interval_secs, &cancel, || {
        let config = config.clone();
        let cluster_name = args.cluster.cluster_name.clone();
        let exec = &exec;
        let fleet = &fleet;
        let cancel = cancel.clone();
        async move {
            let ctx = OpContext::new();
            let sink = EmfSink::new(BACKUP_NAMESPACE).with_dimension("ClusterName", cluster_name);
            let deps = BackupDeps {
                fleet,
                exec,
                sink: &sink,
            };
            run_backup(&deps, &config, &ctx, Utc::now(), &cancel).await?;
            Ok(())
        }
    })
    .await
}

async fn run_health_command(args: HealthArgs) -> Result<()> {
    let sdk = coxswain_cloud::load_aws_config(&args.aws).await;
    let registry = SsmParameterRegistry::new(
        aws_sdk_ssm::Client::new(&sdk),
        &args.cluster.cluster_name,
    );
    let snapshots = S3SnapshotStore::new(aws_sdk_s3::Client::new(&sdk), &args.bucket);
    let fleet = Ec2Fleet::new(
        aws_sdk_autoscaling::Client::new(&sdk),
        aws_sdk_ec2::Client::new(&sdk),
        aws_sdk_elasticloadbalancingv2::Client::new(&sdk),
        &args.fleet.group_name,
        &args.fleet.target_group_arn,
    );
    let config = HealthConfig {
        cluster: args.cluster.cluster_name.clone(),
        failure_threshold: args.failure_threshold,
    };

    let cancel = shutdown::cancel_on_shutdown();
    run_on_schedule(args.interval_secs, &cancel, || {
        let config = config.clone();
        let cluster_name = args.cluster.cluster_name.clone();
        let fleet = &fleet;
        let registry = &registry;
        let snapshots = &snapshots;
        async move {
            let sink = EmfSink::new(HEALTH_NAMESPACE).with_dimension("ClusterName", cluster_name);
            let deps = HealthDeps {
                fleet,
                registry,
                snapshots,
                sink: &sink,
            };
            let outcome = run_health_check(&deps, &config, Utc::now()).await?;
            tracing::info!(?outcome, "health tick complete");
            Ok(())
        }
    })
    .await
}

/// Run once, or on a fixed interval until shutdown. Interval-mode failures
/// are logged and the loop keeps going; one-shot failures propagate so the
/// scheduler sees a non-zero exit.
async fn run_on_schedule<F, Fut>(
    interval_secs: u64,
    cancel: &CancellationToken,
    mut tick: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if interval_secs == 0 {
        return tick().await;
    }

    let interval = Duration::from_secs(interval_secs);
    loop {
        if let Err(err) = tick().await {
            tracing::error!(error = %err, "scheduled run failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("shutdown requested; stopping schedule");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
