use anyhow::{Context, Result, bail};
use clap::Parser;
use coxswain_cloud::exec::SsmRemoteExec;
use coxswain_cloud::fleet::Ec2Fleet;
use coxswain_cloud::locks::DynamoLockStore;
use coxswain_common::args::{AwsArgs, ClusterArgs};
use coxswain_common::metrics::{EmfSink, LIFECYCLE_NAMESPACE};
use coxswain_common::{OpContext, logging, shutdown};
use coxswain_lifecycle::{HandlerConfig, LifecycleDeps, event, handler};
use tracing::Instrument;

#[derive(Parser, Debug)]
#[command(author, version, about = "Termination lifecycle-hook handler", long_about = None)]
struct Cli {
    #[command(flatten)]
    cluster: ClusterArgs,

    #[command(flatten)]
    aws: AwsArgs,

    /// Path to the lifecycle event envelope JSON, or "-" for stdin
    #[arg(long, env = "LIFECYCLE_EVENT_FILE", default_value = "-")]
    event_file: String,

    /// Target group the control plane is registered with
    #[arg(long, env = "TARGET_GROUP_ARN", required = true)]
    target_group_arn: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let raw = if cli.event_file == "-" {
        let mut buffer = String::new();
        use std::io::Read;
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("reading event from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(&cli.event_file)
            .with_context(|| format!("reading event file {}", cli.event_file))?
    };
    let event = event::parse_event(&raw)?;

    let ctx = OpContext::new();
    let span = ctx.span("lifecycle-handler");
    span.in_scope(|| {
        tracing::info!(
            instance_id = %event.instance_id,
            group = %event.group_name,
            hook = %event.hook_name,
            "handling termination event"
        );
    });

    let config = coxswain_cloud::load_aws_config(&cli.aws).await;
    let locks = DynamoLockStore::new(
        aws_sdk_dynamodb::Client::new(&config),
        &cli.cluster.lock_table,
        &cli.cluster.cluster_name,
    );
    let exec = SsmRemoteExec::new(aws_sdk_ssm::Client::new(&config));
    let fleet = Ec2Fleet::new(
        aws_sdk_autoscaling::Client::new(&config),
        aws_sdk_ec2::Client::new(&config),
        aws_sdk_elasticloadbalancingv2::Client::new(&config),
        &event.group_name,
        &cli.target_group_arn,
    );
    let sink = EmfSink::new(LIFECYCLE_NAMESPACE)
        .with_dimension("ClusterName", &cli.cluster.cluster_name)
        .with_dimension("InstanceId", &event.instance_id);

    let cancel = shutdown::cancel_on_shutdown();
    let deps = LifecycleDeps {
        locks: &locks,
        exec: &exec,
        fleet: &fleet,
        sink: &sink,
    };

    let outcome = handler::run(&deps, HandlerConfig::default(), &ctx, &event, &cancel)
        .instrument(span)
        .await;

    if let Some(err) = outcome.error {
        bail!("lifecycle handling abandoned: {err}");
    }
    Ok(())
}
