use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct ClusterArgs {
    /// Cluster name; namespaces every lock, parameter, and snapshot key
    #[arg(long, env = "CLUSTER_NAME", required = true)]
    pub cluster_name: String,

    /// DynamoDB table holding lock and member records
    #[arg(long, env = "LOCK_TABLE", default_value = "k8s-cluster-state")]
    pub lock_table: String,
}

#[derive(Parser, Debug, Clone)]
pub struct FleetArgs {
    /// Auto-scaling group running the control plane
    #[arg(long, env = "CONTROL_PLANE_ASG", required = true)]
    pub group_name: String,

    /// Target group the control plane registers with
    #[arg(long, env = "TARGET_GROUP_ARN", required = true)]
    pub target_group_arn: String,
}

#[derive(Parser, Debug, Clone)]
pub struct AwsArgs {
    /// AWS region
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    pub region: String,

    /// Endpoint URL override (for local stacks)
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    pub endpoint: Option<String>,
}
