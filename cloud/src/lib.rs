use aws_config::{BehaviorVersion, Region, SdkConfig};
use coxswain_common::args::AwsArgs;

pub mod error;
pub mod exec;
pub mod fleet;
pub mod locks;
pub mod memory;
pub mod params;
pub mod scripts;
pub mod snapshots;

pub use error::{ExecError, StoreError};

/// Load the shared AWS SDK configuration from the provided arguments.
pub async fn load_aws_config(args: &AwsArgs) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(args.region.clone()));

    if let Some(ref endpoint) = args.endpoint {
        loader = loader.endpoint_url(endpoint);
    }

    loader.load().await
}
