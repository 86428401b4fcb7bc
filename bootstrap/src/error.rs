use std::time::Duration;

use coxswain_cloud::error::{ExecError, StoreError};
use coxswain_cloud::scripts::ScriptError;
use coxswain_common::retry::RetryError;

use crate::tool::ClusterToolError;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Lost the election but the initializer never flipped the flag.
    #[error("cluster initialization did not complete within {0:?}")]
    InitializationTimeout(Duration),

    /// A joiner found a required parameter missing or still a placeholder.
    #[error("required parameter {0} is uninitialized")]
    ParameterUninitialized(String),

    #[error("no healthy peer available for {operation}")]
    NoPeer { operation: &'static str },

    #[error("join failed after a credential refresh: {0}")]
    JoinFailed(#[source] ClusterToolError),

    #[error("credential generation failed: {0}")]
    CredentialGeneration(#[source] RetryError<ExecError>),

    #[error(transparent)]
    Tool(#[from] ClusterToolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("failed to render kubeadm config: {0}")]
    Render(#[from] serde_yaml::Error),

    #[error("bootstrap interrupted by shutdown")]
    Interrupted,
}
