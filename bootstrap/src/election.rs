use std::time::Duration;

use chrono::Utc;
use coxswain_cloud::locks::{LockAttempt, LockName};
use coxswain_cloud::params::{self, Param};
use tokio_util::sync::CancellationToken;

use crate::error::BootstrapError;
use crate::run::{BootstrapDeps, BootstrapParams};
use crate::stage::{CleanupAction, CleanupStack, Stage};

#[derive(Clone, Copy, Debug)]
pub struct ElectionConfig {
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initializer,
    Joiner,
}

/// First-node election. The conditional insert on `cluster-init` makes
/// exactly one concurrent boot the initializer; everyone else waits for the
/// initialized flag and joins.
pub async fn elect(
    deps: &BootstrapDeps<'_>,
    params: &BootstrapParams,
    stack: &mut CleanupStack,
    config: &ElectionConfig,
    cancel: &CancellationToken,
) -> Result<Role, BootstrapError> {
    if params::get_bool(deps.registry, Param::Initialized).await? {
        return Ok(Role::Joiner);
    }

    stack.enter(Stage::AcquiringLock);
    match deps
        .locks
        .try_acquire(LockName::ClusterInit, &params.instance_id, Utc::now())
        .await?
    {
        LockAttempt::Acquired => {
            tracing::info!(instance_id = %params.instance_id, "won the init election");
            stack.push(CleanupAction::ReleaseLock(LockName::ClusterInit));
            Ok(Role::Initializer)
        }
        LockAttempt::HeldBy(holder) => {
            tracing::info!(
                holder = holder.as_ref().map(|h| h.holder.as_str()).unwrap_or("unknown"),
                "init lock held; waiting for cluster initialization"
            );
            wait_for_initialized(deps, config, cancel).await?;
            Ok(Role::Joiner)
        }
    }
}

async fn wait_for_initialized(
    deps: &BootstrapDeps<'_>,
    config: &ElectionConfig,
    cancel: &CancellationToken,
) -> Result<(), BootstrapError> {
    let deadline = tokio::time::Instant::now() + config.wait_timeout;
    loop {
        if params::get_bool(deps.registry, Param::Initialized).await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(BootstrapError::InitializationTimeout(config.wait_timeout));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(BootstrapError::Interrupted),
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
}
