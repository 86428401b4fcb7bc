use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_ssm::Client;
use aws_sdk_ssm::types::CommandInvocationStatus;
use coxswain_common::OpContext;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;

/// Wall-clock ceilings for remote commands; the polling driver adds a grace
/// window on top before declaring the command lost.
pub fn etcd_command_timeout() -> Duration {
    Duration::from_secs(60)
}

pub fn drain_command_timeout() -> Duration {
    Duration::from_secs(120)
}

pub fn backup_command_timeout() -> Duration {
    Duration::from_secs(120)
}

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Grace past the remote timeout before the driver gives up: a quarter of
/// the timeout, clamped to 10..=30 s.
pub fn poll_grace(timeout: Duration) -> Duration {
    (timeout / 4).clamp(Duration::from_secs(10), Duration::from_secs(30))
}

#[derive(Clone, Debug)]
pub struct CommandRequest {
    pub instance_id: String,
    pub script: String,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct CommandHandle {
    pub command_id: String,
    pub instance_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Clone, Debug)]
pub struct CommandResult {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub enum CommandPoll {
    Pending,
    Done(CommandResult),
}

/// Fire-and-poll remote command execution. The adapter never retries;
/// retry policy lives in callers.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn send(
        &self,
        ctx: &OpContext,
        request: &CommandRequest,
    ) -> Result<CommandHandle, ExecError>;

    /// A just-sent invocation may not be visible yet; that is `Pending`,
    /// never an error.
    async fn poll(&self, handle: &CommandHandle) -> Result<CommandPoll, ExecError>;
}

/// Drive one command to a terminal state, polling at [`POLL_INTERVAL`].
/// Success returns the result; any terminal non-success becomes an
/// [`ExecError::Failed`] carrying the remote status and output.
pub async fn run(
    exec: &dyn RemoteExec,
    ctx: &OpContext,
    request: &CommandRequest,
    cancel: &CancellationToken,
) -> Result<CommandResult, ExecError> {
    let handle = exec.send(ctx, request).await?;
    tracing::debug!(
        command_id = %handle.command_id,
        instance_id = %handle.instance_id,
        timeout_secs = request.timeout.as_secs(),
        "remote command sent"
    );

    let started = tokio::time::Instant::now();
    let deadline = started + request.timeout + poll_grace(request.timeout);
    loop {
        if let CommandPoll::Done(result) = exec.poll(&handle).await? {
            return match result.status {
                CommandStatus::Success => Ok(result),
                status => Err(ExecError::Failed {
                    status,
                    stdout: result.stdout,
                    stderr: result.stderr,
                }),
            };
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ExecError::Deadline {
                elapsed: started.elapsed(),
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(ExecError::Interrupted),
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

pub struct SsmRemoteExec {
    client: Client,
}

impl SsmRemoteExec {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteExec for SsmRemoteExec {
    async fn send(
        &self,
        ctx: &OpContext,
        request: &CommandRequest,
    ) -> Result<CommandHandle, ExecError> {
        let output = self
            .client
            .send_command()
            .instance_ids(&request.instance_id)
            .document_name("AWS-RunShellScript")
            .comment(format!("coxswain trace {}", ctx.trace_id))
            .parameters("commands", vec![request.script.clone()])
            .parameters(
                "executionTimeout",
                vec![request.timeout.as_secs().to_string()],
            )
            .send()
            .await
            .map_err(|err| ExecError::api("ssm send-command", err))?;

        let command_id = output
            .command()
            .and_then(|command| command.command_id())
            .ok_or_else(|| ExecError::api("ssm send-command", "response missing command id"))?
            .to_string();

        Ok(CommandHandle {
            command_id,
            instance_id: request.instance_id.clone(),
        })
    }

    async fn poll(&self, handle: &CommandHandle) -> Result<CommandPoll, ExecError> {
        let result = self
            .client
            .get_command_invocation()
            .command_id(&handle.command_id)
            .instance_id(&handle.instance_id)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let service = err.into_service_error();
                // The invocation record lags the send by a few seconds.
                if service.is_invocation_does_not_exist() {
                    return Ok(CommandPoll::Pending);
                }
                return Err(ExecError::api("ssm get-command-invocation", service));
            }
        };

        let status = match output.status() {
            Some(CommandInvocationStatus::Pending) | Some(CommandInvocationStatus::Delayed) => {
                return Ok(CommandPoll::Pending);
            }
            Some(CommandInvocationStatus::InProgress) => return Ok(CommandPoll::Pending),
            Some(CommandInvocationStatus::Success) => CommandStatus::Success,
            Some(CommandInvocationStatus::Cancelled)
            | Some(CommandInvocationStatus::Cancelling) => CommandStatus::Cancelled,
            Some(CommandInvocationStatus::TimedOut) => CommandStatus::TimedOut,
            Some(CommandInvocationStatus::Failed) => CommandStatus::Failed,
            _ => return Ok(CommandPoll::Pending),
        };

        Ok(CommandPoll::Done(CommandResult {
            status,
            stdout: output
                .standard_output_content()
                .unwrap_or_default()
                .to_string(),
            stderr: output
                .standard_error_content()
                .unwrap_or_default()
                .to_string(),
        }))
    }
}
