use std::fmt::Display;
use std::time::Duration;

use coxswain_common::retry::Retriable;

use crate::exec::CommandStatus;

/// Errors from the durable stores (lock table, parameter registry, snapshot
/// store, fleet APIs).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{operation}: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },

    #[error("malformed record: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn api(operation: &'static str, err: impl Display) -> Self {
        Self::Api {
            operation,
            message: err.to_string(),
        }
    }
}

impl Retriable for StoreError {
    fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Api { .. })
    }
}

/// stderr fragments that mark an explicit remote failure as transient anyway.
const TRANSIENT_MARKERS: &[&str] = &[
    "ThrottlingException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "connection refused",
    "connection timed out",
];

/// Errors from remote command execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The command reached a terminal non-success state on the target.
    #[error("remote command {status:?}: {stderr}")]
    Failed {
        status: CommandStatus,
        stdout: String,
        stderr: String,
    },

    /// The local polling ceiling elapsed before the command reached a
    /// terminal state.
    #[error("remote command still running after {elapsed:?}")]
    Deadline { elapsed: Duration },

    /// The invocation was cancelled locally (shutdown or budget).
    #[error("remote command interrupted")]
    Interrupted,

    #[error("{operation}: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
}

impl ExecError {
    pub fn api(operation: &'static str, err: impl Display) -> Self {
        Self::Api {
            operation,
            message: err.to_string(),
        }
    }
}

impl Retriable for ExecError {
    fn is_retriable(&self) -> bool {
        match self {
            ExecError::Failed { status: CommandStatus::TimedOut, .. } => true,
            ExecError::Failed { stderr, .. } => {
                TRANSIENT_MARKERS.iter().any(|marker| stderr.contains(marker))
            }
            ExecError::Deadline { .. } => true,
            ExecError::Interrupted => false,
            ExecError::Api { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(status: CommandStatus, stderr: &str) -> ExecError {
        ExecError::Failed {
            status,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn timed_out_is_retriable() {
        assert!(failed(CommandStatus::TimedOut, "").is_retriable());
    }

    #[test]
    fn explicit_failure_is_not_retriable() {
        assert!(!failed(CommandStatus::Failed, "exit status 1").is_retriable());
        assert!(!failed(CommandStatus::Cancelled, "").is_retriable());
    }

    #[test]
    fn transient_marker_overrides_explicit_failure() {
        assert!(failed(CommandStatus::Failed, "ThrottlingException: slow down").is_retriable());
    }

    #[test]
    fn interruption_is_fatal() {
        assert!(!ExecError::Interrupted.is_retriable());
    }
}
