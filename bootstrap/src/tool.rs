use async_trait::async_trait;

/// Local cluster tooling (kubeadm, etcdctl, etcdutl) behind a seam so the
/// flows can be exercised without a real node.
#[async_trait]
pub trait ClusterTool: Send + Sync {
    /// `kubeadm init` with the rendered configuration document.
    async fn init(&self, spec: &InitSpec) -> Result<(), ClusterToolError>;

    /// `kubeadm join` as an additional control plane.
    async fn join(&self, spec: &JoinSpec) -> Result<(), ClusterToolError>;

    /// `kubeadm reset` — clears local cluster state after a failed attempt.
    async fn reset(&self) -> Result<(), ClusterToolError>;

    /// Mint a 24 h join token.
    async fn create_join_token(&self) -> Result<String, ClusterToolError>;

    /// Generate a fresh certificate key.
    async fn certificate_key(&self) -> Result<String, ClusterToolError>;

    /// Re-upload control-plane certs encrypted under `certificate_key`.
    async fn upload_certs(&self, certificate_key: &str) -> Result<(), ClusterToolError>;

    /// CA discovery hash in `sha256:<hex>` form.
    async fn discovery_hash(&self) -> Result<String, ClusterToolError>;

    /// The local node's 64-bit etcd member id.
    async fn local_etcd_member_id(&self, node_name: &str) -> Result<u64, ClusterToolError>;

    /// Offline `etcdutl snapshot restore` into a fresh data directory.
    async fn restore_snapshot(&self, spec: &RestoreSpec) -> Result<(), ClusterToolError>;
}

#[derive(Clone, Debug)]
pub struct InitSpec {
    pub config_yaml: String,
    pub ignore_preflight_errors: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct JoinSpec {
    pub endpoint: String,
    pub token: String,
    pub ca_cert_hash: String,
    pub certificate_key: String,
    pub node_name: String,
}

#[derive(Clone, Debug)]
pub struct RestoreSpec {
    pub snapshot_path: String,
    pub node_name: String,
    pub peer_url: String,
    pub data_dir: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterToolError {
    #[error("{program} exited with status {status:?}: {stderr}")]
    Command {
        program: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("failed to run {program}: {message}")]
    Io { program: String, message: String },

    #[error("unexpected {program} output: {message}")]
    Parse { program: String, message: String },
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    /// Scriptable fake for flow tests. Records every call; join attempts
    /// fail until `join_failures` is exhausted.
    #[derive(Default)]
    pub struct FakeTool {
        pub calls: Mutex<Vec<String>>,
        pub join_failures: AtomicU32,
        pub fail_init: AtomicBool,
        token_serial: AtomicU32,
    }

    impl FakeTool {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_joins(&self, count: u32) {
            self.join_failures.store(count, Ordering::SeqCst);
        }

        pub fn call_log(&self) -> Vec<String> {
            self.calls.lock().expect("call log poisoned").clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().expect("call log poisoned").push(call.into());
        }
    }

    #[async_trait]
    impl ClusterTool for FakeTool {
        async fn init(&self, spec: &InitSpec) -> Result<(), ClusterToolError> {
            self.record(format!(
                "init ignore_preflight={}",
                spec.ignore_preflight_errors.join(",")
            ));
            if self.fail_init.load(Ordering::SeqCst) {
                return Err(ClusterToolError::Command {
                    program: "kubeadm".into(),
                    status: Some(1),
                    stderr: "init failed".into(),
                });
            }
            Ok(())
        }

        async fn join(&self, spec: &JoinSpec) -> Result<(), ClusterToolError> {
            self.record(format!("join token={}", spec.token));
            let remaining = self.join_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.join_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ClusterToolError::Command {
                    program: "kubeadm".into(),
                    status: Some(1),
                    stderr: "could not join: invalid token".into(),
                });
            }
            Ok(())
        }

        async fn reset(&self) -> Result<(), ClusterToolError> {
            self.record("reset");
            Ok(())
        }

        async fn create_join_token(&self) -> Result<String, ClusterToolError> {
            let serial = self.token_serial.fetch_add(1, Ordering::SeqCst);
            self.record("create_join_token");
            Ok(format!("abcdef.token{serial:010}"))
        }

        async fn certificate_key(&self) -> Result<String, ClusterToolError> {
            self.record("certificate_key");
            Ok("a".repeat(64))
        }

        async fn upload_certs(&self, _certificate_key: &str) -> Result<(), ClusterToolError> {
            self.record("upload_certs");
            Ok(())
        }

        async fn discovery_hash(&self) -> Result<String, ClusterToolError> {
            self.record("discovery_hash");
            Ok("sha256:1b2c3d4e5f60718293a4b5c6d7e8f9001b2c3d4e5f60718293a4b5c6d7e8f900".into())
        }

        async fn local_etcd_member_id(&self, _node_name: &str) -> Result<u64, ClusterToolError> {
            self.record("local_etcd_member_id");
            Ok(0x8e9e_05c5_2164_694d)
        }

        async fn restore_snapshot(&self, spec: &RestoreSpec) -> Result<(), ClusterToolError> {
            self.record(format!("restore_snapshot path={}", spec.snapshot_path));
            Ok(())
        }
    }
}
