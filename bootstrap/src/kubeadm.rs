use async_trait::async_trait;
use tokio::process::Command;

use crate::tool::{ClusterTool, ClusterToolError, InitSpec, JoinSpec, RestoreSpec};

const KUBEADM_CONFIG_PATH: &str = "/etc/kubernetes/coxswain-init.yaml";

const ETCDCTL_ARGS: &[&str] = &[
    "--endpoints=https://127.0.0.1:2379",
    "--cacert=/etc/kubernetes/pki/etcd/ca.crt",
    "--cert=/etc/kubernetes/pki/etcd/server.crt",
    "--key=/etc/kubernetes/pki/etcd/server.key",
];

/// The CA discovery hash is the SHA-256 of the CA public key in DER form,
/// the same value `kubeadm token create --print-join-command` embeds.
const DISCOVERY_HASH_PIPELINE: &str = "openssl x509 -pubkey -in /etc/kubernetes/pki/ca.crt \
| openssl pkey -pubin -outform der \
| openssl dgst -sha256 -hex \
| awk '{print $NF}'";

/// [`ClusterTool`] over the node-local kubeadm/etcdctl/etcdutl binaries.
pub struct KubeadmCli;

impl KubeadmCli {
    pub fn new() -> Self {
        Self
    }
}

impl Default for KubeadmCli {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_command(program: &str, args: &[&str]) -> Result<String, ClusterToolError> {
    tracing::debug!(program, ?args, "running local command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|err| ClusterToolError::Io {
            program: program.to_string(),
            message: err.to_string(),
        })?;

    if !output.status.success() {
        return Err(ClusterToolError::Command {
            program: program.to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn run_shell(script: &str) -> Result<String, ClusterToolError> {
    run_command("sh", &["-c", script]).await
}

#[async_trait]
impl ClusterTool for KubeadmCli {
    async fn init(&self, spec: &InitSpec) -> Result<(), ClusterToolError> {
        tokio::fs::write(KUBEADM_CONFIG_PATH, &spec.config_yaml)
            .await
            .map_err(|err| ClusterToolError::Io {
                program: "kubeadm".to_string(),
                message: format!("writing {KUBEADM_CONFIG_PATH}: {err}"),
            })?;

        let mut args = vec!["init", "--config", KUBEADM_CONFIG_PATH, "--upload-certs"];
        let ignore;
        if !spec.ignore_preflight_errors.is_empty() {
            ignore = format!(
                "--ignore-preflight-errors={}",
                spec.ignore_preflight_errors.join(",")
            );
            args.push(&ignore);
        }
        run_command("kubeadm", &args).await?;
        Ok(())
    }

    async fn join(&self, spec: &JoinSpec) -> Result<(), ClusterToolError> {
        run_command(
            "kubeadm",
            &[
                "join",
                &spec.endpoint,
                "--token",
                &spec.token,
                "--discovery-token-ca-cert-hash",
                &spec.ca_cert_hash,
                "--control-plane",
                "--certificate-key",
                &spec.certificate_key,
                "--node-name",
                &spec.node_name,
            ],
        )
        .await?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), ClusterToolError> {
        run_command("kubeadm", &["reset", "--force"]).await?;
        Ok(())
    }

    async fn create_join_token(&self) -> Result<String, ClusterToolError> {
        let stdout = run_command("kubeadm", &["token", "create", "--ttl", "24h0m0s"]).await?;
        let token = stdout.trim();
        if token.is_empty() {
            return Err(ClusterToolError::Parse {
                program: "kubeadm".to_string(),
                message: "token create printed nothing".to_string(),
            });
        }
        Ok(token.to_string())
    }

    async fn certificate_key(&self) -> Result<String, ClusterToolError> {
        let stdout = run_command("kubeadm", &["certs", "certificate-key"]).await?;
        Ok(stdout.trim().to_string())
    }

    async fn upload_certs(&self, certificate_key: &str) -> Result<(), ClusterToolError> {
        run_command(
            "kubeadm",
            &[
                "init",
                "phase",
                "upload-certs",
                "--upload-certs",
                "--certificate-key",
                certificate_key,
            ],
        )
        .await?;
        Ok(())
    }

    async fn discovery_hash(&self) -> Result<String, ClusterToolError> {
        let stdout = run_shell(DISCOVERY_HASH_PIPELINE).await?;
        let digest = stdout.trim();
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ClusterToolError::Parse {
                program: "openssl".to_string(),
                message: format!("unexpected digest {digest:?}"),
            });
        }
        Ok(format!("sha256:{digest}"))
    }

    async fn local_etcd_member_id(&self, node_name: &str) -> Result<u64, ClusterToolError> {
        let mut args = vec!["member", "list", "-w", "json"];
        args.extend_from_slice(ETCDCTL_ARGS);
        let stdout = run_command("etcdctl", &args).await?;

        let parsed: serde_json::Value =
            serde_json::from_str(&stdout).map_err(|err| ClusterToolError::Parse {
                program: "etcdctl".to_string(),
                message: err.to_string(),
            })?;

        parsed["members"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|member| member["name"].as_str() == Some(node_name))
            .and_then(|member| member["ID"].as_u64())
            .ok_or_else(|| ClusterToolError::Parse {
                program: "etcdctl".to_string(),
                message: format!("no member named {node_name}"),
            })
    }

    async fn restore_snapshot(&self, spec: &RestoreSpec) -> Result<(), ClusterToolError> {
        let initial_cluster = format!("{}={}", spec.node_name, spec.peer_url);
        run_command(
            "etcdutl",
            &[
                "snapshot",
                "restore",
                &spec.snapshot_path,
                "--name",
                &spec.node_name,
                "--initial-cluster",
                &initial_cluster,
                "--initial-advertise-peer-urls",
                &spec.peer_url,
                "--data-dir",
                &spec.data_dir,
            ],
        )
        .await?;
        Ok(())
    }
}
