//! Curated remote-script bodies, parameterized by typed request structs.
//!
//! Every interpolated value passes an allowlist check first; the builders
//! never splice untrusted text into shell. Scripts report through a single
//! `COXSWAIN_RESULT {json}` trailer line that callers parse typed.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::params::Param;

pub const RESULT_MARKER: &str = "COXSWAIN_RESULT ";

const ETCDCTL: &str = "ETCDCTL_API=3 etcdctl \
--endpoints=https://127.0.0.1:2379 \
--cacert=/etc/kubernetes/pki/etcd/ca.crt \
--cert=/etc/kubernetes/pki/etcd/server.crt \
--key=/etc/kubernetes/pki/etcd/server.key";

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("unsafe value for {field}: {value:?}")]
    UnsafeValue { field: &'static str, value: String },

    #[error("remote output carried no result line")]
    MissingReport,

    #[error("malformed result line: {0}")]
    MalformedReport(String),
}

fn ensure_safe(field: &'static str, value: &str) -> Result<(), ScriptError> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'));
    if ok {
        Ok(())
    } else {
        Err(ScriptError::UnsafeValue {
            field,
            value: value.to_string(),
        })
    }
}

/// Extract and deserialize the result trailer from remote stdout.
pub fn parse_report<T: DeserializeOwned>(stdout: &str) -> Result<T, ScriptError> {
    let line = stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(RESULT_MARKER))
        .ok_or(ScriptError::MissingReport)?;
    serde_json::from_str(line).map_err(|err| ScriptError::MalformedReport(err.to_string()))
}

/// Cordon and evict a node ahead of etcd member removal. A node already
/// absent from the cluster reports success with `node_absent`.
#[derive(Clone, Copy, Debug)]
pub struct DrainNode<'a> {
    pub node_name: &'a str,
    pub grace_period_secs: u32,
    pub timeout_secs: u32,
}

impl<'a> DrainNode<'a> {
    pub fn new(node_name: &'a str) -> Self {
        Self {
            node_name,
            grace_period_secs: 30,
            timeout_secs: 90,
        }
    }

    pub fn render(&self) -> Result<String, ScriptError> {
        ensure_safe("node_name", self.node_name)?;
        Ok(format!(
            r#"set -euo pipefail
export KUBECONFIG=/etc/kubernetes/admin.conf
if ! kubectl get node {node} >/dev/null 2>&1; then
  echo '{marker}{{"drained":false,"node_absent":true}}'
  exit 0
fi
kubectl cordon {node}
kubectl drain {node} --ignore-daemonsets --delete-emptydir-data --force \
  --grace-period={grace} --timeout={timeout}s
echo '{marker}{{"drained":true,"node_absent":false}}'
"#,
            node = self.node_name,
            grace = self.grace_period_secs,
            timeout = self.timeout_secs,
            marker = RESULT_MARKER,
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct DrainReport {
    pub drained: bool,
    pub node_absent: bool,
}

/// Remove an etcd member by its hex id, on a healthy peer. A member no
/// longer listed reports success with `member_absent`.
#[derive(Clone, Copy, Debug)]
pub struct RemoveEtcdMember<'a> {
    pub member_id: &'a str,
}

impl RemoveEtcdMember<'_> {
    pub fn render(&self) -> Result<String, ScriptError> {
        ensure_safe("member_id", self.member_id)?;
        Ok(format!(
            r#"set -euo pipefail
{etcdctl} endpoint health
if ! {etcdctl} member list | grep -q '^{member_id},'; then
  echo '{marker}{{"removed":false,"member_absent":true}}'
  exit 0
fi
{etcdctl} member remove {member_id}
echo '{marker}{{"removed":true,"member_absent":false}}'
"#,
            etcdctl = ETCDCTL,
            member_id = self.member_id,
            marker = RESULT_MARKER,
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct RemovalReport {
    pub removed: bool,
    pub member_absent: bool,
}

/// Snapshot etcd, verify integrity, upload with metadata, clean up. The
/// integrity gate runs before the upload: a zero or missing hash aborts the
/// script non-zero and nothing reaches the bucket.
#[derive(Clone, Copy, Debug)]
pub struct EtcdBackup<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub local_path: &'a str,
}

impl EtcdBackup<'_> {
    pub fn render(&self) -> Result<String, ScriptError> {
        ensure_safe("bucket", self.bucket)?;
        ensure_safe("key", self.key)?;
        ensure_safe("local_path", self.local_path)?;
        Ok(format!(
            r#"set -euo pipefail
SNAPSHOT={local_path}
{etcdctl} endpoint health
{etcdctl} snapshot save "$SNAPSHOT"
STATUS=$(etcdutl snapshot status "$SNAPSHOT" -w json)
HASH=$(printf '%s' "$STATUS" | grep -o '"hash":[0-9]*' | head -1 | cut -d: -f2)
REVISION=$(printf '%s' "$STATUS" | grep -o '"revision":[0-9]*' | head -1 | cut -d: -f2)
SIZE=$(printf '%s' "$STATUS" | grep -o '"totalSize":[0-9]*' | head -1 | cut -d: -f2)
if [ -z "$HASH" ] || [ "$HASH" = "0" ]; then
  echo "snapshot integrity check failed: hash=${{HASH:-empty}}" >&2
  rm -f "$SNAPSHOT"
  exit 1
fi
aws s3 cp "$SNAPSHOT" s3://{bucket}/{key} --metadata hash=$HASH,revision=$REVISION,size=$SIZE
rm -f "$SNAPSHOT"
echo "{marker}{{\"hash\":$HASH,\"revision\":$REVISION,\"size\":$SIZE,\"key\":\"{key}\"}}"
"#,
            etcdctl = ETCDCTL,
            local_path = self.local_path,
            bucket = self.bucket,
            key = self.key,
            marker = RESULT_MARKER,
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct BackupReport {
    pub hash: u64,
    pub revision: i64,
    pub size: i64,
    pub key: String,
}

/// Mint a fresh join token and certificate key on a control-plane peer and
/// publish them to the parameter registry. Serializes on `token-gen-lock`
/// locally: the conditional insert rejects a second generator, and the trap
/// releases the row on every exit path.
#[derive(Clone, Copy, Debug)]
pub struct GenerateJoinCredentials<'a> {
    pub cluster: &'a str,
    pub table: &'a str,
    pub region: &'a str,
}

impl GenerateJoinCredentials<'_> {
    pub fn render(&self) -> Result<String, ScriptError> {
        ensure_safe("cluster", self.cluster)?;
        ensure_safe("table", self.table)?;
        ensure_safe("region", self.region)?;
        Ok(format!(
            r#"set -euo pipefail
LOCK_KEY='{{"ClusterId":{{"S":"{cluster}"}},"MemberId":{{"S":"token-gen-lock"}}}}'
NOW=$(date -u +%Y-%m-%dT%H:%M:%SZ)
ITEM='{{"ClusterId":{{"S":"{cluster}"}},"MemberId":{{"S":"token-gen-lock"}},"InstanceId":{{"S":"'"$(hostname)"'"}},"Status":{{"S":"HELD"}},"CreatedAt":{{"S":"'"$NOW"'"}}}}'
if ! aws dynamodb put-item --region {region} --table-name {table} --item "$ITEM" \
    --condition-expression 'attribute_not_exists(MemberId)' >/dev/null 2>&1; then
  echo 'another credential generation holds token-gen-lock' >&2
  exit 1
fi
trap 'aws dynamodb delete-item --region {region} --table-name {table} --key "$LOCK_KEY" >/dev/null' EXIT
export KUBECONFIG=/etc/kubernetes/admin.conf
TOKEN=$(kubeadm token create --ttl 24h0m0s)
CERT_KEY=$(kubeadm certs certificate-key)
kubeadm init phase upload-certs --upload-certs --certificate-key "$CERT_KEY" >/dev/null
STAMP=$(date -u +%Y-%m-%dT%H:%M:%SZ)
aws ssm put-parameter --region {region} --name {token_path} --type SecureString --value "$TOKEN" --overwrite >/dev/null
aws ssm put-parameter --region {region} --name {token_updated_path} --type String --value "$STAMP" --overwrite >/dev/null
aws ssm put-parameter --region {region} --name {cert_key_path} --type SecureString --value "$CERT_KEY" --overwrite >/dev/null
aws ssm put-parameter --region {region} --name {cert_key_updated_path} --type String --value "$STAMP" --overwrite >/dev/null
echo '{marker}{{"generated":true}}'
"#,
            cluster = self.cluster,
            table = self.table,
            region = self.region,
            token_path = Param::JoinToken.path(self.cluster),
            token_updated_path = Param::JoinTokenUpdated.path(self.cluster),
            cert_key_path = Param::CertificateKey.path(self.cluster),
            cert_key_updated_path = Param::CertificateKeyUpdated.path(self.cluster),
            marker = RESULT_MARKER,
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct CredentialReport {
    pub generated: bool,
}
