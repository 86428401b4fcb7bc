use async_trait::async_trait;
use aws_sdk_ssm::Client;
use aws_sdk_ssm::types::ParameterType;
use chrono::{DateTime, Utc};
use coxswain_common::timefmt;

use crate::error::StoreError;

/// Durable cluster parameters. Path shape is stable:
/// `/<cluster>/cluster/...`, `/<cluster>/health/...`, etc.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Param {
    Initialized,
    Endpoint,
    JoinToken,
    JoinTokenUpdated,
    CaCertHash,
    CertificateKey,
    CertificateKeyUpdated,
    RestoreMode,
    RestoreBackup,
    RestoreTriggeredAt,
    FailureCount,
    KubernetesVersion,
    OidcIssuer,
}

impl Param {
    fn suffix(self) -> &'static str {
        match self {
            Param::Initialized => "cluster/initialized",
            Param::Endpoint => "cluster/endpoint",
            Param::JoinToken => "cluster/join-token",
            Param::JoinTokenUpdated => "cluster/join-token-updated",
            Param::CaCertHash => "cluster/ca-cert-hash",
            Param::CertificateKey => "cluster/certificate-key",
            Param::CertificateKeyUpdated => "cluster/certificate-key-updated",
            Param::RestoreMode => "cluster/restore-mode",
            Param::RestoreBackup => "cluster/restore-backup",
            Param::RestoreTriggeredAt => "cluster/restore-triggered-at",
            Param::FailureCount => "health/failure-count",
            Param::KubernetesVersion => "kubernetes/version",
            Param::OidcIssuer => "oidc/issuer",
        }
    }

    pub fn path(self, cluster: &str) -> String {
        format!("/{cluster}/{}", self.suffix())
    }

    /// Tokens and certificate keys are stored encrypted.
    pub fn is_secret(self) -> bool {
        matches!(self, Param::JoinToken | Param::CertificateKey)
    }
}

/// Provisioning writes these placeholders before the first node boots; any
/// parameter still carrying one is treated as absent.
pub const UNINITIALIZED_MARKERS: [&str; 2] = ["PENDING_INITIALIZATION", "placeholder"];

pub fn is_uninitialized(value: &str) -> bool {
    UNINITIALIZED_MARKERS.contains(&value)
}

#[async_trait]
pub trait ParameterRegistry: Send + Sync {
    async fn get(&self, param: Param) -> Result<Option<String>, StoreError>;

    /// Last-writer-wins write; String or SecureString chosen by the key.
    async fn put(&self, param: Param, value: &str) -> Result<(), StoreError>;
}

/// `None` when the parameter is missing or still a provisioning placeholder.
pub async fn get_initialized_value(
    registry: &dyn ParameterRegistry,
    param: Param,
) -> Result<Option<String>, StoreError> {
    Ok(registry
        .get(param)
        .await?
        .filter(|value| !is_uninitialized(value)))
}

pub async fn get_bool(registry: &dyn ParameterRegistry, param: Param) -> Result<bool, StoreError> {
    Ok(matches!(registry.get(param).await?.as_deref(), Some("true")))
}

pub async fn put_bool(
    registry: &dyn ParameterRegistry,
    param: Param,
    value: bool,
) -> Result<(), StoreError> {
    registry.put(param, if value { "true" } else { "false" }).await
}

/// `None` when missing, placeholder, or unparsable; callers treat all three
/// as "stale, refresh required".
pub async fn get_timestamp(
    registry: &dyn ParameterRegistry,
    param: Param,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    Ok(get_initialized_value(registry, param)
        .await?
        .and_then(|value| timefmt::parse_utc(&value).ok()))
}

pub async fn put_timestamp(
    registry: &dyn ParameterRegistry,
    param: Param,
    when: DateTime<Utc>,
) -> Result<(), StoreError> {
    registry.put(param, &timefmt::format_utc(when)).await
}

pub async fn get_u64(
    registry: &dyn ParameterRegistry,
    param: Param,
) -> Result<u64, StoreError> {
    Ok(registry
        .get(param)
        .await?
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0))
}

pub struct SsmParameterRegistry {
    client: Client,
    cluster: String,
}

impl SsmParameterRegistry {
    pub fn new(client: Client, cluster: impl Into<String>) -> Self {
        Self {
            client,
            cluster: cluster.into(),
        }
    }
}

#[async_trait]
impl ParameterRegistry for SsmParameterRegistry {
    async fn get(&self, param: Param) -> Result<Option<String>, StoreError> {
        let result = self
            .client
            .get_parameter()
            .name(param.path(&self.cluster))
            .with_decryption(true)
            .send()
            .await;

        match result {
            Ok(output) => Ok(output
                .parameter()
                .and_then(|parameter| parameter.value())
                .map(|value| value.to_string())),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_parameter_not_found() {
                    Ok(None)
                } else {
                    Err(StoreError::api("ssm get-parameter", service))
                }
            }
        }
    }

    async fn put(&self, param: Param, value: &str) -> Result<(), StoreError> {
        let kind = if param.is_secret() {
            ParameterType::SecureString
        } else {
            ParameterType::String
        };
        self.client
            .put_parameter()
            .name(param.path(&self.cluster))
            .value(value)
            .r#type(kind)
            .overwrite(true)
            .send()
            .await
            .map_err(|err| StoreError::api("ssm put-parameter", err))?;
        Ok(())
    }
}
