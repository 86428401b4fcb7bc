//! Rendering of the kubeadm configuration document: an
//! `InitConfiguration` and a `ClusterConfiguration`, emitted as one
//! two-document YAML stream.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Clone, Debug)]
pub struct ClusterSettings {
    pub node_name: String,
    pub advertise_address: String,
    pub control_plane_endpoint: String,
    pub kubernetes_version: String,
    pub pod_subnet: String,
    pub service_subnet: String,
    /// Object-store-hosted discovery endpoint for workload identity
    /// federation.
    pub service_account_issuer: String,
    pub audit_policy_path: String,
    pub audit_log_max_size_mb: u32,
    pub audit_log_max_backups: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitConfiguration {
    api_version: &'static str,
    kind: &'static str,
    #[serde(rename = "localAPIEndpoint")]
    local_api_endpoint: LocalApiEndpoint,
    node_registration: NodeRegistration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalApiEndpoint {
    advertise_address: String,
    bind_port: u16,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeRegistration {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfiguration {
    api_version: &'static str,
    kind: &'static str,
    kubernetes_version: String,
    control_plane_endpoint: String,
    networking: Networking,
    api_server: ApiServer,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Networking {
    pod_subnet: String,
    service_subnet: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiServer {
    extra_args: BTreeMap<&'static str, String>,
}

pub fn render_init_config(settings: &ClusterSettings) -> Result<String, serde_yaml::Error> {
    let init = InitConfiguration {
        api_version: "kubeadm.k8s.io/v1beta3",
        kind: "InitConfiguration",
        local_api_endpoint: LocalApiEndpoint {
            advertise_address: settings.advertise_address.clone(),
            bind_port: 6443,
        },
        node_registration: NodeRegistration {
            name: settings.node_name.clone(),
        },
    };

    let mut extra_args = BTreeMap::new();
    extra_args.insert(
        "service-account-issuer",
        settings.service_account_issuer.clone(),
    );
    extra_args.insert("audit-policy-file", settings.audit_policy_path.clone());
    extra_args.insert(
        "audit-log-path",
        "/var/log/kubernetes/audit.log".to_string(),
    );
    extra_args.insert(
        "audit-log-maxsize",
        settings.audit_log_max_size_mb.to_string(),
    );
    extra_args.insert(
        "audit-log-maxbackup",
        settings.audit_log_max_backups.to_string(),
    );

    let cluster = ClusterConfiguration {
        api_version: "kubeadm.k8s.io/v1beta3",
        kind: "ClusterConfiguration",
        kubernetes_version: settings.kubernetes_version.clone(),
        control_plane_endpoint: settings.control_plane_endpoint.clone(),
        networking: Networking {
            pod_subnet: settings.pod_subnet.clone(),
            service_subnet: settings.service_subnet.clone(),
        },
        api_server: ApiServer { extra_args },
    };

    Ok(format!(
        "{}---\n{}",
        serde_yaml::to_string(&init)?,
        serde_yaml::to_string(&cluster)?
    ))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    fn settings() -> ClusterSettings {
        ClusterSettings {
            node_name: "ip-10-0-1-20".to_string(),
            advertise_address: "10.0.1.20".to_string(),
            control_plane_endpoint: "k8s.internal:6443".to_string(),
            kubernetes_version: "v1.29.4".to_string(),
            pod_subnet: "10.244.0.0/16".to_string(),
            service_subnet: "10.96.0.0/12".to_string(),
            service_account_issuer: "https://oidc-bucket.s3.amazonaws.com/prod".to_string(),
            audit_policy_path: "/etc/kubernetes/audit-policy.yaml".to_string(),
            audit_log_max_size_mb: 100,
            audit_log_max_backups: 5,
        }
    }

    #[test]
    fn renders_two_documents() {
        let rendered = render_init_config(&settings()).unwrap();
        let documents: Vec<serde_yaml::Value> = serde_yaml::Deserializer::from_str(&rendered)
            .map(|doc| serde_yaml::Value::deserialize(doc).unwrap())
            .collect();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0]["kind"], "InitConfiguration");
        assert_eq!(documents[1]["kind"], "ClusterConfiguration");
    }

    #[test]
    fn cluster_document_carries_the_issuer_and_audit_settings() {
        let rendered = render_init_config(&settings()).unwrap();
        let documents: Vec<serde_yaml::Value> = serde_yaml::Deserializer::from_str(&rendered)
            .map(|doc| serde_yaml::Value::deserialize(doc).unwrap())
            .collect();
        let cluster = &documents[1];
        assert_eq!(cluster["controlPlaneEndpoint"], "k8s.internal:6443");
        assert_eq!(cluster["networking"]["podSubnet"], "10.244.0.0/16");
        assert_eq!(
            cluster["apiServer"]["extraArgs"]["service-account-issuer"],
            "https://oidc-bucket.s3.amazonaws.com/prod"
        );
        assert_eq!(cluster["apiServer"]["extraArgs"]["audit-log-maxsize"], "100");
    }

    #[test]
    fn init_document_names_the_node() {
        let rendered = render_init_config(&settings()).unwrap();
        let init: serde_yaml::Value = serde_yaml::Deserializer::from_str(&rendered)
            .next()
            .map(|doc| serde_yaml::Value::deserialize(doc).unwrap())
            .unwrap();
        assert_eq!(init["nodeRegistration"]["name"], "ip-10-0-1-20");
        assert_eq!(init["localAPIEndpoint"]["advertiseAddress"], "10.0.1.20");
    }
}
