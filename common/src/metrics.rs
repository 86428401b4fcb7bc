use std::sync::Mutex;

use chrono::Utc;
use serde_json::{Map, Value, json};

/// Metric namespaces. Cluster-scoped metrics use [`cluster_namespace`];
/// the event handlers emit under fixed per-subsystem namespaces.
pub const LIFECYCLE_NAMESPACE: &str = "K8sCluster/EtcdLifecycle";
pub const BACKUP_NAMESPACE: &str = "K8sCluster/EtcdBackup";
pub const HEALTH_NAMESPACE: &str = "K8sCluster/Health";

pub fn cluster_namespace(cluster_name: &str) -> String {
    format!("K8sCluster/{cluster_name}")
}

/// Canonical metric names.
pub mod names {
    pub const BOOTSTRAP_SUCCESS: &str = "BootstrapSuccess";
    pub const BOOTSTRAP_FAILURE: &str = "BootstrapFailure";
    pub const BOOTSTRAP_DURATION: &str = "BootstrapDuration";
    pub const ETCD_MEMBER_REMOVAL_SUCCESS: &str = "EtcdMemberRemovalSuccess";
    pub const ETCD_MEMBER_REMOVAL_FAILURE: &str = "EtcdMemberRemovalFailure";
    pub const NODE_DRAIN_SUCCESS: &str = "NodeDrainSuccess";
    pub const NODE_DRAIN_FAILURE: &str = "NodeDrainFailure";
    pub const QUORUM_RISK_DETECTED: &str = "QuorumRiskDetected";
    pub const LIFECYCLE_HANDLER_DURATION: &str = "LifecycleHandlerDuration";
    pub const BACKUP_SUCCESS: &str = "BackupSuccess";
    pub const BACKUP_FAILURE: &str = "BackupFailure";
    pub const BACKUP_DURATION: &str = "BackupDuration";
    pub const BACKUP_SIZE_BYTES: &str = "BackupSizeBytes";
    pub const HEALTHY_CONTROL_PLANE_INSTANCES: &str = "HealthyControlPlaneInstances";
    pub const CONSECUTIVE_HEALTH_FAILURES: &str = "ConsecutiveHealthFailures";
    pub const AUTO_RECOVERY_TRIGGERED: &str = "AutoRecoveryTriggered";
    pub const CLUSTER_RECOVERED: &str = "ClusterRecovered";
    pub const RETRY_ATTEMPT: &str = "RetryAttempt";
    pub const RETRY_EXHAUSTED: &str = "RetryExhausted";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unit {
    Count,
    Milliseconds,
    Seconds,
    Bytes,
    None,
}

impl Unit {
    pub fn as_str(self) -> &'static str {
        match self {
            Unit::Count => "Count",
            Unit::Milliseconds => "Milliseconds",
            Unit::Seconds => "Seconds",
            Unit::Bytes => "Bytes",
            Unit::None => "None",
        }
    }
}

/// Capability interface for metric emission. Handlers receive a sink, buffer
/// data points through it, and flush once per invocation.
pub trait MetricSink: Send + Sync {
    fn put_metric(&self, name: &str, value: f64, unit: Unit);
    fn flush(&self);
}

#[derive(Debug)]
struct Datum {
    name: String,
    value: f64,
    unit: Unit,
}

/// Buffered embedded-metric-format sink: `flush` writes one EMF JSON line to
/// stdout carrying every buffered data point plus the sink's dimensions.
pub struct EmfSink {
    namespace: String,
    dimensions: Vec<(String, String)>,
    buffer: Mutex<Vec<Datum>>,
}

impl EmfSink {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            dimensions: Vec::new(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.push((key.into(), value.into()));
        self
    }

    fn render(&self, data: &[Datum]) -> Value {
        let metrics: Vec<Value> = data
            .iter()
            .map(|d| json!({"Name": d.name, "Unit": d.unit.as_str()}))
            .collect();
        let dim_keys: Vec<&str> = self.dimensions.iter().map(|(k, _)| k.as_str()).collect();

        let mut doc = Map::new();
        doc.insert(
            "_aws".into(),
            json!({
                "Timestamp": Utc::now().timestamp_millis(),
                "CloudWatchMetrics": [{
                    "Namespace": self.namespace,
                    "Dimensions": [dim_keys],
                    "Metrics": metrics,
                }],
            }),
        );
        for (key, value) in &self.dimensions {
            doc.insert(key.clone(), Value::String(value.clone()));
        }
        for d in data {
            doc.insert(d.name.clone(), json!(d.value));
        }
        Value::Object(doc)
    }
}

impl MetricSink for EmfSink {
    fn put_metric(&self, name: &str, value: f64, unit: Unit) {
        self.buffer.lock().expect("metric buffer poisoned").push(Datum {
            name: name.to_string(),
            value,
            unit,
        });
    }

    fn flush(&self) {
        let data: Vec<Datum> = {
            let mut buffer = self.buffer.lock().expect("metric buffer poisoned");
            buffer.drain(..).collect()
        };
        if data.is_empty() {
            return;
        }
        println!("{}", self.render(&data));
    }
}

impl Drop for EmfSink {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Sink that discards everything.
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn put_metric(&self, _name: &str, _value: f64, _unit: Unit) {}
    fn flush(&self) {}
}

/// Sink that records data points for assertions in tests.
#[derive(Default)]
pub struct CollectingSink {
    data: Mutex<Vec<(String, f64, Unit)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self, name: &str) -> Vec<f64> {
        self.data
            .lock()
            .expect("metric buffer poisoned")
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, v, _)| *v)
            .collect()
    }

    pub fn total(&self, name: &str) -> f64 {
        self.values(name).iter().sum()
    }
}

impl MetricSink for CollectingSink {
    fn put_metric(&self, name: &str, value: f64, unit: Unit) {
        self.data
            .lock()
            .expect("metric buffer poisoned")
            .push((name.to_string(), value, unit));
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emf_document_carries_dimensions_and_values() {
        let sink = EmfSink::new(LIFECYCLE_NAMESPACE)
            .with_dimension("ClusterName", "prod")
            .with_dimension("InstanceId", "i-0123");
        sink.put_metric(names::NODE_DRAIN_SUCCESS, 1.0, Unit::Count);
        sink.put_metric(names::LIFECYCLE_HANDLER_DURATION, 412.0, Unit::Milliseconds);

        let data = sink.buffer.lock().unwrap();
        let doc = sink.render(&data);

        assert_eq!(doc["ClusterName"], "prod");
        assert_eq!(doc["InstanceId"], "i-0123");
        assert_eq!(doc["NodeDrainSuccess"], 1.0);
        assert_eq!(doc["LifecycleHandlerDuration"], 412.0);

        let spec = &doc["_aws"]["CloudWatchMetrics"][0];
        assert_eq!(spec["Namespace"], "K8sCluster/EtcdLifecycle");
        assert_eq!(spec["Dimensions"][0][0], "ClusterName");
        assert_eq!(spec["Dimensions"][0][1], "InstanceId");
        assert_eq!(spec["Metrics"][1]["Unit"], "Milliseconds");
    }

    #[test]
    fn flush_drains_the_buffer() {
        let sink = EmfSink::new(cluster_namespace("test"));
        sink.put_metric(names::BOOTSTRAP_SUCCESS, 1.0, Unit::Count);
        sink.flush();
        assert!(sink.buffer.lock().unwrap().is_empty());
    }

    #[test]
    fn collecting_sink_sums_by_name() {
        let sink = CollectingSink::new();
        sink.put_metric(names::RETRY_ATTEMPT, 1.0, Unit::Count);
        sink.put_metric(names::RETRY_ATTEMPT, 1.0, Unit::Count);
        sink.put_metric(names::RETRY_EXHAUSTED, 1.0, Unit::Count);
        assert_eq!(sink.values(names::RETRY_ATTEMPT), vec![1.0, 1.0]);
        assert_eq!(sink.total(names::RETRY_EXHAUSTED), 1.0);
    }
}
