use std::time::Instant;

use chrono::{DateTime, Utc};
use coxswain_cloud::error::ExecError;
use coxswain_cloud::exec::{self, CommandRequest, RemoteExec};
use coxswain_cloud::fleet::Fleet;
use coxswain_cloud::scripts::{self, BackupReport, EtcdBackup, ScriptError};
use coxswain_cloud::snapshots;
use coxswain_cloud::StoreError;
use coxswain_common::OpContext;
use coxswain_common::metrics::{MetricSink, Unit, names};
use coxswain_common::retry::{RetryError, RetryPolicy, retry};
use tokio_util::sync::CancellationToken;

pub struct BackupDeps<'a> {
    pub fleet: &'a dyn Fleet,
    pub exec: &'a dyn RemoteExec,
    pub sink: &'a dyn MetricSink,
}

#[derive(Clone, Debug)]
pub struct BackupConfig {
    pub cluster: String,
    pub bucket: String,
    pub local_path: String,
    pub retry: RetryPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("no healthy control-plane instance to snapshot from")]
    NoHealthyInstances,

    #[error("backup command failed: {0}")]
    Exec(#[source] RetryError<ExecError>),

    #[error("snapshot reported corrupt (hash {hash})")]
    Integrity { hash: u64 },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("backup interrupted by shutdown")]
    Interrupted,
}

/// Take one snapshot from a healthy member, verify it, and upload it with
/// its metadata. The remote script gates the upload on a non-zero hash, so
/// a corrupt snapshot never reaches the bucket; an explicit script failure
/// is not retried here (the next schedule tick is the retry).
pub async fn run_backup(
    deps: &BackupDeps<'_>,
    config: &BackupConfig,
    ctx: &OpContext,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<BackupReport, BackupError> {
    let started = Instant::now();
    let outcome = snapshot_once(deps, config, ctx, now, cancel).await;

    match &outcome {
        Ok(report) => {
            tracing::info!(
                key = %report.key,
                hash = report.hash,
                revision = report.revision,
                size = report.size,
                "snapshot uploaded"
            );
            deps.sink.put_metric(names::BACKUP_SUCCESS, 1.0, Unit::Count);
            deps.sink
                .put_metric(names::BACKUP_SIZE_BYTES, report.size as f64, Unit::Bytes);
        }
        Err(err) => {
            tracing::error!(error = %err, "backup failed");
            deps.sink.put_metric(names::BACKUP_FAILURE, 1.0, Unit::Count);
        }
    }
    deps.sink.put_metric(
        names::BACKUP_DURATION,
        started.elapsed().as_millis() as f64,
        Unit::Milliseconds,
    );
    deps.sink.flush();
    outcome
}

async fn snapshot_once(
    deps: &BackupDeps<'_>,
    config: &BackupConfig,
    ctx: &OpContext,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<BackupReport, BackupError> {
    let healthy = deps.fleet.healthy_control_plane().await?;
    let Some(target) = healthy.first() else {
        return Err(BackupError::NoHealthyInstances);
    };

    let key = snapshots::snapshot_key(&config.cluster, now);
    let script = EtcdBackup {
        bucket: &config.bucket,
        key: &key,
        local_path: &config.local_path,
    }
    .render()?;
    let request = CommandRequest {
        instance_id: target.instance_id.clone(),
        script,
        timeout: exec::backup_command_timeout(),
    };

    tracing::info!(
        target = %target.instance_id,
        key = %key,
        "starting etcd snapshot"
    );

    let result = retry(config.retry, cancel, deps.sink, "etcd-backup", |_attempt| {
        let request = request.clone();
        async move { exec::run(deps.exec, ctx, &request, cancel).await }
    })
    .await;

    let output = match result {
        Ok(output) => output,
        Err(RetryError::Cancelled { .. })
        | Err(RetryError::Fatal { source: ExecError::Interrupted, .. }) => {
            return Err(BackupError::Interrupted);
        }
        Err(err) => return Err(BackupError::Exec(err)),
    };

    let report: BackupReport = scripts::parse_report(&output.stdout)?;
    if report.hash == 0 {
        // The script should have refused the upload; treat a zero hash that
        // slipped through as corruption regardless.
        return Err(BackupError::Integrity { hash: report.hash });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use coxswain_cloud::exec::CommandStatus;
    use coxswain_cloud::memory::{MemoryExec, MemoryFleet, instance};
    use coxswain_common::metrics::CollectingSink;
    use std::time::Duration;

    fn config() -> BackupConfig {
        BackupConfig {
            cluster: "prod".to_string(),
            bucket: "cluster-backups".to_string(),
            local_path: "/tmp/etcd-snapshot.db".to_string(),
            retry: RetryPolicy {
                max_attempts: 3,
                base: Duration::from_millis(1),
                jitter_factor: 0.3,
            },
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).unwrap()
    }

    struct Fixture {
        fleet: MemoryFleet,
        exec: MemoryExec,
        sink: CollectingSink,
    }

    impl Fixture {
        fn new() -> Self {
            let fixture = Self {
                fleet: MemoryFleet::new(),
                exec: MemoryExec::new(),
                sink: CollectingSink::new(),
            };
            fixture
                .fleet
                .set_healthy(vec![instance("i-a", "10.0.1.10")]);
            fixture
        }

        async fn run(&self) -> Result<BackupReport, BackupError> {
            let deps = BackupDeps {
                fleet: &self.fleet,
                exec: &self.exec,
                sink: &self.sink,
            };
            run_backup(
                &deps,
                &config(),
                &OpContext::new(),
                now(),
                &CancellationToken::new(),
            )
            .await
        }
    }

    #[tokio::test]
    async fn uploads_and_reports_metadata() {
        let fixture = Fixture::new();
        fixture.exec.push_success(
            r#"COXSWAIN_RESULT {"hash":3976351510,"revision":12845,"size":20971552,"key":"prod/etcd-snapshot-20250115-060000.db"}"#,
        );

        let report = fixture.run().await.unwrap();

        assert_eq!(report.key, "prod/etcd-snapshot-20250115-060000.db");
        assert_eq!(fixture.sink.total(names::BACKUP_SUCCESS), 1.0);
        assert_eq!(fixture.sink.total(names::BACKUP_SIZE_BYTES), 20_971_552.0);

        let sent = fixture.exec.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].script.contains("s3://cluster-backups/prod/etcd-snapshot-20250115-060000.db"));
    }

    #[tokio::test]
    async fn corrupt_snapshot_fails_without_retry() {
        let fixture = Fixture::new();
        // The remote integrity gate exits non-zero before any upload.
        fixture.exec.push_failure(
            CommandStatus::Failed,
            "snapshot integrity check failed: hash=0",
        );

        let err = fixture.run().await.unwrap_err();

        assert!(matches!(err, BackupError::Exec(RetryError::Fatal { .. })));
        assert_eq!(fixture.sink.total(names::BACKUP_FAILURE), 1.0);
        assert_eq!(fixture.exec.sent().len(), 1, "explicit failures are not retried");
    }

    #[tokio::test]
    async fn timeouts_are_retried() {
        let fixture = Fixture::new();
        fixture.exec.push_failure(CommandStatus::TimedOut, "");
        fixture.exec.push_success(
            r#"COXSWAIN_RESULT {"hash":42,"revision":1,"size":1024,"key":"prod/etcd-snapshot-20250115-060000.db"}"#,
        );

        let report = fixture.run().await.unwrap();
        assert_eq!(report.hash, 42);
        assert_eq!(fixture.exec.sent().len(), 2);
    }

    #[tokio::test]
    async fn no_healthy_instances_is_an_error() {
        let fixture = Fixture::new();
        fixture.fleet.set_healthy(Vec::new());

        let err = fixture.run().await.unwrap_err();
        assert!(matches!(err, BackupError::NoHealthyInstances));
        assert_eq!(fixture.sink.total(names::BACKUP_FAILURE), 1.0);
    }

    #[tokio::test]
    async fn zero_hash_in_report_is_rejected() {
        let fixture = Fixture::new();
        fixture.exec.push_success(
            r#"COXSWAIN_RESULT {"hash":0,"revision":1,"size":1024,"key":"prod/etcd-snapshot-20250115-060000.db"}"#,
        );

        let err = fixture.run().await.unwrap_err();
        assert!(matches!(err, BackupError::Integrity { hash: 0 }));
    }
}
