use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

/// Key for a snapshot taken at `when`: `<cluster>/etcd-snapshot-YYYYMMDD-HHMMSS.db`.
pub fn snapshot_key(cluster: &str, when: DateTime<Utc>) -> String {
    format!(
        "{cluster}/etcd-snapshot-{}.db",
        when.format("%Y%m%d-%H%M%S")
    )
}

pub fn snapshot_prefix(cluster: &str) -> String {
    format!("{cluster}/etcd-snapshot-")
}

#[derive(Clone, Debug)]
pub struct SnapshotObject {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: i64,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Newest snapshot for the cluster by last-modified time.
    async fn latest(&self, cluster: &str) -> Result<Option<SnapshotObject>, StoreError>;

    async fn download(&self, key: &str, dest: &Path) -> Result<(), StoreError>;
}

pub struct S3SnapshotStore {
    client: Client,
    bucket: String,
}

impl S3SnapshotStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl SnapshotStore for S3SnapshotStore {
    async fn latest(&self, cluster: &str) -> Result<Option<SnapshotObject>, StoreError> {
        let prefix = snapshot_prefix(cluster);
        let mut newest: Option<SnapshotObject> = None;
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|err| StoreError::api("s3 list-objects", err))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let Some(modified) = object.last_modified() else { continue };
                let Some(modified) =
                    DateTime::from_timestamp(modified.secs(), modified.subsec_nanos())
                else {
                    continue;
                };
                let candidate = SnapshotObject {
                    key: key.to_string(),
                    last_modified: modified,
                    size: object.size().unwrap_or(0),
                };
                if newest
                    .as_ref()
                    .is_none_or(|best| candidate.last_modified > best.last_modified)
                {
                    newest = Some(candidate);
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(|t| t.to_string());
            } else {
                break;
            }
        }

        Ok(newest)
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::api("create download directory", err))?;
        }

        tracing::info!(bucket = %self.bucket, key = %key, dest = %dest.display(), "downloading snapshot");

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StoreError::api("s3 get-object", err))?;

        let mut file = File::create(dest)
            .await
            .map_err(|err| StoreError::api("create snapshot file", err))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|err| StoreError::api("read snapshot body", err))?;

        file.write_all(&body.into_bytes())
            .await
            .map_err(|err| StoreError::api("write snapshot file", err))?;
        file.flush()
            .await
            .map_err(|err| StoreError::api("flush snapshot file", err))?;

        tracing::info!(dest = %dest.display(), "snapshot download complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn key_format_is_utc_compact() {
        let when = Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).unwrap();
        assert_eq!(
            snapshot_key("prod", when),
            "prod/etcd-snapshot-20250115-060000.db"
        );
        assert!(snapshot_key("prod", when).starts_with(&snapshot_prefix("prod")));
    }
}
