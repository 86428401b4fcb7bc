use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Duration, Utc};
use coxswain_common::timefmt;

use crate::error::StoreError;

/// Cluster-wide coordination locks. They share the member-record table:
/// each lock is a row whose member id is one of these reserved values, so
/// uniqueness comes from the same conditional insert as everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockName {
    ClusterInit,
    TokenRefresh,
    TokenGen,
    Restore,
}

impl LockName {
    pub fn key(self) -> &'static str {
        match self {
            LockName::ClusterInit => "cluster-init",
            LockName::TokenRefresh => "token-refresh-lock",
            LockName::TokenGen => "token-gen-lock",
            LockName::Restore => "restore-lock",
        }
    }

    /// Age beyond which a holder is presumed dead and the lock may be
    /// force-released by anyone. Only the restore lock has one; the token
    /// locks are guarded by the 60 s freshness window instead.
    pub fn stale_after(self) -> Option<Duration> {
        match self {
            LockName::Restore => Some(Duration::seconds(1800)),
            _ => None,
        }
    }
}

/// Update recency below which a would-be token refresher skips the refresh.
pub fn token_freshness_window() -> Duration {
    Duration::seconds(60)
}

#[derive(Clone, Debug)]
pub struct LockRecord {
    pub holder: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        timefmt::age(now, self.created_at)
    }

    /// Stale at exactly the TTL boundary and beyond.
    pub fn is_stale(&self, lock: LockName, now: DateTime<Utc>) -> bool {
        match lock.stale_after() {
            Some(ttl) => self.age(now) >= ttl,
            None => false,
        }
    }
}

#[derive(Debug)]
pub enum LockAttempt {
    Acquired,
    /// Lost the race; the holder's record, unless it vanished between the
    /// rejected insert and the follow-up read.
    HeldBy(Option<LockRecord>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberStatus {
    Active,
    Removed,
    RemovalFailed,
    Restoring,
}

impl MemberStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberStatus::Active => "ACTIVE",
            MemberStatus::Removed => "REMOVED",
            MemberStatus::RemovalFailed => "REMOVAL_FAILED",
            MemberStatus::Restoring => "RESTORING",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "ACTIVE" => Ok(MemberStatus::Active),
            "REMOVED" => Ok(MemberStatus::Removed),
            "REMOVAL_FAILED" => Ok(MemberStatus::RemovalFailed),
            "RESTORING" => Ok(MemberStatus::Restoring),
            other => Err(StoreError::Malformed(format!("member status {other:?}"))),
        }
    }
}

/// One etcd member of the control plane, keyed by the hex form of its
/// 64-bit etcd id.
#[derive(Clone, Debug)]
pub struct MemberRecord {
    pub member_id: String,
    pub instance_id: String,
    pub private_ip: String,
    pub hostname: String,
    pub status: MemberStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub request_id: Option<String>,
}

pub fn member_id_hex(decimal: u64) -> String {
    format!("{decimal:x}")
}

pub fn member_id_from_hex(hex: &str) -> Result<u64, StoreError> {
    u64::from_str_radix(hex, 16)
        .map_err(|err| StoreError::Malformed(format!("etcd member id {hex:?}: {err}")))
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomic conditional insert; fails when the lock row already exists.
    async fn try_acquire(
        &self,
        lock: LockName,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<LockAttempt, StoreError>;

    async fn release(&self, lock: LockName) -> Result<(), StoreError>;

    /// Strongly consistent read of the lock row.
    async fn inspect(&self, lock: LockName) -> Result<Option<LockRecord>, StoreError>;

    async fn put_member(&self, record: &MemberRecord) -> Result<(), StoreError>;

    async fn update_member_status(
        &self,
        member_id: &str,
        status: MemberStatus,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn member_by_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<MemberRecord>, StoreError>;

    async fn delete_member(&self, member_id: &str) -> Result<(), StoreError>;

    /// Member records with status ACTIVE; lock rows are excluded.
    async fn active_members(&self) -> Result<Vec<MemberRecord>, StoreError>;
}

/// Release a lock on a shutdown/cleanup path where nothing can be done about
/// a failure; the stale-lock sweep is the safety net.
pub async fn release_best_effort(store: &dyn LockStore, lock: LockName) {
    if let Err(err) = store.release(lock).await {
        tracing::warn!(lock = lock.key(), error = %err, "failed to release lock");
    }
}

pub const INSTANCE_ID_INDEX: &str = "InstanceIdIndex";

pub struct DynamoLockStore {
    client: Client,
    table: String,
    cluster: String,
}

impl DynamoLockStore {
    pub fn new(client: Client, table: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
            cluster: cluster.into(),
        }
    }

    fn key(&self, member_id: &str) -> (AttributeValue, AttributeValue) {
        (
            AttributeValue::S(self.cluster.clone()),
            AttributeValue::S(member_id.to_string()),
        )
    }

    fn member_from_item(item: &HashMap<String, AttributeValue>) -> Result<MemberRecord, StoreError> {
        let text = |attr: &str| -> Result<String, StoreError> {
            item.get(attr)
                .and_then(|value| value.as_s().ok())
                .cloned()
                .ok_or_else(|| StoreError::Malformed(format!("missing attribute {attr}")))
        };
        Ok(MemberRecord {
            member_id: text("MemberId")?,
            instance_id: text("InstanceId")?,
            private_ip: text("PrivateIp")?,
            hostname: text("Hostname")?,
            status: MemberStatus::parse(&text("Status")?)?,
            created_at: timefmt::parse_utc(&text("CreatedAt")?)
                .map_err(|err| StoreError::Malformed(err.to_string()))?,
            updated_at: timefmt::parse_utc(&text("UpdatedAt")?)
                .map_err(|err| StoreError::Malformed(err.to_string()))?,
            request_id: item
                .get("RequestId")
                .and_then(|value| value.as_s().ok())
                .cloned(),
        })
    }
}

#[async_trait]
impl LockStore for DynamoLockStore {
    async fn try_acquire(
        &self,
        lock: LockName,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<LockAttempt, StoreError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table)
            .item("ClusterId", AttributeValue::S(self.cluster.clone()))
            .item("MemberId", AttributeValue::S(lock.key().to_string()))
            .item("InstanceId", AttributeValue::S(holder.to_string()))
            .item("Status", AttributeValue::S("HELD".to_string()))
            .item("CreatedAt", AttributeValue::S(timefmt::format_utc(now)))
            .condition_expression("attribute_not_exists(MemberId)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(LockAttempt::Acquired),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_conditional_check_failed_exception() {
                    Ok(LockAttempt::HeldBy(self.inspect(lock).await?))
                } else {
                    Err(StoreError::api("dynamodb put-item", service))
                }
            }
        }
    }

    async fn release(&self, lock: LockName) -> Result<(), StoreError> {
        let (pk, sk) = self.key(lock.key());
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("ClusterId", pk)
            .key("MemberId", sk)
            .send()
            .await
            .map_err(|err| StoreError::api("dynamodb delete-item", err))?;
        Ok(())
    }

    async fn inspect(&self, lock: LockName) -> Result<Option<LockRecord>, StoreError> {
        let (pk, sk) = self.key(lock.key());
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("ClusterId", pk)
            .key("MemberId", sk)
            .consistent_read(true)
            .send()
            .await
            .map_err(|err| StoreError::api("dynamodb get-item", err))?;

        let Some(item) = output.item() else {
            return Ok(None);
        };
        let text = |attr: &str| -> Option<String> {
            item.get(attr).and_then(|value| value.as_s().ok()).cloned()
        };
        let created_at = text("CreatedAt")
            .ok_or_else(|| StoreError::Malformed("lock row missing CreatedAt".into()))?;
        Ok(Some(LockRecord {
            holder: text("InstanceId").unwrap_or_default(),
            status: text("Status").unwrap_or_default(),
            created_at: timefmt::parse_utc(&created_at)
                .map_err(|err| StoreError::Malformed(err.to_string()))?,
        }))
    }

    async fn put_member(&self, record: &MemberRecord) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .item("ClusterId", AttributeValue::S(self.cluster.clone()))
            .item("MemberId", AttributeValue::S(record.member_id.clone()))
            .item("EtcdMemberId", AttributeValue::S(record.member_id.clone()))
            .item("InstanceId", AttributeValue::S(record.instance_id.clone()))
            .item("PrivateIp", AttributeValue::S(record.private_ip.clone()))
            .item("Hostname", AttributeValue::S(record.hostname.clone()))
            .item("Status", AttributeValue::S(record.status.as_str().to_string()))
            .item("CreatedAt", AttributeValue::S(timefmt::format_utc(record.created_at)))
            .item("UpdatedAt", AttributeValue::S(timefmt::format_utc(record.updated_at)))
            .send()
            .await
            .map_err(|err| StoreError::api("dynamodb put-item", err))?;
        Ok(())
    }

    async fn update_member_status(
        &self,
        member_id: &str,
        status: MemberStatus,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (pk, sk) = self.key(member_id);
        self.client
            .update_item()
            .table_name(&self.table)
            .key("ClusterId", pk)
            .key("MemberId", sk)
            .update_expression("SET #s = :status, UpdatedAt = :updated, RequestId = :request")
            .expression_attribute_names("#s", "Status")
            .expression_attribute_values(":status", AttributeValue::S(status.as_str().to_string()))
            .expression_attribute_values(":updated", AttributeValue::S(timefmt::format_utc(now)))
            .expression_attribute_values(":request", AttributeValue::S(request_id.to_string()))
            .send()
            .await
            .map_err(|err| StoreError::api("dynamodb update-item", err))?;
        Ok(())
    }

    async fn member_by_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<MemberRecord>, StoreError> {
        let output = self
            .client
            .query()
            .table_name(&self.table)
            .index_name(INSTANCE_ID_INDEX)
            .key_condition_expression("InstanceId = :instance")
            .expression_attribute_values(":instance", AttributeValue::S(instance_id.to_string()))
            .send()
            .await
            .map_err(|err| StoreError::api("dynamodb query", err))?;

        // Lock rows also carry InstanceId; only member rows have a Hostname.
        output
            .items()
            .iter()
            .filter(|item| item.contains_key("Hostname"))
            .map(Self::member_from_item)
            .next()
            .transpose()
    }

    async fn delete_member(&self, member_id: &str) -> Result<(), StoreError> {
        let (pk, sk) = self.key(member_id);
        self.client
            .delete_item()
            .table_name(&self.table)
            .key("ClusterId", pk)
            .key("MemberId", sk)
            .send()
            .await
            .map_err(|err| StoreError::api("dynamodb delete-item", err))?;
        Ok(())
    }

    async fn active_members(&self) -> Result<Vec<MemberRecord>, StoreError> {
        let mut members = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let mut request = self
                .client
                .query()
                .table_name(&self.table)
                .key_condition_expression("ClusterId = :cluster")
                // Lock rows share the table; only member rows carry a Hostname.
                .filter_expression("#s = :active AND attribute_exists(Hostname)")
                .expression_attribute_names("#s", "Status")
                .expression_attribute_values(":cluster", AttributeValue::S(self.cluster.clone()))
                .expression_attribute_values(
                    ":active",
                    AttributeValue::S(MemberStatus::Active.as_str().to_string()),
                );
            if let Some(key) = start_key.take() {
                request = request.set_exclusive_start_key(Some(key));
            }

            let output = request
                .send()
                .await
                .map_err(|err| StoreError::api("dynamodb query", err))?;

            for item in output.items() {
                members.push(Self::member_from_item(item)?);
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn member_id_hex_round_trips() {
        for id in [0u64, 1, 0xdead_beef, u64::MAX, 9_372_538_179_322_589_801] {
            assert_eq!(member_id_from_hex(&member_id_hex(id)).unwrap(), id);
        }
    }

    #[test]
    fn member_id_rejects_non_hex() {
        assert!(member_id_from_hex("").is_err());
        assert!(member_id_from_hex("cluster-init").is_err());
        assert!(member_id_from_hex("0x1234").is_err());
    }

    #[test]
    fn reserved_lock_keys_never_parse_as_member_ids() {
        for lock in [
            LockName::ClusterInit,
            LockName::TokenRefresh,
            LockName::TokenGen,
            LockName::Restore,
        ] {
            assert!(member_id_from_hex(lock.key()).is_err());
        }
    }

    #[test]
    fn restore_lock_is_stale_at_exactly_the_ttl() {
        let created = Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).unwrap();
        let record = LockRecord {
            holder: "i-1".into(),
            status: "HELD".into(),
            created_at: created,
        };
        let boundary = created + Duration::seconds(1800);
        assert!(record.is_stale(LockName::Restore, boundary));
        assert!(!record.is_stale(LockName::Restore, boundary - Duration::seconds(1)));
        assert!(!record.is_stale(LockName::ClusterInit, boundary + Duration::days(1)));
    }

    #[test]
    fn member_status_round_trips() {
        for status in [
            MemberStatus::Active,
            MemberStatus::Removed,
            MemberStatus::RemovalFailed,
            MemberStatus::Restoring,
        ] {
            assert_eq!(MemberStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(MemberStatus::parse("HELD").is_err());
    }
}
