//! In-memory implementations of the adapter traits, used by tests across
//! the workspace to exercise handler logic without cloud calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coxswain_common::OpContext;

use crate::error::{ExecError, StoreError};
use crate::exec::{CommandHandle, CommandPoll, CommandRequest, CommandResult, CommandStatus, RemoteExec};
use crate::fleet::{Fleet, Instance, LifecycleCompletion};
use crate::locks::{LockAttempt, LockName, LockRecord, LockStore, MemberRecord, MemberStatus};
use crate::params::{Param, ParameterRegistry};
use crate::snapshots::{SnapshotObject, SnapshotStore};

#[derive(Default)]
pub struct MemoryLockStore {
    locks: Mutex<HashMap<LockName, LockRecord>>,
    members: Mutex<HashMap<String, MemberRecord>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_member(&self, record: MemberRecord) {
        self.members
            .lock()
            .expect("lock table poisoned")
            .insert(record.member_id.clone(), record);
    }

    pub fn member(&self, member_id: &str) -> Option<MemberRecord> {
        self.members
            .lock()
            .expect("lock table poisoned")
            .get(member_id)
            .cloned()
    }

    pub fn held_locks(&self) -> Vec<LockName> {
        self.locks
            .lock()
            .expect("lock table poisoned")
            .keys()
            .copied()
            .collect()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(
        &self,
        lock: LockName,
        holder: &str,
        now: DateTime<Utc>,
    ) -> Result<LockAttempt, StoreError> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        if let Some(existing) = locks.get(&lock) {
            return Ok(LockAttempt::HeldBy(Some(existing.clone())));
        }
        locks.insert(
            lock,
            LockRecord {
                holder: holder.to_string(),
                status: "HELD".to_string(),
                created_at: now,
            },
        );
        Ok(LockAttempt::Acquired)
    }

    async fn release(&self, lock: LockName) -> Result<(), StoreError> {
        self.locks.lock().expect("lock table poisoned").remove(&lock);
        Ok(())
    }

    async fn inspect(&self, lock: LockName) -> Result<Option<LockRecord>, StoreError> {
        Ok(self
            .locks
            .lock()
            .expect("lock table poisoned")
            .get(&lock)
            .cloned())
    }

    async fn put_member(&self, record: &MemberRecord) -> Result<(), StoreError> {
        self.seed_member(record.clone());
        Ok(())
    }

    async fn update_member_status(
        &self,
        member_id: &str,
        status: MemberStatus,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut members = self.members.lock().expect("lock table poisoned");
        let record = members
            .get_mut(member_id)
            .ok_or_else(|| StoreError::Malformed(format!("no member {member_id}")))?;
        record.status = status;
        record.request_id = Some(request_id.to_string());
        record.updated_at = now;
        Ok(())
    }

    async fn member_by_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<MemberRecord>, StoreError> {
        Ok(self
            .members
            .lock()
            .expect("lock table poisoned")
            .values()
            .find(|record| record.instance_id == instance_id)
            .cloned())
    }

    async fn delete_member(&self, member_id: &str) -> Result<(), StoreError> {
        self.members
            .lock()
            .expect("lock table poisoned")
            .remove(member_id);
        Ok(())
    }

    async fn active_members(&self) -> Result<Vec<MemberRecord>, StoreError> {
        Ok(self
            .members
            .lock()
            .expect("lock table poisoned")
            .values()
            .filter(|record| record.status == MemberStatus::Active)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    values: Mutex<HashMap<Param, String>>,
    fail_keys: Mutex<HashSet<Param>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, param: Param, value: impl Into<String>) {
        self.values
            .lock()
            .expect("registry poisoned")
            .insert(param, value.into());
    }

    /// Make every subsequent read/write of `param` fail.
    pub fn fail_on(&self, param: Param) {
        self.fail_keys.lock().expect("registry poisoned").insert(param);
    }

    pub fn value(&self, param: Param) -> Option<String> {
        self.values.lock().expect("registry poisoned").get(&param).cloned()
    }
}

#[async_trait]
impl ParameterRegistry for MemoryRegistry {
    async fn get(&self, param: Param) -> Result<Option<String>, StoreError> {
        if self.fail_keys.lock().expect("registry poisoned").contains(&param) {
            return Err(StoreError::api("memory get-parameter", "injected failure"));
        }
        Ok(self.value(param))
    }

    async fn put(&self, param: Param, value: &str) -> Result<(), StoreError> {
        if self.fail_keys.lock().expect("registry poisoned").contains(&param) {
            return Err(StoreError::api("memory put-parameter", "injected failure"));
        }
        self.set(param, value);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryExec {
    responses: Mutex<VecDeque<CommandResult>>,
    sent: Mutex<Vec<CommandRequest>>,
    next_id: AtomicU64,
}

impl MemoryExec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_result(&self, result: CommandResult) {
        self.responses
            .lock()
            .expect("exec queue poisoned")
            .push_back(result);
    }

    pub fn push_success(&self, stdout: impl Into<String>) {
        self.push_result(CommandResult {
            status: CommandStatus::Success,
            stdout: stdout.into(),
            stderr: String::new(),
        });
    }

    pub fn push_failure(&self, status: CommandStatus, stderr: impl Into<String>) {
        self.push_result(CommandResult {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        });
    }

    pub fn sent(&self) -> Vec<CommandRequest> {
        self.sent.lock().expect("exec queue poisoned").clone()
    }
}

#[async_trait]
impl RemoteExec for MemoryExec {
    async fn send(
        &self,
        _ctx: &OpContext,
        request: &CommandRequest,
    ) -> Result<CommandHandle, ExecError> {
        self.sent
            .lock()
            .expect("exec queue poisoned")
            .push(request.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(CommandHandle {
            command_id: format!("cmd-{id}"),
            instance_id: request.instance_id.clone(),
        })
    }

    async fn poll(&self, _handle: &CommandHandle) -> Result<CommandPoll, ExecError> {
        match self
            .responses
            .lock()
            .expect("exec queue poisoned")
            .pop_front()
        {
            Some(result) => Ok(CommandPoll::Done(result)),
            None => Ok(CommandPoll::Pending),
        }
    }
}

#[derive(Default)]
pub struct MemorySnapshots {
    objects: Mutex<Vec<(SnapshotObject, Vec<u8>)>>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: impl Into<String>, last_modified: DateTime<Utc>, bytes: Vec<u8>) {
        let key = key.into();
        self.objects.lock().expect("snapshot store poisoned").push((
            SnapshotObject {
                key,
                last_modified,
                size: bytes.len() as i64,
            },
            bytes,
        ));
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshots {
    async fn latest(&self, cluster: &str) -> Result<Option<SnapshotObject>, StoreError> {
        let prefix = format!("{cluster}/etcd-snapshot-");
        Ok(self
            .objects
            .lock()
            .expect("snapshot store poisoned")
            .iter()
            .filter(|(object, _)| object.key.starts_with(&prefix))
            .max_by_key(|(object, _)| object.last_modified)
            .map(|(object, _)| object.clone()))
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
        let bytes = self
            .objects
            .lock()
            .expect("snapshot store poisoned")
            .iter()
            .find(|(object, _)| object.key == key)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| StoreError::api("memory download", format!("no object {key}")))?;
        tokio::fs::write(dest, bytes)
            .await
            .map_err(|err| StoreError::api("memory download", err))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryFleet {
    healthy: Mutex<Vec<Instance>>,
    registered: Mutex<Vec<String>>,
    deregistered: Mutex<Vec<String>>,
    completions: Mutex<Vec<LifecycleCompletion>>,
    reject_tokened_completion: AtomicBool,
}

pub fn instance(instance_id: &str, private_ip: &str) -> Instance {
    Instance {
        instance_id: instance_id.to_string(),
        private_ip: Some(private_ip.to_string()),
        private_dns: Some(format!(
            "ip-{}.ec2.internal",
            private_ip.replace('.', "-")
        )),
    }
}

impl MemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, instances: Vec<Instance>) {
        *self.healthy.lock().expect("fleet poisoned") = instances;
    }

    /// Reject completions that carry an action token, exercising the
    /// instance-only completion retry.
    pub fn reject_action_token(&self) {
        self.reject_tokened_completion.store(true, Ordering::SeqCst);
    }

    pub fn completions(&self) -> Vec<LifecycleCompletion> {
        self.completions.lock().expect("fleet poisoned").clone()
    }

    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().expect("fleet poisoned").clone()
    }

    pub fn deregistered(&self) -> Vec<String> {
        self.deregistered.lock().expect("fleet poisoned").clone()
    }
}

#[async_trait]
impl Fleet for MemoryFleet {
    async fn healthy_control_plane(&self) -> Result<Vec<Instance>, StoreError> {
        Ok(self.healthy.lock().expect("fleet poisoned").clone())
    }

    async fn register_target(&self, instance_id: &str) -> Result<(), StoreError> {
        self.registered
            .lock()
            .expect("fleet poisoned")
            .push(instance_id.to_string());
        Ok(())
    }

    async fn deregister_target(&self, instance_id: &str) -> Result<(), StoreError> {
        self.deregistered
            .lock()
            .expect("fleet poisoned")
            .push(instance_id.to_string());
        Ok(())
    }

    async fn complete_lifecycle_action(
        &self,
        completion: &LifecycleCompletion,
    ) -> Result<(), StoreError> {
        if self.reject_tokened_completion.load(Ordering::SeqCst)
            && completion.action_token.is_some()
        {
            return Err(StoreError::api(
                "memory complete-lifecycle-action",
                "token no longer valid",
            ));
        }
        self.completions
            .lock()
            .expect("fleet poisoned")
            .push(completion.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn conditional_insert_rejects_second_holder() {
        let store = MemoryLockStore::new();
        let first = store
            .try_acquire(LockName::ClusterInit, "i-1", now())
            .await
            .unwrap();
        assert!(matches!(first, LockAttempt::Acquired));

        let second = store
            .try_acquire(LockName::ClusterInit, "i-2", now())
            .await
            .unwrap();
        match second {
            LockAttempt::HeldBy(Some(record)) => assert_eq!(record.holder, "i-1"),
            other => panic!("expected held-by, got {other:?}"),
        }

        store.release(LockName::ClusterInit).await.unwrap();
        let third = store
            .try_acquire(LockName::ClusterInit, "i-2", now())
            .await
            .unwrap();
        assert!(matches!(third, LockAttempt::Acquired));
    }

    #[tokio::test]
    async fn active_members_excludes_removed_members_and_lock_rows() {
        let store = MemoryLockStore::new();
        let member = |member_id: &str, instance_id: &str, status| MemberRecord {
            member_id: member_id.to_string(),
            instance_id: instance_id.to_string(),
            private_ip: "10.0.1.20".to_string(),
            hostname: format!("{instance_id}.ec2.internal"),
            status,
            created_at: now(),
            updated_at: now(),
            request_id: None,
        };
        store.seed_member(member("8e9e05c52164694d", "i-a", MemberStatus::Active));
        store.seed_member(member("deadbeef01020304", "i-b", MemberStatus::Removed));
        store.seed_member(member("aabbccdd00112233", "i-c", MemberStatus::Active));
        store
            .try_acquire(LockName::ClusterInit, "i-a", now())
            .await
            .unwrap();

        let mut active = store.active_members().await.unwrap();
        active.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].instance_id, "i-a");
        assert_eq!(active[1].instance_id, "i-c");
    }

    #[tokio::test]
    async fn latest_snapshot_wins_by_last_modified() {
        let store = MemorySnapshots::new();
        store.add("prod/etcd-snapshot-20250114-060000.db", now() - chrono::Duration::days(1), vec![1]);
        store.add("prod/etcd-snapshot-20250115-060000.db", now(), vec![2]);
        store.add("other/etcd-snapshot-20250116-060000.db", now() + chrono::Duration::days(1), vec![3]);

        let latest = store.latest("prod").await.unwrap().unwrap();
        assert_eq!(latest.key, "prod/etcd-snapshot-20250115-060000.db");
    }
}
