//! Declarative resource store.
//!
//! The reconciler consumes the store through [`ResourceStore`]: it reads a
//! VmGroup, writes finalizer changes and writes status. Every write is a
//! compare-and-set on `resource_version`; a stale write fails with
//! [`StoreError::Conflict`] and the pass is retried.
//!
//! [`MemoryStore`] is the in-process implementation. It validates specs on
//! admission, erases a record once deletion was requested and no finalizer is
//! left, and publishes the keys of user-driven changes so a controller can
//! react to them.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};
use validator::Validate;

use crate::resource::{GroupKey, ObjectMeta, VmGroup, VmGroupSpec};

/// Capacity of the change notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(GroupKey),

    #[error("conflict writing {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: GroupKey,
        expected: u64,
        actual: u64,
    },

    #[error("invalid resource {key}: {message}")]
    Invalid { key: GroupKey, message: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Store operations the reconciler depends on.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Load a resource. `None` when it does not exist.
    async fn get(&self, key: &GroupKey) -> Result<Option<VmGroup>, StoreError>;

    /// Persist the finalizer list.
    ///
    /// Returns `None` when the write removed the last finalizer of a record
    /// marked for deletion and the store erased it.
    async fn update_meta(&self, group: &VmGroup) -> Result<Option<VmGroup>, StoreError>;

    /// Persist the status block.
    async fn update_status(&self, group: &VmGroup) -> Result<VmGroup, StoreError>;
}

#[derive(Debug, Default)]
struct Faults {
    meta_writes: u32,
    status_writes: u32,
}

/// In-memory store.
pub struct MemoryStore {
    records: RwLock<BTreeMap<GroupKey, VmGroup>>,
    changes: broadcast::Sender<GroupKey>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(BTreeMap::new()),
            changes,
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Subscribe to keys of created, updated and deletion-requested records.
    ///
    /// Writes made by the reconciler itself (finalizers, status) are not
    /// published, except the final erase of a deleted record.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupKey> {
        self.changes.subscribe()
    }

    /// Create a VmGroup or update its spec.
    pub async fn apply(
        &self,
        namespace: &str,
        name: &str,
        spec: VmGroupSpec,
    ) -> Result<VmGroup, StoreError> {
        let key = GroupKey::new(namespace, name);
        spec.validate().map_err(|e| StoreError::Invalid {
            key: key.clone(),
            message: e.to_string(),
        })?;

        let mut records = self.records.write().await;
        let group = match records.get_mut(&key) {
            Some(existing) if existing.spec == spec => return Ok(existing.clone()),
            Some(existing) => {
                existing.spec = spec;
                existing.metadata.resource_version += 1;
                debug!(group = %key, version = existing.metadata.resource_version, "Spec updated");
                existing.clone()
            }
            None => {
                let mut metadata = ObjectMeta::new(namespace, name);
                metadata.resource_version = 1;
                let group = VmGroup::new(metadata, spec);
                records.insert(key.clone(), group.clone());
                info!(group = %key, "VmGroup created");
                group
            }
        };
        drop(records);

        self.notify(key);
        Ok(group)
    }

    /// Mark a record for deletion.
    ///
    /// Records without finalizers are erased immediately. Returns true when
    /// the record is gone after the call.
    pub async fn request_delete(&self, key: &GroupKey) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let Some(group) = records.get_mut(key) else {
            return Err(StoreError::NotFound(key.clone()));
        };

        let erased = if group.metadata.finalizers.is_empty() {
            records.remove(key);
            true
        } else {
            if group.metadata.deletion_timestamp.is_none() {
                group.metadata.deletion_timestamp = Some(Utc::now());
                group.metadata.resource_version += 1;
            }
            false
        };
        drop(records);

        info!(group = %key, erased, "Deletion requested");
        self.notify(key.clone());
        Ok(erased)
    }

    /// Keys of all records, in key order.
    pub async fn keys(&self) -> Vec<GroupKey> {
        self.records.read().await.keys().cloned().collect()
    }

    /// Fail the next `count` finalizer writes with [`StoreError::Unavailable`].
    pub fn fail_meta_writes(&self, count: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.meta_writes = count;
        }
    }

    /// Fail the next `count` status writes with [`StoreError::Unavailable`].
    pub fn fail_status_writes(&self, count: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.status_writes = count;
        }
    }

    fn take_fault(&self, pick: impl FnOnce(&mut Faults) -> &mut u32) -> bool {
        let Ok(mut faults) = self.faults.lock() else {
            return false;
        };
        let remaining = pick(&mut faults);
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    fn notify(&self, key: GroupKey) {
        // No subscribers is fine.
        let _ = self.changes.send(key);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_version(stored: &VmGroup, written: &VmGroup) -> Result<(), StoreError> {
    if stored.metadata.resource_version != written.metadata.resource_version {
        return Err(StoreError::Conflict {
            key: written.key(),
            expected: written.metadata.resource_version,
            actual: stored.metadata.resource_version,
        });
    }
    Ok(())
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &GroupKey) -> Result<Option<VmGroup>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn update_meta(&self, group: &VmGroup) -> Result<Option<VmGroup>, StoreError> {
        if self.take_fault(|f| &mut f.meta_writes) {
            return Err(StoreError::Unavailable("injected meta write failure".to_string()));
        }

        let key = group.key();
        let mut records = self.records.write().await;
        let Some(stored) = records.get_mut(&key) else {
            return Err(StoreError::NotFound(key));
        };
        check_version(stored, group)?;

        stored.metadata.finalizers = group.metadata.finalizers.clone();
        stored.metadata.resource_version += 1;

        if stored.metadata.deletion_timestamp.is_some() && stored.metadata.finalizers.is_empty() {
            records.remove(&key);
            drop(records);
            info!(group = %key, "VmGroup erased");
            self.notify(key);
            return Ok(None);
        }

        Ok(Some(stored.clone()))
    }

    async fn update_status(&self, group: &VmGroup) -> Result<VmGroup, StoreError> {
        if self.take_fault(|f| &mut f.status_writes) {
            return Err(StoreError::Unavailable("injected status write failure".to_string()));
        }

        let key = group.key();
        let mut records = self.records.write().await;
        let Some(stored) = records.get_mut(&key) else {
            return Err(StoreError::NotFound(key));
        };
        check_version(stored, group)?;

        if stored.status != group.status {
            stored.status = group.status.clone();
            stored.metadata.resource_version += 1;
        }

        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{StatusPhase, VmGroupStatus, FINALIZER};

    fn spec(replicas: u32) -> VmGroupSpec {
        VmGroupSpec {
            cpu: 1,
            memory: 2,
            template: "tmpl".to_string(),
            replicas,
        }
    }

    #[tokio::test]
    async fn test_apply_validates() {
        let store = MemoryStore::new();
        let mut bad = spec(1);
        bad.memory = 9;

        let err = store.apply("default", "web", bad).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid { .. }));
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_same_spec_is_noop() {
        let store = MemoryStore::new();
        let first = store.apply("default", "web", spec(2)).await.unwrap();
        let second = store.apply("default", "web", spec(2)).await.unwrap();
        assert_eq!(first.metadata.resource_version, second.metadata.resource_version);

        let third = store.apply("default", "web", spec(3)).await.unwrap();
        assert_eq!(third.metadata.resource_version, 2);
        assert_eq!(third.spec.replicas, 3);
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = MemoryStore::new();
        let mut group = store.apply("default", "web", spec(2)).await.unwrap();
        group.add_finalizer();
        let updated = store.update_meta(&group).await.unwrap().unwrap();
        assert!(updated.has_finalizer());

        // `group` still carries the old version.
        let err = store.update_status(&group).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_delete_without_finalizer_erases() {
        let store = MemoryStore::new();
        let group = store.apply("default", "web", spec(1)).await.unwrap();

        assert!(store.request_delete(&group.key()).await.unwrap());
        assert!(store.get(&group.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finalizer_holds_record_until_removed() {
        let store = MemoryStore::new();
        let mut group = store.apply("default", "web", spec(1)).await.unwrap();
        group.add_finalizer();
        store.update_meta(&group).await.unwrap();

        assert!(!store.request_delete(&group.key()).await.unwrap());
        let mut deleting = store.get(&group.key()).await.unwrap().unwrap();
        assert!(deleting.is_deleting());
        assert_eq!(deleting.metadata.finalizers, vec![FINALIZER.to_string()]);

        deleting.remove_finalizer();
        assert!(store.update_meta(&deleting).await.unwrap().is_none());
        assert!(store.get(&group.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_write_and_injected_failure() {
        let store = MemoryStore::new();
        let mut group = store.apply("default", "web", spec(1)).await.unwrap();
        group.status = Some(VmGroupStatus {
            phase: StatusPhase::Running,
            current_replicas: Some(1),
            desired_replicas: 1,
            last_message: "ok".to_string(),
        });

        store.fail_status_writes(1);
        assert!(matches!(
            store.update_status(&group).await,
            Err(StoreError::Unavailable(_))
        ));

        let written = store.update_status(&group).await.unwrap();
        assert_eq!(written.status, group.status);
    }

    #[tokio::test]
    async fn test_changes_published() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();

        store.apply("default", "web", spec(1)).await.unwrap();
        assert_eq!(changes.recv().await.unwrap(), GroupKey::new("default", "web"));
    }
}
