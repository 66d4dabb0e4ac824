//! Backend inventory adapter.
//!
//! The inventory is the source of truth for groups and replicas. Every
//! operation reports absence through [`InventoryError::NotFound`] so callers
//! branch on a variant instead of inspecting error text. Delete operations
//! absorb "already gone" answers and report success.
//!
//! Two implementations are provided:
//! - [`MemoryInventory`]: in-process backend used in dev mode and tests
//! - [`RestInventory`]: JSON/HTTP client for a remote inventory service

use async_trait::async_trait;
use thiserror::Error;
use vmop_reconcile::FanOutError;

pub use vmop_reconcile::PowerState;

mod memory;
mod rest;

pub use memory::{MemoryInventory, Operation};
pub use rest::{is_already_absent, RestInventory, RestInventoryConfig};

/// Errors from inventory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    /// The addressed object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A delete found the object already removed. Delete operations turn
    /// this into success; it only surfaces from lower-level calls.
    #[error("already deleted: {0}")]
    AlreadyAbsent(String),

    /// The backend could not be reached.
    #[error("inventory unavailable: {0}")]
    Unavailable(String),

    /// The backend accepted the request but the operation failed.
    #[error("{operation} failed: {message}")]
    TaskFailed { operation: String, message: String },
}

impl InventoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn task_failed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// A failed fan-out reports its first failure.
impl From<FanOutError<InventoryError>> for InventoryError {
    fn from(err: FanOutError<InventoryError>) -> Self {
        let skipped = err.skipped();
        err.into_first().unwrap_or_else(|| {
            InventoryError::Unavailable(format!("{skipped} operation(s) not issued"))
        })
    }
}

/// Handle to a backend group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupHandle {
    /// Group name (`<namespace>-<name>`).
    pub name: String,

    /// Backend inventory path.
    pub path: String,
}

/// Handle to a replica VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaHandle {
    /// Backend identifier.
    pub id: String,

    /// VM name.
    pub name: String,
}

impl std::fmt::Display for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Parameters of a clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    /// Source template.
    pub template: String,

    /// Name of the new replica.
    pub name: String,

    /// Destination group.
    pub group: GroupHandle,

    pub cpu: u32,

    /// Memory in GB.
    pub memory_gb: u32,
}

impl CloneRequest {
    pub fn memory_mb(&self) -> u64 {
        u64::from(self.memory_gb) * 1024
    }
}

/// Inventory operations used by the reconciler.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Look up a group by name.
    async fn find_group(&self, group: &str) -> Result<GroupHandle, InventoryError>;

    /// Create a group.
    async fn create_group(&self, group: &str) -> Result<GroupHandle, InventoryError>;

    /// List the replicas of a group, in backend order.
    async fn list_replicas(&self, group: &str) -> Result<Vec<ReplicaHandle>, InventoryError>;

    /// Clone a template into a new, powered-on replica.
    async fn clone_replica(&self, request: &CloneRequest) -> Result<ReplicaHandle, InventoryError>;

    async fn power_state(&self, replica: &ReplicaHandle) -> Result<PowerState, InventoryError>;

    async fn power_on(&self, replica: &ReplicaHandle) -> Result<(), InventoryError>;

    async fn power_off(&self, replica: &ReplicaHandle) -> Result<(), InventoryError>;

    /// Destroy a replica. Succeeds if it is already gone.
    async fn delete_replica(&self, replica: &ReplicaHandle) -> Result<(), InventoryError>;

    /// Destroy a group. Succeeds if it is already gone.
    async fn delete_group(&self, group: &GroupHandle) -> Result<(), InventoryError>;
}

/// Power off (best effort) and destroy a replica.
///
/// A failed power-off is ignored: the VM may already be off or unreachable,
/// and the destroy that follows decides the outcome.
pub async fn remove_replica<I>(inventory: &I, replica: &ReplicaHandle) -> Result<(), InventoryError>
where
    I: Inventory + ?Sized,
{
    if let Err(e) = inventory.power_off(replica).await {
        tracing::debug!(replica = %replica, error = %e, "Power off before delete failed, ignoring");
    }
    inventory.delete_replica(replica).await
}
