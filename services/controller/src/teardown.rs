//! Deletion state machine.
//!
//! ```text
//! Active ──deletion requested──▶ Deleting ──teardown ok, finalizer cleared──▶ Removed
//! ```
//!
//! The finalizer stays on the record until [`teardown`] succeeded, so a record
//! never disappears while backend objects may still exist. Every step is safe
//! to repeat: a group or replica that is already gone counts as removed.

use tracing::{debug, info};
use vmop_reconcile::{fan_out, Limiter};

use crate::inventory::{remove_replica, Inventory, InventoryError};
use crate::resource::VmGroup;

/// Where a record stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No deletion requested.
    Active,

    /// Deletion requested, backend cleanup outstanding.
    Deleting,

    /// Finalizer cleared or record gone; nothing left to do.
    Removed,
}

impl LifecycleState {
    pub fn of(group: Option<&VmGroup>) -> Self {
        match group {
            None => Self::Removed,
            Some(g) if !g.is_deleting() => Self::Active,
            Some(g) if g.has_finalizer() => Self::Deleting,
            Some(_) => Self::Removed,
        }
    }
}

/// What a teardown did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// The group was found in the backend.
    pub group_found: bool,

    /// Replicas destroyed (or found already gone).
    pub replicas_removed: usize,
}

/// Remove every replica of `group_name` and then the group itself.
///
/// Returns the first failure; the caller retries the whole teardown.
pub async fn teardown<I>(
    inventory: &I,
    group_name: &str,
    limiter: &Limiter,
) -> Result<TeardownReport, InventoryError>
where
    I: Inventory + ?Sized,
{
    let group = match inventory.find_group(group_name).await {
        Ok(group) => group,
        Err(InventoryError::NotFound(_)) => {
            debug!(group = group_name, "Group already absent");
            return Ok(TeardownReport::default());
        }
        Err(e) => return Err(e),
    };

    let replicas = match inventory.list_replicas(group_name).await {
        Ok(replicas) => replicas,
        Err(InventoryError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(e),
    };

    let replicas_removed = replicas.len();
    if !replicas.is_empty() {
        info!(group = group_name, count = replicas_removed, "Deleting replicas");
        fan_out(limiter, replicas.iter(), |replica| {
            remove_replica(inventory, replica)
        })
        .await
        .into_result()?;
    }

    inventory.delete_group(&group).await?;
    info!(group = group_name, replicas = replicas_removed, "Group deleted");

    Ok(TeardownReport {
        group_found: true,
        replicas_removed,
    })
}
