//! Per-resource reconciliation pass.
//!
//! One pass:
//! 1. loads the VmGroup (gone means done)
//! 2. tears down the backend group when deletion was requested, then clears
//!    the finalizer
//! 3. registers the finalizer before touching the backend
//! 4. resolves the backend group, creating it when absent
//! 5. lists replicas and applies the convergence plan under a per-pass limiter
//! 6. writes exactly one status record
//!
//! Backend failures are classified into the status; only store and teardown
//! failures surface as [`ReconcileError`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use vmop_reconcile::{
    fan_out, power_repairs, unique_names, ConvergencePlan, Limiter, NameGenerator,
    DEFAULT_CONCURRENCY, DEFAULT_REQUEUE_AFTER, DEFAULT_RESYNC_INTERVAL,
};

use crate::error::ReconcileError;
use crate::inventory::{
    remove_replica, CloneRequest, GroupHandle, Inventory, InventoryError, ReplicaHandle,
};
use crate::resource::{GroupKey, VmGroup, VmGroupStatus};
use crate::status::{self, Failure};
use crate::store::ResourceStore;
use crate::teardown::{teardown, LifecycleState};

/// Controller tuning shared by the reconciler and the work queue.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Delay before a pass that hit a transient failure runs again.
    pub requeue_after: Duration,

    /// Interval at which every resource is reconciled.
    pub resync_interval: Duration,

    /// Simultaneous backend operations per pass.
    pub concurrency: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            requeue_after: DEFAULT_REQUEUE_AFTER,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// What the work queue should do with a key after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub requeue_after: Option<Duration>,
}

impl Action {
    /// Wait for the next change or resync.
    pub fn done() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

/// Status and follow-up of a convergence attempt.
struct Verdict {
    status: VmGroupStatus,
    requeue_after: Option<Duration>,
}

/// Reconciles VmGroups against the inventory.
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    inventory: Arc<dyn Inventory>,
    names: Arc<dyn NameGenerator>,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        inventory: Arc<dyn Inventory>,
        names: Arc<dyn NameGenerator>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            inventory,
            names,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Run one pass for `key`.
    #[instrument(skip(self, key), fields(group = %key))]
    pub async fn reconcile(&self, key: &GroupKey) -> Result<Action, ReconcileError> {
        let Some(group) = self.store.get(key).await? else {
            debug!("Resource gone, nothing to reconcile");
            return Ok(Action::done());
        };

        match LifecycleState::of(Some(&group)) {
            LifecycleState::Active => {}
            LifecycleState::Deleting => {
                self.finalize(group).await?;
                return Ok(Action::done());
            }
            LifecycleState::Removed => {
                debug!("Deletion requested, finalizer already cleared");
                return Ok(Action::done());
            }
        }

        let Some(group) = self.ensure_finalizer(group).await? else {
            return Ok(Action::done());
        };

        let verdict = self.converge(&group).await;
        let action = Action {
            requeue_after: verdict.requeue_after,
        };
        self.write_status(group, verdict.status).await?;
        Ok(action)
    }

    /// Tear down the backend group and release the record.
    async fn finalize(&self, mut group: VmGroup) -> Result<(), ReconcileError> {
        let key = group.key();
        let limiter = Limiter::new(self.config.concurrency);

        let report = teardown(self.inventory.as_ref(), &key.group_name(), &limiter)
            .await
            .map_err(|source| ReconcileError::Teardown {
                key: key.clone(),
                source,
            })?;

        group.remove_finalizer();
        self.store.update_meta(&group).await?;
        info!(
            group_found = report.group_found,
            replicas_removed = report.replicas_removed,
            "Finalizer removed"
        );
        Ok(())
    }

    /// Register the finalizer if missing. `None` when the record vanished.
    async fn ensure_finalizer(&self, mut group: VmGroup) -> Result<Option<VmGroup>, ReconcileError> {
        if !group.add_finalizer() {
            return Ok(Some(group));
        }
        let updated = self.store.update_meta(&group).await?;
        debug!("Finalizer registered");
        Ok(updated)
    }

    async fn write_status(
        &self,
        mut group: VmGroup,
        status: VmGroupStatus,
    ) -> Result<(), ReconcileError> {
        group.status = Some(status);
        self.store.update_status(&group).await?;
        Ok(())
    }

    async fn converge(&self, group: &VmGroup) -> Verdict {
        let key = group.key();
        let group_name = key.group_name();
        let limiter = Limiter::new(self.config.concurrency);

        match self.inventory.find_group(&group_name).await {
            Ok(handle) => self.scale(group, &handle, &limiter).await,
            Err(InventoryError::NotFound(_)) => {
                let handle = match self.inventory.create_group(&group_name).await {
                    Ok(handle) => handle,
                    Err(e) => {
                        let failure = Failure::permanent("failed to create group", e);
                        return self.failed(failure, None, group);
                    }
                };
                info!(path = %handle.path, "Group created");
                self.create_fresh(group, &handle, &limiter).await
            }
            Err(e) => {
                let failure = Failure::permanent("failed to get group", e);
                self.failed(failure, None, group)
            }
        }
    }

    /// Populate a group that holds no replicas.
    async fn create_fresh(
        &self,
        group: &VmGroup,
        handle: &GroupHandle,
        limiter: &Limiter,
    ) -> Verdict {
        let desired = group.spec.replicas;
        match self
            .create_replicas(group, handle, &HashSet::new(), desired as usize, limiter)
            .await
        {
            Ok(()) => self.succeeded(desired, group),
            Err(e) => {
                let failure = Failure::operation("failed to create replicas", e);
                self.failed(failure, None, group)
            }
        }
    }

    async fn scale(&self, group: &VmGroup, handle: &GroupHandle, limiter: &Limiter) -> Verdict {
        let replicas = match self.inventory.list_replicas(&handle.name).await {
            Ok(replicas) => replicas,
            Err(InventoryError::NotFound(_)) => {
                debug!("Group holds no replicas");
                return self.create_fresh(group, handle, limiter).await;
            }
            Err(e) => {
                let failure = Failure::permanent("failed to list replicas", e);
                return self.failed(failure, None, group);
            }
        };

        let observed = replicas.len();
        let existing: HashSet<String> = replicas.iter().map(|r| r.name.clone()).collect();
        let plan = ConvergencePlan::compute(replicas, group.spec.replicas as usize);
        let expected = plan.expected_count(observed);
        debug!(observed, plan = plan.kind(), "Convergence plan computed");

        let result = match plan {
            ConvergencePlan::Create { count } => {
                info!(observed, count, "Scaling up");
                self.create_replicas(group, handle, &existing, count, limiter)
                    .await
                    .map_err(|e| Failure::operation("failed to scale up replicas", e))
            }
            ConvergencePlan::Delete { victims } => {
                info!(observed, count = victims.len(), "Scaling down");
                self.delete_replicas(&victims, limiter)
                    .await
                    .map_err(|e| Failure::operation("failed to scale down replicas", e))
            }
            ConvergencePlan::VerifyPower { replicas } => self
                .verify_power(&replicas, limiter)
                .await
                .map_err(|e| Failure::operation("failed to verify replica power state", e)),
        };

        match result {
            Ok(()) => self.succeeded(expected as u32, group),
            Err(failure) => self.failed(failure, Some(observed as u32), group),
        }
    }

    async fn create_replicas(
        &self,
        group: &VmGroup,
        handle: &GroupHandle,
        existing: &HashSet<String>,
        count: usize,
        limiter: &Limiter,
    ) -> Result<(), InventoryError> {
        let requests: Vec<CloneRequest> =
            unique_names(self.names.as_ref(), &group.metadata.name, existing, count)
                .into_iter()
                .map(|name| CloneRequest {
                    template: group.spec.template.clone(),
                    name,
                    group: handle.clone(),
                    cpu: group.spec.cpu,
                    memory_gb: group.spec.memory,
                })
                .collect();

        let inventory = self.inventory.as_ref();
        let created = fan_out(limiter, requests.iter(), |request| async move {
            let replica = inventory.clone_replica(request).await?;
            info!(replica = %replica, "Replica created");
            Ok::<_, InventoryError>(replica)
        })
        .await
        .into_result()?;

        debug!(count = created.len(), "Replicas created");
        Ok(())
    }

    async fn delete_replicas(
        &self,
        victims: &[ReplicaHandle],
        limiter: &Limiter,
    ) -> Result<(), InventoryError> {
        let inventory = self.inventory.as_ref();
        fan_out(limiter, victims.iter(), |replica| async move {
            remove_replica(inventory, replica).await?;
            info!(replica = %replica, "Replica deleted");
            Ok::<_, InventoryError>(())
        })
        .await
        .into_result()?;
        Ok(())
    }

    /// Power on every replica found powered off.
    async fn verify_power(
        &self,
        replicas: &[ReplicaHandle],
        limiter: &Limiter,
    ) -> Result<(), InventoryError> {
        let inventory = self.inventory.as_ref();
        let observed = fan_out(limiter, replicas.iter(), |replica| async move {
            let state = inventory.power_state(replica).await?;
            Ok::<_, InventoryError>((replica, state))
        })
        .await
        .into_result()?;

        let off: Vec<&ReplicaHandle> = power_repairs(observed);
        if off.is_empty() {
            return Ok(());
        }

        fan_out(limiter, off, |replica| async move {
            inventory.power_on(replica).await?;
            info!(replica = %replica, "Replica powered on");
            Ok::<_, InventoryError>(())
        })
        .await
        .into_result()?;
        Ok(())
    }

    fn succeeded(&self, current: u32, group: &VmGroup) -> Verdict {
        info!(current, desired = group.spec.replicas, "Reconciled");
        Verdict {
            status: status::running(current, group.spec.replicas),
            requeue_after: None,
        }
    }

    fn failed(&self, failure: Failure, current: Option<u32>, group: &VmGroup) -> Verdict {
        warn!(
            class = ?failure.class,
            error = %failure.error,
            "{}",
            failure.summary
        );
        Verdict {
            status: failure.status(current, group.spec.replicas),
            requeue_after: failure.requeue_after(self.config.requeue_after),
        }
    }
}
