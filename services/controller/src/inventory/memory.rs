//! In-process inventory.
//!
//! Behaves like a folder-based virtualization inventory:
//! - groups are folders under a fixed root path
//! - listing a group that holds no VMs reports not-found, like a pattern
//!   lookup that matched nothing
//! - replicas are listed in creation order
//! - deleting something that is already gone succeeds
//!
//! Faults can be injected per operation, and every call is counted so tests
//! can assert exactly which backend operations a pass issued.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{CloneRequest, GroupHandle, Inventory, InventoryError, PowerState, ReplicaHandle};

/// Default root folder for groups.
pub const DEFAULT_ROOT: &str = "/dc/vm/vm-operator";

/// Inventory operations, for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    FindGroup,
    CreateGroup,
    ListReplicas,
    CloneReplica,
    PowerState,
    PowerOn,
    PowerOff,
    DeleteReplica,
    DeleteGroup,
}

impl Operation {
    /// True for operations that change backend state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Operation::FindGroup | Operation::ListReplicas | Operation::PowerState
        )
    }
}

#[derive(Debug, Clone)]
struct ReplicaEntry {
    id: String,
    name: String,
    power: PowerState,
}

#[derive(Debug, Default)]
struct GroupEntry {
    replicas: Vec<ReplicaEntry>,
}

#[derive(Debug, Default)]
struct State {
    groups: BTreeMap<String, GroupEntry>,
    templates: HashSet<String>,
    next_id: u64,
    faults: HashMap<Operation, VecDeque<InventoryError>>,
    calls: HashMap<Operation, usize>,
}

impl State {
    fn find_replica_mut(&mut self, id: &str) -> Option<&mut ReplicaEntry> {
        self.groups
            .values_mut()
            .flat_map(|g| g.replicas.iter_mut())
            .find(|r| r.id == id)
    }

    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("vm-{}", self.next_id)
    }
}

/// In-memory inventory.
pub struct MemoryInventory {
    latency: Duration,
    state: Mutex<State>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts a call as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryInventory {
    /// Create an empty inventory that knows the given templates.
    pub fn new<I, S>(templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = State {
            templates: templates.into_iter().map(Into::into).collect(),
            ..State::default()
        };
        Self {
            latency: Duration::ZERO,
            state: Mutex::new(state),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Simulate backend latency on every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next call of `operation` fail with `error`. Faults queue up.
    pub fn fail_next(&self, operation: Operation, error: InventoryError) {
        self.lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Create a group holding replicas with the given names and power states,
    /// bypassing call accounting.
    pub fn seed_group(&self, group: &str, replicas: &[(&str, PowerState)]) {
        let mut state = self.lock();
        let mut entries = Vec::with_capacity(replicas.len());
        for (name, power) in replicas {
            let id = state.allocate_id();
            entries.push(ReplicaEntry {
                id,
                name: name.to_string(),
                power: *power,
            });
        }
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .replicas
            .extend(entries);
    }

    /// Remove a group and its replicas out of band, as an operator would.
    pub fn remove_group(&self, group: &str) -> bool {
        self.lock().groups.remove(group).is_some()
    }

    /// Remove a single replica out of band.
    pub fn remove_replica_by_name(&self, group: &str, name: &str) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.groups.get_mut(group) else {
            return false;
        };
        let before = entry.replicas.len();
        entry.replicas.retain(|r| r.name != name);
        entry.replicas.len() != before
    }

    /// Set the power state of a replica out of band.
    pub fn set_power(&self, group: &str, name: &str, power: PowerState) -> bool {
        let mut state = self.lock();
        let replica = state
            .groups
            .get_mut(group)
            .and_then(|g| g.replicas.iter_mut().find(|r| r.name == name));
        match replica {
            Some(replica) => {
                replica.power = power;
                true
            }
            None => false,
        }
    }

    pub fn group_exists(&self, group: &str) -> bool {
        self.lock().groups.contains_key(group)
    }

    /// Replica names of a group in listing order.
    pub fn replica_names(&self, group: &str) -> Vec<String> {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.replicas.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Power state of a replica by name.
    pub fn power_of(&self, group: &str, name: &str) -> Option<PowerState> {
        self.lock()
            .groups
            .get(group)
            .and_then(|g| g.replicas.iter().find(|r| r.name == name))
            .map(|r| r.power)
    }

    /// Number of calls of `operation` so far, including failed ones.
    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Number of state-changing calls so far.
    pub fn mutations(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(op, _)| op.is_mutation())
            .map(|(_, n)| n)
            .sum()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Forget call counts and the in-flight peak.
    pub fn reset_counters(&self) {
        self.lock().calls.clear();
        self.peak_in_flight.store(0, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call; the state is
        // still usable for inspection.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn group_path(&self, group: &str) -> String {
        format!("{DEFAULT_ROOT}/{group}")
    }

    /// Account for a call, wait out the simulated latency and return any
    /// injected fault.
    async fn enter(&self, operation: Operation) -> Result<InFlight<'_>, InventoryError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let fault = {
            let mut state = self.lock();
            *state.calls.entry(operation).or_default() += 1;
            state.faults.get_mut(&operation).and_then(VecDeque::pop_front)
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match fault {
            Some(error) => {
                debug!(?operation, error = %error, "Injected inventory fault");
                Err(error)
            }
            None => Ok(guard),
        }
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn find_group(&self, group: &str) -> Result<GroupHandle, InventoryError> {
        let _call = self.enter(Operation::FindGroup).await?;
        if self.lock().groups.contains_key(group) {
            Ok(GroupHandle {
                name: group.to_string(),
                path: self.group_path(group),
            })
        } else {
            Err(InventoryError::NotFound(format!(
                "folder '{}' not found",
                self.group_path(group)
            )))
        }
    }

    async fn create_group(&self, group: &str) -> Result<GroupHandle, InventoryError> {
        let _call = self.enter(Operation::CreateGroup).await?;
        let mut state = self.lock();
        if state.groups.contains_key(group) {
            return Err(InventoryError::task_failed(
                "create group",
                format!("the name '{group}' already exists"),
            ));
        }
        state.groups.insert(group.to_string(), GroupEntry::default());
        info!(group, "[MEMORY] Group created");
        Ok(GroupHandle {
            name: group.to_string(),
            path: self.group_path(group),
        })
    }

    async fn list_replicas(&self, group: &str) -> Result<Vec<ReplicaHandle>, InventoryError> {
        let _call = self.enter(Operation::ListReplicas).await?;
        let state = self.lock();
        let path = self.group_path(group);
        let Some(entry) = state.groups.get(group) else {
            return Err(InventoryError::NotFound(format!("folder '{path}' not found")));
        };
        if entry.replicas.is_empty() {
            return Err(InventoryError::NotFound(format!("vm '{path}/*' not found")));
        }
        Ok(entry
            .replicas
            .iter()
            .map(|r| ReplicaHandle {
                id: r.id.clone(),
                name: r.name.clone(),
            })
            .collect())
    }

    async fn clone_replica(&self, request: &CloneRequest) -> Result<ReplicaHandle, InventoryError> {
        let _call = self.enter(Operation::CloneReplica).await?;
        let mut state = self.lock();
        if !state.templates.contains(&request.template) {
            return Err(InventoryError::NotFound(format!(
                "vm '{}' not found",
                request.template
            )));
        }
        if !state.groups.contains_key(&request.group.name) {
            return Err(InventoryError::NotFound(format!(
                "folder '{}' not found",
                request.group.path
            )));
        }
        let duplicate = state.groups[&request.group.name]
            .replicas
            .iter()
            .any(|r| r.name == request.name);
        if duplicate {
            return Err(InventoryError::task_failed(
                "clone",
                format!("the name '{}' already exists", request.name),
            ));
        }

        let id = state.allocate_id();
        let replica = ReplicaEntry {
            id: id.clone(),
            name: request.name.clone(),
            power: PowerState::On,
        };
        if let Some(group) = state.groups.get_mut(&request.group.name) {
            group.replicas.push(replica);
        }
        info!(
            replica = %request.name,
            template = %request.template,
            cpu = request.cpu,
            memory_mb = request.memory_mb(),
            "[MEMORY] Replica cloned"
        );
        Ok(ReplicaHandle {
            id,
            name: request.name.clone(),
        })
    }

    async fn power_state(&self, replica: &ReplicaHandle) -> Result<PowerState, InventoryError> {
        let _call = self.enter(Operation::PowerState).await?;
        self.lock()
            .find_replica_mut(&replica.id)
            .map(|r| r.power)
            .ok_or_else(|| InventoryError::NotFound(format!("vm '{}' not found", replica.name)))
    }

    async fn power_on(&self, replica: &ReplicaHandle) -> Result<(), InventoryError> {
        let _call = self.enter(Operation::PowerOn).await?;
        let mut state = self.lock();
        let entry = state
            .find_replica_mut(&replica.id)
            .ok_or_else(|| InventoryError::NotFound(format!("vm '{}' not found", replica.name)))?;
        entry.power = PowerState::On;
        debug!(replica = %replica.name, "[MEMORY] Powered on");
        Ok(())
    }

    async fn power_off(&self, replica: &ReplicaHandle) -> Result<(), InventoryError> {
        let _call = self.enter(Operation::PowerOff).await?;
        let mut state = self.lock();
        let entry = state
            .find_replica_mut(&replica.id)
            .ok_or_else(|| InventoryError::NotFound(format!("vm '{}' not found", replica.name)))?;
        entry.power = PowerState::Off;
        debug!(replica = %replica.name, "[MEMORY] Powered off");
        Ok(())
    }

    async fn delete_replica(&self, replica: &ReplicaHandle) -> Result<(), InventoryError> {
        let _call = self.enter(Operation::DeleteReplica).await?;
        let mut state = self.lock();
        for group in state.groups.values_mut() {
            if let Some(pos) = group.replicas.iter().position(|r| r.id == replica.id) {
                group.replicas.remove(pos);
                info!(replica = %replica.name, "[MEMORY] Replica deleted");
                return Ok(());
            }
        }
        debug!(replica = %replica.name, "[MEMORY] Replica already gone");
        Ok(())
    }

    async fn delete_group(&self, group: &GroupHandle) -> Result<(), InventoryError> {
        let _call = self.enter(Operation::DeleteGroup).await?;
        let mut state = self.lock();
        let held = state.groups.get(&group.name).map(|g| g.replicas.len());
        match held {
            None => {
                debug!(group = %group.name, "[MEMORY] Group already gone");
                Ok(())
            }
            Some(held) if held > 0 => Err(InventoryError::task_failed(
                "delete group",
                format!("folder '{}' still holds {} vm(s)", group.path, held),
            )),
            Some(_) => {
                state.groups.remove(&group.name);
                info!(group = %group.name, "[MEMORY] Group deleted");
                Ok(())
            }
        }
    }
}
