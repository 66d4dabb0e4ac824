//! Shared fixtures for controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vmop_controller::inventory::MemoryInventory;
use vmop_controller::{
    ControllerConfig, GroupKey, MemoryStore, Reconciler, ResourceStore, VmGroup, VmGroupSpec,
    VmGroupStatus,
};
use vmop_reconcile::SequentialNames;

pub const TEMPLATE: &str = "ubuntu-22.04";
pub const NAMESPACE: &str = "default";
pub const NAME: &str = "web";
/// Backend group of `default/web`.
pub const GROUP: &str = "default-web";

pub fn spec(replicas: u32) -> VmGroupSpec {
    VmGroupSpec {
        cpu: 2,
        memory: 4,
        template: TEMPLATE.to_string(),
        replicas,
    }
}

pub fn key() -> GroupKey {
    GroupKey::new(NAMESPACE, NAME)
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub inventory: Arc<MemoryInventory>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(MemoryInventory::new([TEMPLATE]), ControllerConfig::default())
    }

    pub fn with(inventory: MemoryInventory, config: ControllerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let inventory = Arc::new(inventory);
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            inventory.clone(),
            Arc::new(SequentialNames::new()),
            config,
        ));
        Self {
            store,
            inventory,
            reconciler,
        }
    }

    pub async fn apply(&self, replicas: u32) -> VmGroup {
        self.store.apply(NAMESPACE, NAME, spec(replicas)).await.unwrap()
    }

    pub async fn group(&self) -> Option<VmGroup> {
        self.store.get(&key()).await.unwrap()
    }

    pub async fn status(&self) -> VmGroupStatus {
        self.group()
            .await
            .and_then(|g| g.status)
            .expect("status written")
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
