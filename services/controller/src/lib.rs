//! VmGroup controller.
//!
//! Converges declared groups of identical VM replicas against a
//! virtualization inventory and reports progress in each group's status.
//!
//! ## Architecture
//!
//! - **Store**: holds VmGroup records, finalizers and status
//! - **Inventory**: backend adapter (in-memory in dev, REST in prod)
//! - **Reconciler**: one pass per trigger, delegating decisions to
//!   `vmop-reconcile` and bounding backend calls per pass
//! - **Teardown**: finalizer-guarded removal of backend objects
//! - **Controller**: work queue fed by store events, resyncs and requeues

pub mod config;
pub mod controller;
pub mod error;
pub mod inventory;
pub mod manifest;
pub mod reconciler;
pub mod resource;
pub mod status;
pub mod store;
pub mod teardown;

pub use controller::Controller;
pub use error::ReconcileError;
pub use reconciler::{Action, ControllerConfig, Reconciler};
pub use resource::{GroupKey, StatusPhase, VmGroup, VmGroupSpec, VmGroupStatus};
pub use store::{MemoryStore, ResourceStore, StoreError};
