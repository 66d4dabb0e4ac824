//! Reconciliation primitives for replica groups.
//!
//! This library holds the backend-agnostic parts of the VmGroup controller:
//!
//! - **Convergence plan**: what to do given observed replicas and a desired count.
//! - **Limiter**: a counting semaphore capping simultaneous backend calls.
//! - **Fan-out**: runs one operation per item under a limiter and stops
//!   issuing new calls after the first failure.
//! - **Naming**: injectable replica name generation.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - No more than `capacity` operations are in flight per limiter
//! - A fan-out returns only after every issued operation completed

use std::time::Duration;

pub mod fanout;
pub mod limiter;
pub mod naming;
pub mod plan;

pub use fanout::{fan_out, FanOut, FanOutError};
pub use limiter::{AcquireError, Limiter, Token, DEFAULT_CONCURRENCY};
pub use naming::{unique_names, NameGenerator, RandomNames, SequentialNames};
pub use plan::{power_repairs, select_victims, ConvergencePlan, PowerState};

/// Delay before a pass that hit a transient failure is retried.
pub const DEFAULT_REQUEUE_AFTER: Duration = Duration::from_secs(20);

/// Interval at which every resource is reconciled regardless of events.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
