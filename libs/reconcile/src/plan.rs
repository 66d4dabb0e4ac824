//! Convergence decisions for a replica group.
//!
//! [`ConvergencePlan::compute`] is a pure function of the observed replica
//! listing and the desired count:
//!
//! - fewer replicas than desired: create the difference
//! - more replicas than desired: delete the difference, taken from the head
//!   of the listing
//! - equal: verify power state and power on whatever is off
//!
//! Victims are chosen in the order the backend listed them. No sort is
//! applied, and backend listing order is not guaranteed to be stable between
//! calls, so which replicas go away on scale-down is not deterministic across
//! backends.

/// Observed power state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    On,
    Off,
}

impl PowerState {
    pub fn is_on(&self) -> bool {
        matches!(self, Self::On)
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

/// Action set for one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergencePlan<R> {
    /// Create `count` new replicas.
    Create { count: usize },

    /// Delete these replicas.
    Delete { victims: Vec<R> },

    /// Replica count matches; check power state of these replicas.
    VerifyPower { replicas: Vec<R> },
}

impl<R> ConvergencePlan<R> {
    /// Decide what to do with `current` given `desired` replicas.
    pub fn compute(current: Vec<R>, desired: usize) -> Self {
        let observed = current.len();
        if observed < desired {
            Self::Create {
                count: desired - observed,
            }
        } else if observed > desired {
            Self::Delete {
                victims: select_victims(current, observed - desired),
            }
        } else {
            Self::VerifyPower { replicas: current }
        }
    }

    /// Number of replicas the group should hold once the plan succeeded,
    /// given how many were observed.
    pub fn expected_count(&self, observed: usize) -> usize {
        match self {
            Self::Create { count } => observed + count,
            Self::Delete { victims } => observed.saturating_sub(victims.len()),
            Self::VerifyPower { .. } => observed,
        }
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Delete { .. } => "delete",
            Self::VerifyPower { .. } => "verify-power",
        }
    }
}

/// Take `count` replicas from the head of the listing.
pub fn select_victims<R>(listing: Vec<R>, count: usize) -> Vec<R> {
    listing.into_iter().take(count).collect()
}

/// Replicas that need a power-on, preserving listing order.
pub fn power_repairs<R, I>(observed: I) -> Vec<R>
where
    I: IntoIterator<Item = (R, PowerState)>,
{
    observed
        .into_iter()
        .filter(|(_, state)| !state.is_on())
        .map(|(replica, _)| replica)
        .collect()
}
