//! Failure classification and status projection.
//!
//! Absence answers from the inventory select branches and never reach this
//! module. Everything that does is either permanent (ERROR, wait for the next
//! external trigger) or transient (PENDING, retry after the requeue delay).

use std::time::Duration;

use crate::inventory::InventoryError;
use crate::resource::{StatusPhase, VmGroupStatus, SUCCESS_MESSAGE};

/// How a failed pass is reported and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retrying without an external change will not help.
    Permanent,

    /// Worth retrying after the requeue delay.
    Transient,
}

impl FailureClass {
    /// Classify a failed replica operation.
    ///
    /// A not-found answer at this stage means something the pass depends on
    /// (the clone template, the destination group) is missing.
    pub fn of_operation(err: &InventoryError) -> Self {
        if err.is_not_found() {
            Self::Permanent
        } else {
            Self::Transient
        }
    }

    pub fn phase(self) -> StatusPhase {
        match self {
            Self::Permanent => StatusPhase::Error,
            Self::Transient => StatusPhase::Pending,
        }
    }
}

/// A classified pass failure.
#[derive(Debug, Clone)]
pub struct Failure {
    pub class: FailureClass,
    pub summary: &'static str,
    pub error: InventoryError,
}

impl Failure {
    /// Failure of a group lookup, group creation or replica listing.
    pub fn permanent(summary: &'static str, error: InventoryError) -> Self {
        Self {
            class: FailureClass::Permanent,
            summary,
            error,
        }
    }

    /// Failure of a replica operation, classified from the error.
    pub fn operation(summary: &'static str, error: InventoryError) -> Self {
        Self {
            class: FailureClass::of_operation(&error),
            summary,
            error,
        }
    }

    pub fn message(&self) -> String {
        format!("{}: {}", self.summary, self.error)
    }

    /// Requeue delay to return for this failure.
    pub fn requeue_after(&self, delay: Duration) -> Option<Duration> {
        match self.class {
            FailureClass::Permanent => None,
            FailureClass::Transient => Some(delay),
        }
    }

    /// Status to write for this failure.
    pub fn status(&self, current: Option<u32>, desired: u32) -> VmGroupStatus {
        VmGroupStatus {
            phase: self.class.phase(),
            current_replicas: current,
            desired_replicas: desired,
            last_message: self.message(),
        }
    }
}

/// Status written after a clean pass.
pub fn running(current: u32, desired: u32) -> VmGroupStatus {
    VmGroupStatus {
        phase: StatusPhase::Running,
        current_replicas: Some(current),
        desired_replicas: desired,
        last_message: SUCCESS_MESSAGE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::missing_template(InventoryError::NotFound("template \"ubuntu\"".into()), StatusPhase::Error)]
    #[case::backend_task(InventoryError::task_failed("clone", "disk full"), StatusPhase::Pending)]
    #[case::unreachable(InventoryError::Unavailable("connection reset".into()), StatusPhase::Pending)]
    fn test_operation_classification(#[case] error: InventoryError, #[case] phase: StatusPhase) {
        let failure = Failure::operation("failed to create replicas", error);
        assert_eq!(failure.class.phase(), phase);
    }

    #[test]
    fn test_permanent_never_requeues() {
        let failure = Failure::permanent(
            "failed to list replicas",
            InventoryError::Unavailable("timeout".into()),
        );
        assert_eq!(failure.requeue_after(Duration::from_secs(20)), None);

        let status = failure.status(Some(2), 3);
        assert_eq!(status.phase, StatusPhase::Error);
        assert_eq!(status.current_replicas, Some(2));
        assert_eq!(
            status.last_message,
            "failed to list replicas: inventory unavailable: timeout"
        );
    }

    #[test]
    fn test_transient_requeues_with_delay() {
        let failure = Failure::operation(
            "failed to create replicas",
            InventoryError::task_failed("clone \"web-replica-a\"", "host busy"),
        );
        assert_eq!(
            failure.requeue_after(Duration::from_secs(20)),
            Some(Duration::from_secs(20))
        );

        let status = failure.status(None, 3);
        assert_eq!(status.phase, StatusPhase::Pending);
        assert_eq!(status.current_replicas, None);
        assert!(status.last_message.ends_with("host busy"));
    }

    #[test]
    fn test_running() {
        let status = running(3, 3);
        assert_eq!(status.phase, StatusPhase::Running);
        assert_eq!(status.current_replicas, Some(3));
        assert_eq!(status.last_message, SUCCESS_MESSAGE);
    }
}
