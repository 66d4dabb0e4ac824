//! VmGroup resource model.
//!
//! A VmGroup declares a set of identical VM replicas cloned from a template.
//! The store owns `spec` and `metadata`; the reconciler owns `status` and the
//! controller's finalizer entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Finalizer registered on every VmGroup the controller manages.
pub const FINALIZER: &str = "vm-operator";

/// Status message written after a clean pass.
pub const SUCCESS_MESSAGE: &str = "successfully reconciled VmGroup";

/// Store key of a VmGroup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub namespace: String,
    pub name: String,
}

impl GroupKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Name of the backend group holding this resource's replicas.
    pub fn group_name(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired state. Bounds are enforced by the store on admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VmGroupSpec {
    /// vCPUs per replica.
    #[validate(range(min = 1, max = 4))]
    pub cpu: u32,

    /// Memory per replica in GB.
    #[validate(range(min = 1, max = 8))]
    pub memory: u32,

    /// Clonable source image.
    #[validate(length(min = 1))]
    pub template: String,

    /// Desired replica count.
    #[validate(range(min = 1))]
    pub replicas: u32,
}

/// Phase reported in status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusPhase {
    Pending,
    Running,
    Error,
}

impl StatusPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for StatusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state, written by the reconciler once per pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmGroupStatus {
    pub phase: StatusPhase,

    /// Replica count at the time of writing; absent when unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_replicas: Option<u32>,

    pub desired_replicas: u32,

    pub last_message: String,
}

/// Store metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    pub namespace: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// Set when deletion was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    /// Bumped by the store on every write; used for compare-and-set.
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            finalizers: Vec::new(),
            deletion_timestamp: None,
            resource_version: 0,
        }
    }
}

/// A declared group of VM replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmGroup {
    pub metadata: ObjectMeta,

    pub spec: VmGroupSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VmGroupStatus>,
}

impl VmGroup {
    pub fn new(metadata: ObjectMeta, spec: VmGroupSpec) -> Self {
        Self {
            metadata,
            spec,
            status: None,
        }
    }

    pub fn key(&self) -> GroupKey {
        GroupKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// True once deletion was requested.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata.finalizers.iter().any(|f| f == FINALIZER)
    }

    /// Register the controller finalizer. Returns false if already present.
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.metadata.finalizers.push(FINALIZER.to_string());
        true
    }

    /// Drop the controller finalizer, keeping any others. Returns false if
    /// it was not present.
    pub fn remove_finalizer(&mut self) -> bool {
        let before = self.metadata.finalizers.len();
        self.metadata.finalizers.retain(|f| f != FINALIZER);
        self.metadata.finalizers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmGroupSpec {
        VmGroupSpec {
            cpu: 2,
            memory: 4,
            template: "ubuntu-22.04".to_string(),
            replicas: 3,
        }
    }

    #[test]
    fn test_group_name() {
        let key = GroupKey::new("default", "web");
        assert_eq!(key.group_name(), "default-web");
        assert_eq!(key.to_string(), "default/web");
    }

    #[test]
    fn test_finalizer_add_remove() {
        let mut group = VmGroup::new(ObjectMeta::new("default", "web"), spec());
        group.metadata.finalizers.push("other.io/guard".to_string());

        assert!(!group.has_finalizer());
        assert!(group.add_finalizer());
        assert!(!group.add_finalizer());
        assert!(group.has_finalizer());

        assert!(group.remove_finalizer());
        assert!(!group.remove_finalizer());
        assert_eq!(group.metadata.finalizers, vec!["other.io/guard".to_string()]);
    }

    #[test]
    fn test_spec_bounds() {
        assert!(spec().validate().is_ok());

        let mut bad = spec();
        bad.cpu = 5;
        assert!(bad.validate().is_err());

        let mut bad = spec();
        bad.memory = 0;
        assert!(bad.validate().is_err());

        let mut bad = spec();
        bad.replicas = 0;
        assert!(bad.validate().is_err());

        let mut bad = spec();
        bad.template.clear();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let status = VmGroupStatus {
            phase: StatusPhase::Running,
            current_replicas: None,
            desired_replicas: 3,
            last_message: SUCCESS_MESSAGE.to_string(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "phase": "RUNNING",
                "desiredReplicas": 3,
                "lastMessage": "successfully reconciled VmGroup",
            })
        );
    }
}
