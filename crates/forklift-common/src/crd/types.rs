//! Shared types used across Forklift CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Supported source/destination provider kinds
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// VMware vSphere
    #[default]
    Vsphere,
    /// Red Hat Virtualization / oVirt
    Ovirt,
    /// OpenStack
    OpenStack,
    /// OVA appliances served from an NFS share
    Ova,
    /// KubeVirt on OpenShift/Kubernetes (local or remote cluster)
    #[serde(alias = "ocp")]
    Openshift,
    /// Microsoft Hyper-V
    HyperV,
    /// Out-of-process provider described by a schema
    Dynamic,
}

impl ProviderType {
    /// Whether the provider supports warm migration at all
    pub fn supports_warm(&self) -> bool {
        matches!(self, Self::Vsphere | Self::Ovirt | Self::Dynamic)
    }
}

impl std::str::FromStr for ProviderType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vsphere" => Ok(Self::Vsphere),
            "ovirt" => Ok(Self::Ovirt),
            "openstack" => Ok(Self::OpenStack),
            "ova" => Ok(Self::Ova),
            "openshift" | "ocp" => Ok(Self::Openshift),
            "hyperv" => Ok(Self::HyperV),
            "dynamic" => Ok(Self::Dynamic),
            _ => Err(crate::Error::validation(format!(
                "invalid provider type: {s}, expected one of: vsphere, ovirt, openstack, ova, openshift, hyperv, dynamic"
            ))),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vsphere => write!(f, "vsphere"),
            Self::Ovirt => write!(f, "ovirt"),
            Self::OpenStack => write!(f, "openstack"),
            Self::Ova => write!(f, "ova"),
            Self::Openshift => write!(f, "openshift"),
            Self::HyperV => write!(f, "hyperv"),
            Self::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Reference to a source inventory object (VM, network, datastore)
///
/// Either `id` or `name` identifies the object; `id` wins when both are set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Ref {
    /// Inventory identifier
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Object name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Namespace (OpenShift sources only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Object type hint (e.g. "pod", "multus" for network refs)
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
}

impl Ref {
    /// Reference by inventory ID
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Reference by ID and name
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether this reference points at the same object as `other`
    ///
    /// Refs with neither id nor name (the pod network) match on `type`.
    pub fn matches(&self, other: &Ref) -> bool {
        if !self.id.is_empty() && !other.id.is_empty() {
            return self.id == other.id;
        }
        if self.is_empty() && other.is_empty() {
            return !self.type_.is_empty() && self.type_ == other.type_;
        }
        !self.name.is_empty()
            && self.name == other.name
            && (self.namespace.is_empty()
                || other.namespace.is_empty()
                || self.namespace == other.namespace)
    }

    /// Whether both id and name are empty
    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.name.is_empty()
    }
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        };
        match (name.is_empty(), self.id.is_empty()) {
            (false, false) => write!(f, "{} ({})", name, self.id),
            (false, true) => write!(f, "{}", name),
            _ => write!(f, "{}", self.id),
        }
    }
}

/// Reference to a Kubernetes object by name and namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResourceRef {
    /// Object name
    pub name: String,

    /// Object namespace (defaults to the referencing object's namespace)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl ResourceRef {
    /// Create a reference
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Namespace, falling back to `default_ns` when unset
    pub fn namespace_or<'a>(&'a self, default_ns: &'a str) -> &'a str {
        if self.namespace.is_empty() {
            default_ns
        } else {
            &self.namespace
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Source and destination provider of a plan or mapping
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProviderPair {
    /// Source provider
    pub source: ResourceRef,
    /// Destination provider
    pub destination: ResourceRef,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// String form used by `has_condition`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Succeeded, Failed)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Replace the condition of the same type, or append it
///
/// The transition time is kept when the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let keep_time = existing.status == condition.status;
            let time = existing.last_transition_time;
            *existing = condition;
            if keep_time {
                existing.last_transition_time = time;
            }
        }
        None => conditions.push(condition),
    }
}

/// Severity of a validator concern
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    /// Informational
    Information,
    /// Advisory; migration proceeds
    Advisory,
    /// Warning; migration proceeds
    Warn,
    /// Error; migration proceeds but likely degrades
    Error,
    /// Blocks migration of the VM
    Critical,
}

/// A validator finding published on a VM status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Concern {
    /// Stable identifier (condition type), e.g. "MacConflicts"
    pub id: String,
    /// Short human-readable label
    pub label: String,
    /// Severity
    pub category: Category,
    /// Detailed assessment
    pub assessment: String,
}

impl Concern {
    /// Create a concern
    pub fn new(
        id: impl Into<String>,
        category: Category,
        label: impl Into<String>,
        assessment: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            category,
            assessment: assessment.into(),
        }
    }

    /// Whether this concern blocks the VM
    pub fn is_critical(&self) -> bool {
        self.category == Category::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod provider_type {
        use super::*;

        #[test]
        fn test_from_str_accepts_ocp_alias() {
            assert_eq!(
                "ocp".parse::<ProviderType>().unwrap(),
                ProviderType::Openshift
            );
            assert_eq!(
                "OpenShift".parse::<ProviderType>().unwrap(),
                ProviderType::Openshift
            );
            assert_eq!(
                "vsphere".parse::<ProviderType>().unwrap(),
                ProviderType::Vsphere
            );
        }

        #[test]
        fn test_from_str_invalid() {
            let err = "xen".parse::<ProviderType>().unwrap_err();
            assert!(err.to_string().contains("invalid provider type"));
        }

        #[test]
        fn test_display_roundtrips_through_from_str() {
            for t in [
                ProviderType::Vsphere,
                ProviderType::Ovirt,
                ProviderType::OpenStack,
                ProviderType::Ova,
                ProviderType::Openshift,
                ProviderType::HyperV,
                ProviderType::Dynamic,
            ] {
                assert_eq!(t.to_string().parse::<ProviderType>().unwrap(), t);
            }
        }

        #[test]
        fn test_serde_lowercase() {
            let json = serde_json::to_string(&ProviderType::HyperV).unwrap();
            assert_eq!(json, "\"hyperv\"");
            let parsed: ProviderType = serde_json::from_str("\"ocp\"").unwrap();
            assert_eq!(parsed, ProviderType::Openshift);
        }
    }

    mod refs {
        use super::*;

        #[test]
        fn id_wins_over_name() {
            let a = Ref::new("vm-1", "web");
            let b = Ref::new("vm-2", "web");
            assert!(!a.matches(&b));
            assert!(a.matches(&Ref::new("vm-1", "renamed")));
        }

        #[test]
        fn name_match_respects_namespace() {
            let a = Ref {
                name: "net".into(),
                namespace: "ns1".into(),
                ..Default::default()
            };
            let b = Ref {
                name: "net".into(),
                namespace: "ns2".into(),
                ..Default::default()
            };
            assert!(!a.matches(&b));
            assert!(a.matches(&Ref {
                name: "net".into(),
                ..Default::default()
            }));
        }

        #[test]
        fn pod_network_matches_on_type() {
            let pod = Ref {
                type_: "pod".into(),
                ..Default::default()
            };
            assert!(pod.matches(&pod.clone()));
            assert!(!pod.matches(&Ref::default()));
            assert!(!Ref::default().matches(&Ref::default()));
        }

        #[test]
        fn display_forms() {
            assert_eq!(Ref::new("vm-1", "web").to_string(), "web (vm-1)");
            assert_eq!(Ref::with_id("vm-1").to_string(), "vm-1");
            assert_eq!(ResourceRef::new("ns", "plan").to_string(), "ns/plan");
        }
    }

    #[test]
    fn set_condition_keeps_time_when_status_unchanged() {
        let mut conditions = vec![Condition::new("Ready", ConditionStatus::True, "Ok", "a")];
        let first = conditions[0].last_transition_time;
        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "Ok", "b"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "b");
        assert_eq!(conditions[0].last_transition_time, first);
    }

    #[test]
    fn concern_criticality() {
        assert!(Concern::new("MacConflicts", Category::Critical, "l", "a").is_critical());
        assert!(!Concern::new("SharedDisks", Category::Warn, "l", "a").is_critical());
    }
}
