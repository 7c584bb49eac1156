//! Plan CRD
//!
//! A Plan is the declarative intent: which VMs move from which source
//! provider to which namespace, with which network and storage maps.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ProviderPair, Ref, ResourceRef};

/// Plan declares a set of VMs to migrate together
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Plan",
    plural = "plans",
    namespaced,
    status = "PlanStatus",
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.provider.source.name"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetNamespace"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Source and destination providers
    pub provider: ProviderPair,

    /// Namespace receiving the migrated VMs
    pub target_namespace: String,

    /// Network and storage maps
    pub map: PlanMap,

    /// VMs to migrate
    #[serde(default)]
    pub vms: Vec<PlanVm>,

    /// Legacy warm flag; superseded by `type`
    #[serde(default)]
    pub warm: bool,

    /// Migration type
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<MigrationType>,

    /// NetworkAttachmentDefinition used for disk transfer traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_network: Option<ResourceRef>,

    /// Labels added to every created VM
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_labels: BTreeMap<String, String>,

    /// Template for PVC names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_name_template: Option<String>,

    /// Render the PVC template into `generateName` instead of `name`
    #[serde(default)]
    pub pvc_name_template_use_generate_name: bool,

    /// Migrate disks shared with other VMs
    #[serde(default = "default_true")]
    pub migrate_shared_disks: bool,

    /// Keep source static IPs on the destination
    #[serde(default)]
    pub preserve_static_ips: bool,

    /// Use SATA/E1000e devices instead of virtio
    #[serde(default)]
    pub use_compatibility_mode: bool,

    /// Power state of created VMs ("on", "off", or unset to match the source)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_power_state: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Network and storage map references
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PlanMap {
    /// NetworkMap reference
    pub network: ResourceRef,
    /// StorageMap reference
    pub storage: ResourceRef,
}

/// A VM selected by a plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanVm {
    /// Source VM reference
    #[serde(flatten)]
    pub vm_ref: Ref,

    /// Per-VM PVC name template; overrides the plan template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_name_template: Option<String>,

    /// Destination VM name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,

    /// KubeVirt instance type to use instead of explicit CPU/memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
}

/// Migration type
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    /// Source VM is powered off for the whole transfer
    #[default]
    Cold,
    /// Incremental precopies while the source runs, then a short cutover
    Warm,
    /// KubeVirt live migration (openshift sources only)
    Live,
    /// Convert disks already present on the destination
    Conversion,
}

impl std::fmt::Display for MigrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cold => write!(f, "cold"),
            Self::Warm => write!(f, "warm"),
            Self::Live => write!(f, "live"),
            Self::Conversion => write!(f, "conversion"),
        }
    }
}

impl PlanSpec {
    /// Effective migration type; `type` wins over the legacy warm flag
    pub fn migration_type(&self) -> MigrationType {
        match self.type_ {
            Some(t) => t,
            None if self.warm => MigrationType::Warm,
            None => MigrationType::Cold,
        }
    }

    /// Whether this is a warm migration
    pub fn is_warm(&self) -> bool {
        self.migration_type() == MigrationType::Warm
    }

    /// The plan entry for a VM
    pub fn find_vm(&self, vm: &Ref) -> Option<&PlanVm> {
        self.vms.iter().find(|v| v.vm_ref.matches(vm))
    }

    /// Effective PVC name template for a VM: per-VM first, then plan-wide
    pub fn pvc_name_template_for(&self, vm: &Ref) -> Option<&str> {
        self.find_vm(vm)
            .and_then(|v| v.pvc_name_template.as_deref())
            .or(self.pvc_name_template.as_deref())
            .filter(|t| !t.is_empty())
    }
}

/// Status of a Plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    /// Status conditions (Ready, Executing, Succeeded, Failed)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation observed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> PlanSpec {
        serde_json::from_value(serde_json::json!({
            "provider": {
                "source": {"name": "vcenter", "namespace": "forklift"},
                "destination": {"name": "host", "namespace": "forklift"}
            },
            "targetNamespace": "migrated",
            "map": {
                "network": {"name": "net-map"},
                "storage": {"name": "storage-map"}
            },
            "vms": [
                {"id": "vm-1", "pvcNameTemplate": "{{ VmName }}-{{ DiskIndex }}"},
                {"id": "vm-2", "name": "db"}
            ],
            "pvcNameTemplate": "{{ PlanName }}-{{ DiskIndex }}"
        }))
        .unwrap()
    }

    #[test]
    fn defaults_from_minimal_manifest() {
        let spec = spec();
        assert_eq!(spec.migration_type(), MigrationType::Cold);
        assert!(spec.migrate_shared_disks);
        assert!(!spec.pvc_name_template_use_generate_name);
        assert_eq!(spec.vms[1].vm_ref.name, "db");
    }

    #[test]
    fn type_overrides_warm_flag() {
        let mut spec = spec();
        spec.warm = true;
        assert!(spec.is_warm());
        spec.type_ = Some(MigrationType::Live);
        assert_eq!(spec.migration_type(), MigrationType::Live);
    }

    #[test]
    fn per_vm_template_wins() {
        let spec = spec();
        assert_eq!(
            spec.pvc_name_template_for(&Ref::with_id("vm-1")),
            Some("{{ VmName }}-{{ DiskIndex }}")
        );
        assert_eq!(
            spec.pvc_name_template_for(&Ref::with_id("vm-2")),
            Some("{{ PlanName }}-{{ DiskIndex }}")
        );
    }
}
