//! Labels and annotations stamped on destination resources
//!
//! These keys are externally observable; changing one breaks lookups of
//! resources created by earlier controller versions.

use std::collections::BTreeMap;

/// Owning Plan UID on owned VM/DV/PVC
pub const LABEL_PLAN: &str = "plan";
/// Owning Migration UID on owned VM/DV/PVC
pub const LABEL_MIGRATION: &str = "migration";
/// Source VM identifier on owned VM/DV/PVC
pub const LABEL_VM_ID: &str = "vmID";
/// Plan name, informational
pub const LABEL_PLAN_NAME: &str = "forklift.konveyor.io/plan-name";

/// Stable per-disk source identifier on DV/PVC
pub const ANNOTATION_DISK_SOURCE: &str = "forklift.konveyor.io/disk-source";
/// Original disk ordinal on DV/PVC
pub const ANNOTATION_DISK_INDEX: &str = "forklift.konveyor.io/disk-index";
/// Triggers the converter for a PVC
pub const ANNOTATION_REQUIRES_CONVERSION: &str = "forklift.konveyor.io/requires-conversion";
/// Input format for the converter
pub const ANNOTATION_SOURCE_FORMAT: &str = "forklift.konveyor.io/source-format";
/// Links a scratch DV back to its source PVC
pub const LABEL_CONVERSION_SOURCE_PVC: &str = "forklift.konveyor.io/conversionSourcePVC";
/// Role of a dynamic-provider DV ("input" or "output")
pub const ANNOTATION_DATAVOLUME_ROLE: &str = "forklift.konveyor.io/datavolume-role";
/// Marks shared ConfigMaps/Secrets created by this controller
pub const ANNOTATION_FORKLIFT_SOURCE: &str = "forklift.konveyor.io/forklift-source";

/// Bypass WaitForFirstConsumer binding
pub const ANNOTATION_BIND_IMMEDIATE: &str = "cdi.kubevirt.io/storage.bind.immediate.requested";
/// Keep the importer pod after completion
pub const ANNOTATION_RETAIN_AFTER_COMPLETION: &str =
    "cdi.kubevirt.io/storage.pod.retainAfterCompletion";
/// VDDK-specific importer arguments (name of a ConfigMap)
pub const ANNOTATION_VDDK_EXTRA_ARGS: &str = "cdi.kubevirt.io/storage.pod.vddk.extraargs";
/// Previous warm checkpoint on a DV
pub const ANNOTATION_PREVIOUS_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.previous";
/// Current warm checkpoint on a DV
pub const ANNOTATION_CURRENT_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.current";
/// Final warm checkpoint marker on a DV
pub const ANNOTATION_FINAL_CHECKPOINT: &str = "cdi.kubevirt.io/storage.checkpoint.done";

/// Allow virt-v2v traffic in a user-defined network
pub const ANNOTATION_OPEN_DEFAULT_PORTS: &str = "k8s.ovn.org/open-default-ports";
/// Static UDN addresses on a VM
pub const ANNOTATION_NETWORK_ADDRESSES: &str = "network.kubevirt.io/addresses";

/// kubemacpool opt-out label on a namespace
pub const LABEL_KUBEMACPOOL_IGNORE: &str = "mutatevirtualmachines.kubemacpool.io";
/// Value of the kubemacpool opt-out label
pub const KUBEMACPOOL_IGNORE_VALUE: &str = "ignore";
/// Comma-joined set of plan UIDs requesting kubemacpool exclusion
pub const ANNOTATION_KUBEMACPOOL_OWNERS: &str = "forklift.konveyor.io/kubemacpool-owners";
/// Marker that this controller applied the kubemacpool label
pub const ANNOTATION_KUBEMACPOOL_MANAGED: &str = "forklift.konveyor.io/kubemacpool-managed";

/// KubeVirt template OS label prefix
pub const TEMPLATE_OS_LABEL_PREFIX: &str = "os.template.kubevirt.io";
/// KubeVirt template workload label prefix
pub const TEMPLATE_WORKLOAD_LABEL_PREFIX: &str = "workload.template.kubevirt.io";
/// KubeVirt template flavor label prefix
pub const TEMPLATE_FLAVOR_LABEL_PREFIX: &str = "flavor.template.kubevirt.io";

/// Unit annotation key on tasks
pub const TASK_ANNOTATION_UNIT: &str = "unit";
/// Unit annotation value: progress is counted in MiB
pub const TASK_UNIT_MB: &str = "MB";

/// The owner label triple `{plan, migration, vmID}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerLabels {
    /// Plan UID
    pub plan: String,
    /// Migration UID
    pub migration: String,
    /// Source VM ID
    pub vm_id: String,
}

impl OwnerLabels {
    /// Create the triple
    pub fn new(
        plan: impl Into<String>,
        migration: impl Into<String>,
        vm_id: impl Into<String>,
    ) -> Self {
        Self {
            plan: plan.into(),
            migration: migration.into(),
            vm_id: vm_id.into(),
        }
    }

    /// The triple as a label map
    pub fn to_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_PLAN.to_string(), self.plan.clone()),
            (LABEL_MIGRATION.to_string(), self.migration.clone()),
            (LABEL_VM_ID.to_string(), self.vm_id.clone()),
        ])
    }

    /// Label selector string for list calls
    pub fn selector(&self) -> String {
        format!(
            "{}={},{}={},{}={}",
            LABEL_PLAN, self.plan, LABEL_MIGRATION, self.migration, LABEL_VM_ID, self.vm_id
        )
    }

    /// Stamp the triple onto a label map, overwriting any existing values
    pub fn stamp(&self, labels: &mut BTreeMap<String, String>) {
        labels.extend(self.to_map());
    }

    /// Whether a label map carries this exact triple
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.to_map()
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Read the disk-source annotation from an annotation map
pub fn disk_source(annotations: Option<&BTreeMap<String, String>>) -> Option<&str> {
    annotations
        .and_then(|a| a.get(ANNOTATION_DISK_SOURCE))
        .map(String::as_str)
}
