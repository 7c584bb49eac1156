//! Validator checks as VM concerns
//!
//! Every failing check becomes a [`Concern`] keyed by a stable condition
//! type. A critical concern stops the VM before anything is created.

use std::collections::BTreeMap;

use tracing::debug;

use forklift_adapter::{MacConflict, PlanContext, Validator};
use forklift_common::crd::{Category, Concern, Ref};
use forklift_common::Result;

/// Condition: a NIC's network is not mapped
pub const VM_NETWORKS_NOT_MAPPED: &str = "VMNetworksNotMapped";
/// Condition: a disk's storage is not mapped
pub const VM_STORAGE_NOT_MAPPED: &str = "VMStorageNotMapped";
/// Condition: direct-attached storage cannot be migrated
pub const VM_STORAGE_NOT_SUPPORTED: &str = "VMStorageNotSupported";
/// Condition: more than one NIC maps to the pod network
pub const VM_MULTIPLE_POD_NETWORK_MAPPINGS: &str = "VMMultiplePodNetworkMappings";
/// Condition: the VM's host is in maintenance
pub const HOST_NOT_READY: &str = "HostNotReady";
/// Condition: changed block tracking is disabled (warm)
pub const VM_MISSING_CHANGED_BLOCK_TRACKING: &str = "VMMissingChangedBlockTracking";
/// Condition: the VM already has snapshots (warm)
pub const VM_HAS_SNAPSHOTS: &str = "VMHasSnapshots";
/// Condition: shared disks will not be migrated with this VM
pub const SHARED_DISKS: &str = "SharedDisks";
/// Condition: some disks cannot be migrated
pub const UNSUPPORTED_DISKS: &str = "UnsupportedDisks";
/// Condition: some disks report invalid sizes
pub const INVALID_DISK_SIZES: &str = "InvalidDiskSizes";
/// Condition: source MACs are used by destination VMs
pub const MAC_CONFLICTS: &str = "MacConflicts";
/// Condition: power state does not fit the migration type
pub const VM_POWER_STATE_UNSUPPORTED: &str = "VMPowerStateUnsupported";
/// Condition: the VM cannot be migrated with the plan's type
pub const VM_MIGRATION_TYPE_UNSUPPORTED: &str = "VMMigrationTypeUnsupported";
/// Condition: the provider cannot migrate warm
pub const WARM_MIGRATION_NOT_SUPPORTED: &str = "WarmMigrationNotSupported";
/// Condition: static IPs cannot be preserved
pub const STATIC_IPS_MISSING: &str = "StaticIPsMissing";
/// Condition: the VM's IP is outside the user-defined network subnet
pub const VM_IP_NOT_MATCHING_UDN_SUBNET: &str = "VMIpNotMatchingUdnSubnet";
/// Condition: the PVC name template does not render a valid name
pub const PVC_NAME_TEMPLATE_INVALID: &str = "PVCNameTemplateInvalid";

fn concern(id: &str, category: Category, assessment: impl Into<String>) -> Concern {
    Concern::new(id, category, id, assessment)
}

/// Group MAC conflicts by destination VM into one message each
pub fn mac_conflict_messages(vm: &Ref, conflicts: &[MacConflict]) -> Vec<String> {
    let mut by_destination: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for conflict in conflicts {
        by_destination
            .entry(conflict.destination_vm.as_str())
            .or_default()
            .push(conflict.mac.as_str());
    }
    by_destination
        .into_iter()
        .map(|(destination, macs)| {
            format!(
                "VM {} has MAC address conflicts: MACs {} conflict with destination VM {}",
                vm,
                macs.join(", "),
                destination
            )
        })
        .collect()
}

/// Run every check for `vm` and collect the concerns
///
/// Errors mean a check could not be evaluated; the caller retries.
pub async fn validate(validator: &dyn Validator, ctx: &PlanContext, vm: &Ref) -> Result<Vec<Concern>> {
    let mut concerns = Vec::new();

    if !validator.networks_mapped(vm).await? {
        concerns.push(concern(
            VM_NETWORKS_NOT_MAPPED,
            Category::Critical,
            "VM has unmapped networks.",
        ));
    }
    if !validator.storage_mapped(vm).await? {
        concerns.push(concern(
            VM_STORAGE_NOT_MAPPED,
            Category::Critical,
            "VM has unmapped storage.",
        ));
    }
    if !validator.direct_storage(vm).await? {
        concerns.push(concern(
            VM_STORAGE_NOT_SUPPORTED,
            Category::Critical,
            "VM has unsupported storage.",
        ));
    }
    if !validator.pod_network(vm).await? {
        concerns.push(concern(
            VM_MULTIPLE_POD_NETWORK_MAPPINGS,
            Category::Critical,
            "VM has more than one interface mapped to the pod network.",
        ));
    }
    if !validator.maintenance_mode(vm).await? {
        concerns.push(concern(
            HOST_NOT_READY,
            Category::Warn,
            "VM host is in maintenance mode.",
        ));
    }

    if !validator.warm_migration() {
        concerns.push(concern(
            WARM_MIGRATION_NOT_SUPPORTED,
            Category::Critical,
            "Warm migration is not supported by the source provider.",
        ));
    }
    if ctx.is_warm() {
        if !validator.change_tracking_enabled(vm).await? {
            concerns.push(concern(
                VM_MISSING_CHANGED_BLOCK_TRACKING,
                Category::Critical,
                "Changed Block Tracking (CBT) has not been enabled on the VM. \
                 This feature is a prerequisite for warm migration.",
            ));
        }
        let (ok, message) = validator.has_snapshot(vm).await?;
        if !ok {
            concerns.push(concern(VM_HAS_SNAPSHOTS, Category::Warn, message));
        }
    }

    if !validator.migration_type()
        || !validator.vm_migration_type(vm).await?
        || !validator.compatible(vm).await?
    {
        concerns.push(concern(
            VM_MIGRATION_TYPE_UNSUPPORTED,
            Category::Critical,
            "VM is incompatible with the selected migration type.",
        ));
    }
    if !validator.power_state(vm).await? {
        concerns.push(concern(
            VM_POWER_STATE_UNSUPPORTED,
            Category::Critical,
            "VM power state is incompatible with the selected migration type.",
        ));
    }

    let (ok, message) = validator.shared_disks(vm).await?;
    if !ok {
        concerns.push(concern(SHARED_DISKS, Category::Warn, message));
    }
    let unsupported = validator.unsupported_disks(vm).await?;
    if !unsupported.is_empty() {
        concerns.push(concern(
            UNSUPPORTED_DISKS,
            Category::Critical,
            format!("{} disks are not supported for migration.", unsupported.join(", ")),
        ));
    }
    let invalid = validator.invalid_disk_sizes(vm).await?;
    if !invalid.is_empty() {
        concerns.push(concern(
            INVALID_DISK_SIZES,
            Category::Critical,
            format!("VM has disks with invalid sizes: {}.", invalid.join(", ")),
        ));
    }

    // the adapter skips the destination lookup for cold migrations
    let conflicts = validator.mac_conflicts(vm).await?;
    for message in mac_conflict_messages(vm, &conflicts) {
        concerns.push(concern(MAC_CONFLICTS, Category::Critical, message));
    }

    if !validator.static_ips(vm).await? {
        concerns.push(concern(
            STATIC_IPS_MISSING,
            Category::Warn,
            "Guest information on vNICs is missing, cannot preserve static IPs.",
        ));
    }
    if !validator.udn_subnet(vm).await? {
        concerns.push(concern(
            VM_IP_NOT_MATCHING_UDN_SUBNET,
            Category::Warn,
            "VM IP does not match the primary UDN subnet.",
        ));
    }
    if let Some(template) = ctx.plan.spec.pvc_name_template_for(vm) {
        if !validator.pvc_name_template(vm, template).await? {
            concerns.push(concern(
                PVC_NAME_TEMPLATE_INVALID,
                Category::Critical,
                "VM PVC name template is invalid.",
            ));
        }
    }

    debug!(vm = %vm, concerns = concerns.len(), "validated VM");
    Ok(concerns)
}
