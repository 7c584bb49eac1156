//! MAC address conflict detection
//!
//! A migrated VM keeps its source MACs. If a VM already on the destination
//! uses one of them, KubeVirt (or kubemacpool) will reject or duplicate it.
//! Cold migrations skip the check: the source is off at cutover, so the
//! migrated VM is the only live owner of its MACs.

use forklift_common::crd::{Interface, VirtualMachine};
use forklift_common::Result;

use crate::context::PlanContext;

/// A source MAC already used by a destination VM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MacConflict {
    /// The conflicting MAC
    pub mac: String,
    /// Destination VM as `namespace/name`
    pub destination_vm: String,
}

/// MAC addresses of interfaces in order; unset MACs are ""
pub fn extract_macs(interfaces: &[Interface]) -> Vec<String> {
    interfaces
        .iter()
        .map(|i| i.mac_address.clone().unwrap_or_default())
        .collect()
}

/// Intersect source MACs with the MACs of destination VMs
///
/// Empty source MACs are skipped (they will be allocated). Comparison is
/// case-insensitive; the result follows source MAC order, then destination
/// listing order.
pub fn find_conflicts(source_macs: &[String], destination: &[VirtualMachine]) -> Vec<MacConflict> {
    let destination: Vec<(String, Vec<String>)> = destination
        .iter()
        .map(|vm| {
            let name = format!(
                "{}/{}",
                vm.metadata.namespace.as_deref().unwrap_or_default(),
                vm.metadata.name.as_deref().unwrap_or_default()
            );
            let macs = extract_macs(&vm.spec.template.spec.domain.devices.interfaces)
                .into_iter()
                .filter(|m| !m.is_empty())
                .map(|m| m.to_ascii_lowercase())
                .collect();
            (name, macs)
        })
        .collect();

    let mut conflicts = Vec::new();
    for mac in source_macs.iter().filter(|m| !m.is_empty()) {
        let wanted = mac.to_ascii_lowercase();
        for (name, macs) in &destination {
            if macs.contains(&wanted) {
                conflicts.push(MacConflict {
                    mac: mac.clone(),
                    destination_vm: name.clone(),
                });
            }
        }
    }
    conflicts
}

/// Check source MACs against VMs in the target namespace
pub async fn check_conflicts(ctx: &PlanContext, source_macs: &[String]) -> Result<Vec<MacConflict>> {
    if ctx.is_cold() || source_macs.iter().all(String::is_empty) {
        return Ok(Vec::new());
    }
    let existing = ctx
        .destination
        .cluster
        .list_virtual_machines(ctx.target_namespace(), None)
        .await?;
    Ok(find_conflicts(source_macs, &existing))
}
