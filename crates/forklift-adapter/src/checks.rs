//! Pure validation checks over a [`SourceVm`]
//!
//! Results depend only on the VM view, the maps and the plan, so repeated
//! validation of the same snapshot always yields the same answer.

use forklift_common::crd::{
    MigrationType, NetworkMap, NetworkType, PlanSpec, PowerState, StorageMap, GLANCE_SOURCE,
};
use forklift_common::template::{validate_pvc_name_template, PvcNameTemplateData};

use crate::model::SourceVm;

/// Every non-LUN disk lives on mapped storage
pub fn storage_mapped(vm: &SourceVm, map: &StorageMap) -> bool {
    vm.disks
        .iter()
        .filter(|d| d.lun.is_none())
        .all(|d| {
            map.spec.find(&d.storage).is_some()
                || (d.storage.id == GLANCE_SOURCE && map.spec.glance().is_some())
        })
}

/// Every NIC's network is mapped
pub fn networks_mapped(vm: &SourceVm, map: &NetworkMap) -> bool {
    vm.nics.iter().all(|n| map.spec.find(&n.network).is_some())
}

/// At most one NIC lands on the pod network
pub fn pod_network(vm: &SourceVm, map: &NetworkMap) -> bool {
    vm.nics
        .iter()
        .filter(|n| {
            map.spec
                .find(&n.network)
                .is_some_and(|d| d.type_ == NetworkType::Pod)
        })
        .count()
        <= 1
}

/// Names of disks with a zero or negative capacity
pub fn invalid_disk_sizes(vm: &SourceVm) -> Vec<String> {
    vm.disks
        .iter()
        .filter(|d| d.lun.is_none() && d.capacity_bytes <= 0)
        .map(disk_label)
        .collect()
}

/// Names of disks whose format or bus cannot be migrated
pub fn unsupported_disks(vm: &SourceVm, supported_formats: &[&str]) -> Vec<String> {
    vm.disks
        .iter()
        .filter(|d| {
            d.format
                .as_deref()
                .is_some_and(|f| !supported_formats.iter().any(|s| s.eq_ignore_ascii_case(f)))
        })
        .map(disk_label)
        .collect()
}

/// Shared disks are only a concern when the plan skips them
pub fn shared_disks(vm: &SourceVm, plan: &PlanSpec) -> Result<(), String> {
    let shared: Vec<String> = vm.disks.iter().filter(|d| d.shared).map(disk_label).collect();
    if shared.is_empty() || plan.migrate_shared_disks {
        Ok(())
    } else {
        Err(format!(
            "shared disks will not be migrated: {}",
            shared.join(", ")
        ))
    }
}

/// Warm migrations need changed block tracking
pub fn change_tracking(vm: &SourceVm, migration_type: MigrationType) -> bool {
    migration_type != MigrationType::Warm || vm.change_tracking_enabled
}

/// Warm migrations must start without snapshots
pub fn snapshots(vm: &SourceVm, migration_type: MigrationType) -> Result<(), String> {
    if migration_type == MigrationType::Warm && vm.has_snapshot {
        Err(format!("VM {} has existing snapshots", vm.name))
    } else {
        Ok(())
    }
}

/// Live migration needs a running source; other types accept any state
pub fn power_state(vm: &SourceVm, migration_type: MigrationType) -> bool {
    migration_type != MigrationType::Live || vm.power_state == PowerState::On
}

/// Static IPs can only be preserved when the guest reports them
pub fn static_ips(vm: &SourceVm, plan: &PlanSpec) -> bool {
    !plan.preserve_static_ips || vm.nics.iter().all(|n| !n.ip_addresses.is_empty()) || vm.static_ips
}

/// Render the PVC name template for the VM's first disk
pub fn pvc_name_template(
    vm: &SourceVm,
    plan_name: &str,
    target_name: &str,
    template: &str,
    use_generate_name: bool,
) -> Result<(), String> {
    let sample = PvcNameTemplateData {
        vm_name: vm.name.clone(),
        target_vm_name: target_name.to_string(),
        plan_name: plan_name.to_string(),
        disk_index: 0,
        root_disk_index: 0,
        shared: false,
        file_name: vm
            .disks
            .first()
            .map(|d| file_name(&d.file))
            .unwrap_or_default(),
    };
    validate_pvc_name_template(template, &sample, use_generate_name).map_err(|e| e.to_string())
}

/// Last path component, without a datastore prefix
pub fn file_name(path: &str) -> String {
    path.rsplit(['/', ' ', ']'])
        .next()
        .unwrap_or_default()
        .to_string()
}

fn disk_label(d: &crate::model::SourceDisk) -> String {
    if d.name.is_empty() {
        d.id.clone()
    } else {
        d.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{network_map, plan, storage_map};
    use crate::model::{Lun, SourceDisk, SourceNic};
    use forklift_common::crd::Ref;

    fn disk(id: &str, storage: &str, capacity: i64) -> SourceDisk {
        SourceDisk {
            id: id.to_string(),
            name: id.to_string(),
            file: format!("[{}] web/{}.vmdk", storage, id),
            capacity_bytes: capacity,
            storage: Ref::with_id(storage),
            ..Default::default()
        }
    }

    fn nic(network: &str, mac: &str) -> SourceNic {
        SourceNic {
            name: format!("nic-{}", network),
            mac: mac.to_string(),
            network: Ref::with_id(network),
            ip_addresses: vec![],
        }
    }

    fn vm() -> SourceVm {
        SourceVm {
            id: "vm-1".to_string(),
            name: "web".to_string(),
            disks: vec![disk("disk-0", "ds-1", 1 << 30)],
            nics: vec![nic("net-1", "00:11:22:33:44:55")],
            ..Default::default()
        }
    }

    mod mapping {
        use super::*;

        #[test]
        fn storage_must_be_mapped_except_luns() {
            let map = storage_map(&[("ds-1", "ceph-rbd")]);
            let mut vm = vm();
            assert!(storage_mapped(&vm, &map));

            vm.disks.push(SourceDisk {
                lun: Some(Lun::default()),
                ..disk("lun-0", "unmapped", 0)
            });
            assert!(storage_mapped(&vm, &map));

            vm.disks.push(disk("disk-1", "ds-2", 1));
            assert!(!storage_mapped(&vm, &map));
        }

        #[test]
        fn networks_must_be_mapped() {
            let map = network_map(&[("net-1", NetworkType::Pod)]);
            let mut vm = vm();
            assert!(networks_mapped(&vm, &map));
            vm.nics.push(nic("net-2", ""));
            assert!(!networks_mapped(&vm, &map));
        }

        #[test]
        fn only_one_pod_network() {
            let map = network_map(&[
                ("net-1", NetworkType::Pod),
                ("net-2", NetworkType::Pod),
                ("net-3", NetworkType::Multus),
            ]);
            let mut vm = vm();
            vm.nics.push(nic("net-3", ""));
            assert!(pod_network(&vm, &map));
            vm.nics.push(nic("net-2", ""));
            assert!(!pod_network(&vm, &map));
        }
    }

    mod disks {
        use super::*;

        #[test]
        fn zero_capacity_is_invalid() {
            let mut vm = vm();
            vm.disks.push(disk("disk-1", "ds-1", 0));
            assert_eq!(invalid_disk_sizes(&vm), vec!["disk-1".to_string()]);
        }

        #[test]
        fn unknown_formats_are_unsupported() {
            let mut vm = vm();
            vm.disks[0].format = Some("RAW".to_string());
            vm.disks.push(SourceDisk {
                format: Some("vhdx".to_string()),
                ..disk("disk-1", "ds-1", 1)
            });
            assert_eq!(
                unsupported_disks(&vm, &["raw", "qcow2"]),
                vec!["disk-1".to_string()]
            );
        }

        #[test]
        fn shared_disks_only_matter_when_skipped() {
            let mut plan = plan(None).spec;
            let mut vm = vm();
            vm.disks[0].shared = true;
            assert!(shared_disks(&vm, &plan).is_ok());
            plan.migrate_shared_disks = false;
            assert!(shared_disks(&vm, &plan).unwrap_err().contains("disk-0"));
        }

        #[test]
        fn file_name_strips_datastore_and_folders() {
            assert_eq!(file_name("[datastore1] web/web_1.vmdk"), "web_1.vmdk");
            assert_eq!(file_name("/var/ova/disk.img"), "disk.img");
            assert_eq!(file_name("disk"), "disk");
        }
    }

    mod warm {
        use super::*;

        #[test]
        fn change_tracking_only_for_warm() {
            let vm = vm();
            assert!(change_tracking(&vm, MigrationType::Cold));
            assert!(!change_tracking(&vm, MigrationType::Warm));
        }

        #[test]
        fn snapshots_block_warm() {
            let mut vm = vm();
            vm.has_snapshot = true;
            assert!(snapshots(&vm, MigrationType::Cold).is_ok());
            assert!(snapshots(&vm, MigrationType::Warm).is_err());
        }

        #[test]
        fn live_needs_running_source() {
            let mut vm = vm();
            vm.power_state = PowerState::Off;
            assert!(power_state(&vm, MigrationType::Cold));
            assert!(!power_state(&vm, MigrationType::Live));
            vm.power_state = PowerState::On;
            assert!(power_state(&vm, MigrationType::Live));
        }
    }

    #[test]
    fn pvc_template_renders_against_sample() {
        let vm = vm();
        assert!(pvc_name_template(&vm, "plan", "web", "{{.VmName}}-disk-{{.DiskIndex}}", false).is_ok());
        assert!(pvc_name_template(&vm, "plan", "web", "{{.FileName}}", false).is_err());
        assert!(pvc_name_template(&vm, "plan", "web", "{{.Missing}}", false).is_err());
    }

    #[test]
    fn static_ips_need_guest_addresses() {
        let mut plan = plan(None).spec;
        let mut vm = vm();
        assert!(static_ips(&vm, &plan));
        plan.preserve_static_ips = true;
        assert!(!static_ips(&vm, &plan));
        vm.nics[0].ip_addresses = vec!["10.0.0.5".to_string()];
        assert!(static_ips(&vm, &plan));
    }
}
