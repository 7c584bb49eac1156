//! KubeVirt VM spec mapping from a [`SourceVm`]
//!
//! The mapping is the same for every provider that builds the spec
//! in-process:
//! - disks become `vol-{i}` volumes backed by the PVC whose disk identifier
//!   matches the source disk
//! - firmware is BIOS, or EFI with SMM when secure boot is on
//! - CPU sockets are `count / cores`
//! - NICs become `net-{n}` on the pod network (masquerade) or Multus (bridge);
//!   ignored mappings produce no interface

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tracing::debug;

use forklift_common::crd::{
    Bootloader, Cpu, Disk, DiskTarget, Efi, EmptyObject, FeatureState, Features, Firmware, Input,
    Interface, Machine, Matcher, Memory, MultusNetwork, Network, NetworkType, PowerState,
    PvcVolumeSource, VirtualMachineSpec, Volume,
};
use forklift_common::kube_utils::mib_quantity;
use forklift_common::labels::{
    ANNOTATION_DISK_INDEX, TEMPLATE_FLAVOR_LABEL_PREFIX, TEMPLATE_OS_LABEL_PREFIX,
    TEMPLATE_WORKLOAD_LABEL_PREFIX,
};
use forklift_common::{Error, Result};

use crate::context::PlanContext;
use crate::model::{FirmwareKind, SourceVm};

/// Memory used when the source reports none
pub const DEFAULT_MEMORY_MB: i64 = 2048;
/// Instance type kind referenced by plan VMs
pub const INSTANCE_TYPE_KIND: &str = "VirtualMachineClusterInstancetype";
/// Preference kind referenced by builders
pub const PREFERENCE_KIND: &str = "VirtualMachineClusterPreference";

const BUS_VIRTIO: &str = "virtio";
const BUS_SATA: &str = "sata";
const BUS_USB: &str = "usb";
const MODEL_E1000E: &str = "e1000e";
const MACHINE_Q35: &str = "q35";

/// Flags controlling the mapping
#[derive(Clone, Copy, Debug, Default)]
pub struct VmSpecOptions {
    /// Take CPU and memory from the plan VM's instance type
    pub use_instance_type: bool,
    /// Order disks by their original index
    pub sort_by_libvirt: bool,
}

/// Populate `spec` for `vm` backed by `pvcs`
///
/// `identify` returns the disk identifier of a PVC, matched against
/// [`crate::model::SourceDisk::id`].
pub fn build_vm_spec(
    ctx: &PlanContext,
    vm: &SourceVm,
    spec: &mut VirtualMachineSpec,
    pvcs: &[PersistentVolumeClaim],
    options: VmSpecOptions,
    identify: impl Fn(&PersistentVolumeClaim) -> String,
) -> Result<()> {
    let compat = ctx.plan.spec.use_compatibility_mode;

    spec.run_strategy = Some(run_strategy(
        ctx.plan.spec.target_power_state.as_deref(),
        vm.power_state,
    ));
    map_disks(vm, spec, pvcs, options.sort_by_libvirt, compat, identify);
    map_networks(ctx, vm, spec, compat)?;
    map_firmware(vm, spec);

    let instance_type = ctx
        .plan_vm(&vm.reference())
        .and_then(|v| v.instance_type.clone())
        .filter(|_| options.use_instance_type);
    match instance_type {
        Some(name) => {
            spec.instancetype = Some(Matcher {
                name,
                kind: Some(INSTANCE_TYPE_KIND.to_string()),
            });
        }
        None => map_cpu_memory(vm, spec),
    }

    let domain = &mut spec.template.spec.domain;
    domain.machine = Some(Machine {
        type_: Some(MACHINE_Q35.to_string()),
    });
    domain.devices.inputs = vec![Input {
        name: "tablet".to_string(),
        type_: "tablet".to_string(),
        bus: Some(if compat { BUS_USB } else { BUS_VIRTIO }.to_string()),
    }];
    Ok(())
}

/// KubeVirt run strategy from the plan's target state, else the source state
pub fn run_strategy(target_power_state: Option<&str>, source: PowerState) -> String {
    let on = match target_power_state.map(str::to_ascii_lowercase).as_deref() {
        Some("on") => true,
        Some("off") => false,
        _ => source == PowerState::On,
    };
    let strategy = if on { "Always" } else { "Halted" };
    strategy.to_string()
}

fn map_disks(
    vm: &SourceVm,
    spec: &mut VirtualMachineSpec,
    pvcs: &[PersistentVolumeClaim],
    sort_by_libvirt: bool,
    compat: bool,
    identify: impl Fn(&PersistentVolumeClaim) -> String,
) {
    let mut matched: Vec<(usize, &PersistentVolumeClaim)> = vm
        .disks
        .iter()
        .enumerate()
        .filter_map(|(index, disk)| {
            let pvc = pvcs.iter().find(|p| identify(p) == disk.id);
            if pvc.is_none() {
                debug!(vm = %vm.id, disk = %disk.id, "no PVC for disk");
            }
            pvc.map(|p| (index, p))
        })
        .collect();
    if sort_by_libvirt {
        matched.sort_by_key(|(index, pvc)| pvc_disk_index(pvc).unwrap_or(*index));
    }

    let bus = if compat { BUS_SATA } else { BUS_VIRTIO };
    let vmi = &mut spec.template.spec;
    for (i, (_, pvc)) in matched.iter().enumerate() {
        let name = format!("vol-{}", i);
        vmi.volumes.push(Volume {
            name: name.clone(),
            persistent_volume_claim: Some(PvcVolumeSource {
                claim_name: pvc.metadata.name.clone().unwrap_or_default(),
            }),
            ..Default::default()
        });
        vmi.domain.devices.disks.push(Disk {
            name,
            disk: Some(DiskTarget {
                bus: bus.to_string(),
            }),
            ..Default::default()
        });
    }
}

fn pvc_disk_index(pvc: &PersistentVolumeClaim) -> Option<usize> {
    pvc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_DISK_INDEX))
        .and_then(|i| i.parse().ok())
}

fn map_networks(
    ctx: &PlanContext,
    vm: &SourceVm,
    spec: &mut VirtualMachineSpec,
    compat: bool,
) -> Result<()> {
    let model = if compat { MODEL_E1000E } else { BUS_VIRTIO };
    let vmi = &mut spec.template.spec;
    let mut n = 0;
    for nic in &vm.nics {
        let Some(mapped) = ctx.network_map.spec.find(&nic.network) else {
            return Err(Error::validation_for(
                vm.id.clone(),
                format!("network {} is not mapped", nic.network),
            ));
        };
        let name = format!("net-{}", n);
        let mut interface = Interface {
            name: name.clone(),
            mac_address: (!nic.mac.is_empty()).then(|| nic.mac.clone()),
            model: Some(model.to_string()),
            ..Default::default()
        };
        let mut network = Network {
            name,
            ..Default::default()
        };
        match mapped.type_ {
            NetworkType::Pod => {
                interface.masquerade = Some(EmptyObject {});
                network.pod = Some(EmptyObject {});
            }
            NetworkType::Multus => {
                interface.bridge = Some(EmptyObject {});
                network.multus = Some(MultusNetwork {
                    network_name: mapped.network_name(),
                });
            }
            NetworkType::Ignored => continue,
        }
        vmi.domain.devices.interfaces.push(interface);
        vmi.networks.push(network);
        n += 1;
    }
    Ok(())
}

fn map_firmware(vm: &SourceVm, spec: &mut VirtualMachineSpec) {
    let domain = &mut spec.template.spec.domain;
    let bootloader = match vm.firmware {
        FirmwareKind::Bios => Bootloader {
            bios: Some(EmptyObject {}),
            efi: None,
        },
        FirmwareKind::Efi => Bootloader {
            bios: None,
            efi: Some(Efi {
                secure_boot: Some(vm.secure_boot),
            }),
        },
    };
    domain.firmware = Some(Firmware {
        serial: (!vm.uuid.is_empty()).then(|| vm.uuid.clone()),
        bootloader: Some(bootloader),
    });
    if vm.firmware == FirmwareKind::Efi && vm.secure_boot {
        domain.features = Some(Features {
            smm: Some(FeatureState {
                enabled: Some(true),
            }),
        });
    }
}

fn map_cpu_memory(vm: &SourceVm, spec: &mut VirtualMachineSpec) {
    let count = vm.cpu_count.max(1);
    let cores = vm.cores_per_socket.max(1);
    let domain = &mut spec.template.spec.domain;
    domain.cpu = Some(Cpu {
        cores: Some(cores),
        sockets: Some((count / cores).max(1)),
        threads: None,
    });
    let memory = if vm.memory_mb > 0 {
        vm.memory_mb
    } else {
        DEFAULT_MEMORY_MB
    };
    domain.memory = Some(Memory {
        guest: Some(mib_quantity(memory)),
    });
}

/// Template labels for an OS, defaulting to an unknown server guest
pub fn template_labels(os: Option<&str>) -> BTreeMap<String, String> {
    let os = os.filter(|o| !o.is_empty()).unwrap_or("unknown");
    BTreeMap::from([
        (format!("{}/{}", TEMPLATE_OS_LABEL_PREFIX, os), "true".to_string()),
        (
            format!("{}/server", TEMPLATE_WORKLOAD_LABEL_PREFIX),
            "true".to_string(),
        ),
        (
            format!("{}/medium", TEMPLATE_FLAVOR_LABEL_PREFIX),
            "true".to_string(),
        ),
    ])
}

/// Common template OS name for a provider guest identifier
pub fn template_os(guest_os: &str) -> Option<&'static str> {
    let os = guest_os.to_ascii_lowercase();
    let table: &[(&str, &str)] = &[
        ("rhel9", "rhel9.0"),
        ("rhel_9", "rhel9.0"),
        ("rhel8", "rhel8.1"),
        ("rhel_8", "rhel8.1"),
        ("rhel7", "rhel7.7"),
        ("rhel_7", "rhel7.7"),
        ("centos", "centos7.0"),
        ("fedora", "fedora31"),
        ("ubuntu", "ubuntu18.04"),
        ("windows2022", "win2k22"),
        ("windows2019", "win2k19"),
        ("windows2016", "win2k16"),
        ("windows2012", "win2k12r2"),
        ("windows11", "win11"),
        ("windows10", "win10"),
        ("windows9", "win10"),
    ];
    table
        .iter()
        .find(|(needle, _)| os.contains(needle))
        .map(|(_, name)| *name)
}

/// Cluster preference for a template OS name
pub fn preference_for(template_os: &str) -> Option<&'static str> {
    let table: &[(&str, &str)] = &[
        ("rhel9", "rhel.9"),
        ("rhel8", "rhel.8"),
        ("rhel7", "rhel.7"),
        ("centos", "centos.7"),
        ("fedora", "fedora"),
        ("ubuntu", "ubuntu"),
        ("win2k22", "windows.2k22"),
        ("win2k19", "windows.2k19"),
        ("win2k16", "windows.2k16"),
        ("win2k12", "windows.2k12"),
        ("win11", "windows.11"),
        ("win10", "windows.10"),
    ];
    table
        .iter()
        .find(|(prefix, _)| template_os.starts_with(prefix))
        .map(|(_, name)| *name)
}
