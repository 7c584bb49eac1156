//! oVirt inventory model

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use forklift_common::crd::{Ref, MIB};
use forklift_common::Result;

use crate::inventory::{self, Inventory, DISKS, HOSTS, VMS};
use crate::model::{FirmwareKind, Lun, SourceDisk, SourceNic, SourceVm, VmLoader};
use crate::providers::parse_power_state;

const STORAGE_TYPE_LUN: &str = "lun";
const HOST_MAINTENANCE: &str = "maintenance";

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Bios {
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct DiskAttachment {
    pub disk: String,
    pub interface: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Profile {
    pub network: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Nic {
    pub name: String,
    pub mac: String,
    pub profile: Profile,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Vm {
    pub id: String,
    pub name: String,
    pub status: String,
    pub cpu_sockets: u32,
    pub cpu_cores: u32,
    pub cpu_threads: u32,
    /// Bytes
    pub memory: i64,
    pub bios: Bios,
    pub os_type: String,
    pub host: String,
    /// oVirt always lists the "Active VM" snapshot
    pub snapshots: Vec<serde_json::Value>,
    pub disk_attachments: Vec<DiskAttachment>,
    pub nics: Vec<Nic>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct LogicalUnit {
    pub lun_id: String,
    pub address: String,
    pub port: String,
    pub target: String,
    pub lun_mapping: i32,
    pub size: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct LunStorage {
    pub logical_units: Vec<LogicalUnit>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Disk {
    pub id: String,
    pub name: String,
    pub provisioned_size: i64,
    pub storage_domain: String,
    pub storage_type: String,
    pub format: String,
    pub shared: bool,
    pub lun: LunStorage,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Host {
    pub status: String,
}

/// Loads oVirt VMs and their disks from the inventory
#[derive(Clone)]
pub(crate) struct OvirtLoader {
    inventory: Arc<dyn Inventory>,
}

impl OvirtLoader {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }

    pub async fn vm(&self, vm: &Ref) -> Result<Vm> {
        inventory::find_as(self.inventory.as_ref(), VMS, vm).await
    }

    async fn disk(&self, id: &str) -> Result<Disk> {
        inventory::get_as(self.inventory.as_ref(), DISKS, id).await
    }

    fn source_disk(attachment: &DiskAttachment, disk: Disk) -> SourceDisk {
        let lun = (disk.storage_type == STORAGE_TYPE_LUN)
            .then(|| disk.lun.logical_units.first())
            .flatten()
            .map(|unit| Lun {
                lun_id: unit.lun_id.clone(),
                target: unit.target.clone(),
                portal: if unit.port.is_empty() {
                    unit.address.clone()
                } else {
                    format!("{}:{}", unit.address, unit.port)
                },
                lun: unit.lun_mapping,
            });
        let capacity_bytes = match &lun {
            Some(_) => disk.lun.logical_units.first().map(|u| u.size).unwrap_or(0),
            None => disk.provisioned_size,
        };
        SourceDisk {
            name: disk.name,
            file: String::new(),
            capacity_bytes,
            storage: Ref::with_id(disk.storage_domain),
            shared: disk.shared,
            bus: (!attachment.interface.is_empty()).then(|| attachment.interface.clone()),
            format: (!disk.format.is_empty()).then_some(disk.format),
            lun,
            id: disk.id,
        }
    }

    pub async fn source_vm(&self, vm: &Vm) -> Result<SourceVm> {
        let mut disks = Vec::with_capacity(vm.disk_attachments.len());
        for attachment in &vm.disk_attachments {
            let disk = self.disk(&attachment.disk).await?;
            disks.push(Self::source_disk(attachment, disk));
        }

        let bios = vm.bios.type_.to_ascii_lowercase();
        let sockets = vm.cpu_sockets.max(1);
        let cores = vm.cpu_cores.max(1);
        let threads = vm.cpu_threads.max(1);
        Ok(SourceVm {
            id: vm.id.clone(),
            name: vm.name.clone(),
            power_state: parse_power_state(&vm.status),
            firmware: if bios.contains("ovmf") || bios.contains("secure_boot") {
                FirmwareKind::Efi
            } else {
                FirmwareKind::Bios
            },
            secure_boot: bios.contains("secure_boot"),
            cpu_count: sockets * cores * threads,
            cores_per_socket: cores,
            memory_mb: vm.memory / MIB,
            guest_os: vm.os_type.clone(),
            host: (!vm.host.is_empty()).then(|| vm.host.clone()),
            change_tracking_enabled: true,
            has_snapshot: vm.snapshots.len() > 1,
            disks,
            nics: vm
                .nics
                .iter()
                .map(|n| SourceNic {
                    name: n.name.clone(),
                    mac: n.mac.clone(),
                    network: Ref::with_id(n.profile.network.clone()),
                    ip_addresses: Vec::new(),
                })
                .collect(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl VmLoader for OvirtLoader {
    async fn load(&self, vm: &Ref) -> Result<SourceVm> {
        let raw = self.vm(vm).await?;
        self.source_vm(&raw).await
    }

    async fn host_ready(&self, vm: &SourceVm) -> Result<bool> {
        let Some(host) = vm.host.as_deref() else {
            return Ok(true);
        };
        let host: Host = inventory::get_as(self.inventory.as_ref(), HOSTS, host).await?;
        Ok(!host.status.eq_ignore_ascii_case(HOST_MAINTENANCE))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use forklift_common::crd::PowerState;

    #[tokio::test]
    async fn maps_inventory_vm_and_disks() {
        let loader = OvirtLoader::new(Arc::new(fixtures::inventory()));
        let vm = loader.load(&Ref::with_id("vm-1")).await.unwrap();
        assert_eq!(vm.power_state, PowerState::On);
        assert_eq!(vm.firmware, FirmwareKind::Efi);
        assert!(vm.secure_boot);
        assert_eq!((vm.cpu_count, vm.cores_per_socket), (4, 2));
        assert_eq!(vm.memory_mb, 4096);
        assert!(!vm.has_snapshot);

        assert_eq!(vm.disks[0].capacity_bytes, 21_474_836_480);
        assert_eq!(vm.disks[0].format.as_deref(), Some("cow"));
        assert!(vm.disks[0].lun.is_none());

        let lun = vm.disks[1].lun.as_ref().unwrap();
        assert_eq!(lun.portal, "10.0.0.20:3260");
        assert_eq!(lun.lun, 1);
        assert_eq!(vm.disks[1].capacity_bytes, 5_368_709_120);
        assert_eq!(vm.nics[0].network, Ref::with_id("net-1"));
        assert!(loader.host_ready(&vm).await.unwrap());
    }
}
