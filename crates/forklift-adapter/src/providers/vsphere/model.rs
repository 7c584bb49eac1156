//! vSphere inventory model

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use forklift_common::crd::Ref;
use forklift_common::Result;

use crate::inventory::{self, Inventory, HOSTS, VMS};
use crate::model::{FirmwareKind, SourceDisk, SourceNic, SourceVm, VmLoader};
use crate::providers::parse_power_state;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct IdRef {
    pub id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Disk {
    pub file: String,
    pub datastore: IdRef,
    pub capacity: i64,
    pub shared: bool,
    pub rdm: bool,
    pub bus: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Nic {
    pub mac: String,
    pub network: IdRef,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct GuestNetwork {
    pub mac: String,
    pub ip: String,
    pub origin: String,
    pub prefix_length: i32,
    pub gateway: String,
    pub dns: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Vm {
    pub id: String,
    pub name: String,
    pub uuid: String,
    pub firmware: String,
    pub power_state: String,
    pub cpu_count: u32,
    pub cores_per_socket: u32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: i64,
    pub guest_id: String,
    pub host: String,
    pub change_tracking_enabled: bool,
    pub secure_boot: bool,
    pub snapshot: IdRef,
    pub disks: Vec<Disk>,
    pub nics: Vec<Nic>,
    pub guest_networks: Vec<GuestNetwork>,
}

impl Vm {
    pub fn is_windows(&self) -> bool {
        self.guest_id.to_ascii_lowercase().contains("windows")
    }

    /// `mac:ip:address,gateway,prefix[,dns...]` entries for virt-v2v
    ///
    /// Windows guests report DHCP leases too, so only manual addresses count
    /// there.
    pub fn static_ips(&self) -> Vec<String> {
        let windows = self.is_windows();
        self.guest_networks
            .iter()
            .filter(|n| !n.ip.is_empty() && (!windows || n.origin == "manual"))
            .map(|n| {
                let mut entry = format!("{}:ip:{},{},{}", n.mac, n.ip, n.gateway, n.prefix_length);
                for server in &n.dns {
                    entry.push(',');
                    entry.push_str(server);
                }
                entry
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Host {
    pub name: String,
    pub path: String,
    pub in_maintenance: bool,
    pub thumbprint: String,
}

/// Stable identifier of a VMDK across warm snapshots
///
/// Snapshots add a `-NNNNNN` delta suffix to the backing file; warm
/// migrations strip it so every precopy resolves to the base disk.
pub(crate) fn base_volume(file: &str, warm: bool) -> String {
    static SUFFIX: OnceLock<Regex> = OnceLock::new();
    if !warm {
        return file.to_string();
    }
    let re = SUFFIX.get_or_init(|| Regex::new(r"-\d{6}\.vmdk$").expect("hardcoded regex is valid"));
    re.replace(file, ".vmdk").into_owned()
}

/// Loads vSphere VMs and hosts from the inventory
#[derive(Clone)]
pub(crate) struct VsphereLoader {
    inventory: Arc<dyn Inventory>,
    warm: bool,
}

impl VsphereLoader {
    pub fn new(inventory: Arc<dyn Inventory>, warm: bool) -> Self {
        Self { inventory, warm }
    }

    pub async fn vm(&self, vm: &Ref) -> Result<Vm> {
        inventory::find_as(self.inventory.as_ref(), VMS, vm).await
    }

    pub async fn host(&self, id: &str) -> Result<Host> {
        inventory::get_as(self.inventory.as_ref(), HOSTS, id).await
    }

    pub fn source_vm(&self, vm: &Vm) -> SourceVm {
        SourceVm {
            id: vm.id.clone(),
            name: vm.name.clone(),
            uuid: vm.uuid.clone(),
            power_state: parse_power_state(&vm.power_state),
            firmware: FirmwareKind::parse(&vm.firmware),
            secure_boot: vm.secure_boot,
            cpu_count: vm.cpu_count,
            cores_per_socket: vm.cores_per_socket,
            memory_mb: vm.memory_mb,
            guest_os: vm.guest_id.clone(),
            host: (!vm.host.is_empty()).then(|| vm.host.clone()),
            change_tracking_enabled: vm.change_tracking_enabled,
            has_snapshot: !vm.snapshot.id.is_empty(),
            static_ips: !vm.static_ips().is_empty(),
            disks: vm
                .disks
                .iter()
                .map(|d| SourceDisk {
                    id: base_volume(&d.file, self.warm),
                    name: d.file.clone(),
                    file: d.file.clone(),
                    capacity_bytes: d.capacity,
                    storage: Ref::with_id(d.datastore.id.clone()),
                    shared: d.shared,
                    bus: (!d.bus.is_empty()).then(|| d.bus.clone()),
                    format: Some(if d.rdm { "rdm" } else { "vmdk" }.to_string()),
                    lun: None,
                })
                .collect(),
            nics: vm
                .nics
                .iter()
                .map(|n| SourceNic {
                    name: String::new(),
                    mac: n.mac.clone(),
                    network: Ref::with_id(n.network.id.clone()),
                    ip_addresses: vm
                        .guest_networks
                        .iter()
                        .filter(|g| g.mac.eq_ignore_ascii_case(&n.mac))
                        .map(|g| g.ip.clone())
                        .collect(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl VmLoader for VsphereLoader {
    async fn load(&self, vm: &Ref) -> Result<SourceVm> {
        Ok(self.source_vm(&self.vm(vm).await?))
    }

    async fn host_ready(&self, vm: &SourceVm) -> Result<bool> {
        let Some(host) = vm.host.as_deref() else {
            return Ok(true);
        };
        Ok(!self.host(host).await?.in_maintenance)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    pub fn vm() -> Value {
        json!({
            "id": "vm-1",
            "name": "web-01",
            "uuid": "4216f1a2-0000-1111-2222-333344445555",
            "firmware": "efi",
            "powerState": "poweredOn",
            "cpuCount": 4,
            "coresPerSocket": 2,
            "memoryMB": 8192,
            "guestId": "rhel9_64Guest",
            "host": "host-9",
            "changeTrackingEnabled": true,
            "disks": [
                {"key": 2000, "file": "[ds1] web-01/web-01-000002.vmdk",
                 "datastore": {"id": "ds-1"}, "capacity": 10_737_418_240_i64, "bus": "scsi"},
                {"key": 2001, "file": "[ds1] web-01/web-01_1.vmdk",
                 "datastore": {"id": "ds-1"}, "capacity": 1_073_741_824, "shared": true}
            ],
            "nics": [{"mac": "00:50:56:aa:bb:cc", "network": {"id": "net-1"}}],
            "guestNetworks": [
                {"mac": "00:50:56:aa:bb:cc", "ip": "10.0.0.5", "origin": "manual", "prefixLength": 24,
                 "gateway": "10.0.0.1", "dns": ["10.0.0.2"]}
            ]
        })
    }

    pub fn host() -> Value {
        json!({
            "id": "host-9",
            "name": "esx-9.example.com",
            "path": "/dc1/cluster1/esx-9.example.com",
            "inMaintenance": false,
            "thumbprint": "AA:BB:CC"
        })
    }
}
