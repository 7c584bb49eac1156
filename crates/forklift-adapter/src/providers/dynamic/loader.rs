//! Schema-driven [`VmLoader`]
//!
//! Maps an untyped inventory VM onto [`SourceVm`] through the provider's
//! schema. Shared by dynamic providers and by the OVA and Hyper-V adapters,
//! whose provider servers publish inventory in a fixed layout.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use forklift_common::crd::{ProviderSchema, Ref, SchemaKind, MIB};
use forklift_common::{Error, Result};

use super::accessor::Accessor;
use crate::inventory::{self, Inventory, VMS};
use crate::model::{FirmwareKind, SourceDisk, SourceNic, SourceVm, VmLoader};
use crate::providers::parse_power_state;
use crate::vmspec::DEFAULT_MEMORY_MB;

/// Loads VMs from an untyped inventory through a schema
#[derive(Clone)]
pub struct SchemaLoader {
    schema: ProviderSchema,
    inventory: Arc<dyn Inventory>,
}

impl SchemaLoader {
    /// Loader over `inventory` using `schema`
    pub fn new(schema: ProviderSchema, inventory: Arc<dyn Inventory>) -> Self {
        Self { schema, inventory }
    }

    /// The schema in use
    pub fn schema(&self) -> &ProviderSchema {
        &self.schema
    }

    /// The raw inventory object of a VM
    pub async fn object(&self, vm: &Ref) -> Result<Value> {
        inventory::find(self.inventory.as_ref(), VMS, vm).await
    }

    /// A string VM field that [`SourceVm`] does not carry
    pub fn string_field(&self, object: &Value, name: &str) -> Option<String> {
        Accessor::new(&self.schema, SchemaKind::Vm, object).get_string(name)
    }

    /// Map a raw VM object
    pub fn source_vm(&self, object: &Value) -> Result<SourceVm> {
        let vm = Accessor::new(&self.schema, SchemaKind::Vm, object);
        let id = vm
            .get_string("id")
            .ok_or_else(|| Error::validation("inventory VM has no id"))?;
        let name = vm
            .get_string("name")
            .ok_or_else(|| Error::validation_for(id.clone(), "inventory VM has no name"))?;

        let memory_mb = match vm.get_int("memoryMB") {
            Some(value) => match vm.get_string("memoryUnits").filter(|u| !u.is_empty()) {
                Some(units) => resource_capacity(value, &units)
                    .map_err(|e| Error::validation_for(name.clone(), e))?
                    / MIB,
                None => value,
            },
            None => DEFAULT_MEMORY_MB,
        };
        let cpu_count = vm.get_int("cpuCount").filter(|c| *c > 0).unwrap_or(1) as u32;
        let cores_per_socket = vm
            .get_int("coresPerSocket")
            .filter(|c| *c > 0)
            .unwrap_or(1) as u32;

        let firmware = match vm.get_string("firmware").as_deref() {
            None | Some("") | Some("bios") => FirmwareKind::Bios,
            Some(_) => FirmwareKind::Efi,
        };

        let disks = vm
            .get_slice("disks")
            .iter()
            .map(|d| self.disk(&vm, d, &name))
            .collect::<Result<Vec<_>>>()?;
        let nics = vm
            .get_slice("nics")
            .iter()
            .map(|n| {
                let nic = vm.nested(SchemaKind::Nic, n);
                SourceNic {
                    name: nic.get_string("name").unwrap_or_default(),
                    mac: nic.get_string("mac").unwrap_or_default(),
                    network: Ref::with_id(nic.get_string("network").unwrap_or_default()),
                    ip_addresses: Vec::new(),
                }
            })
            .collect();

        Ok(SourceVm {
            id,
            name,
            uuid: vm.get_string("uuid").unwrap_or_default(),
            power_state: parse_power_state(&vm.get_string("powerState").unwrap_or_default()),
            firmware,
            secure_boot: vm.get_bool("secureBoot").unwrap_or(false),
            cpu_count,
            cores_per_socket,
            memory_mb,
            guest_os: vm.get_string("guestOS").unwrap_or_default(),
            disks,
            nics,
            ..Default::default()
        })
    }

    fn disk(&self, vm: &Accessor<'_>, object: &Value, vm_name: &str) -> Result<SourceDisk> {
        let disk = vm.nested(SchemaKind::Disk, object);
        let id = disk
            .get_string("id")
            .ok_or_else(|| Error::validation_for(vm_name, "inventory disk has no id"))?;
        let capacity = disk.get_int("capacity").unwrap_or(0);
        let capacity_bytes = match disk.get_string("capacityAllocationUnits") {
            Some(units) if !units.is_empty() => {
                resource_capacity(capacity, &units).map_err(|e| Error::validation_for(vm_name, e))?
            }
            _ => capacity,
        };
        Ok(SourceDisk {
            name: disk.get_string("name").unwrap_or_else(|| id.clone()),
            file: disk.get_string("filePath").unwrap_or_default(),
            capacity_bytes,
            storage: Ref::with_id(disk.get_string("storage").unwrap_or_default()),
            shared: disk.get_bool("shared").unwrap_or(false),
            format: disk.get_string("format"),
            id,
            ..Default::default()
        })
    }
}

#[async_trait]
impl VmLoader for SchemaLoader {
    async fn load(&self, vm: &Ref) -> Result<SourceVm> {
        let object = self.object(vm).await?;
        self.source_vm(&object)
    }
}

/// Bytes for `value` expressed in `units`
///
/// Accepts `megabytes` and OVF allocation units such as `byte * 2^20`;
/// empty units mean bytes.
pub fn resource_capacity(value: i64, units: &str) -> std::result::Result<i64, String> {
    let units = units.trim().to_ascii_lowercase();
    match units.as_str() {
        "" | "byte" | "bytes" => return Ok(value),
        "kilobytes" => return Ok(value << 10),
        "megabytes" => return Ok(value << 20),
        "gigabytes" => return Ok(value << 30),
        _ => {}
    }
    let mut multiplier: i64 = 1;
    for term in units.split('*').map(str::trim) {
        let factor = match term {
            "byte" | "bytes" => 1,
            t => match t.split_once('^') {
                Some((base, exp)) => {
                    let base: i64 = base.trim().parse().map_err(|_| unknown_units(&units))?;
                    let exp: u32 = exp.trim().parse().map_err(|_| unknown_units(&units))?;
                    base.checked_pow(exp).ok_or_else(|| unknown_units(&units))?
                }
                None => t.parse().map_err(|_| unknown_units(&units))?,
            },
        };
        multiplier = multiplier
            .checked_mul(factor)
            .ok_or_else(|| unknown_units(&units))?;
    }
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("capacity {} {} overflows", value, units))
}

fn unknown_units(units: &str) -> String {
    format!("unknown capacity units '{}'", units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::StaticInventory;
    use forklift_common::crd::PowerState;
    use serde_json::json;

    fn ova_vm() -> Value {
        json!({
            "ID": "vm-1",
            "Name": "centos",
            "UUID": "b3c1-42",
            "CpuCount": 4,
            "CoresPerSocket": 2,
            "MemoryMB": 4,
            "MemoryUnits": "byte * 2^30",
            "Firmware": "efi",
            "Disks": [{
                "ID": "disk-1",
                "Name": "centos-disk1.vmdk",
                "FilePath": "/ova/centos.ova",
                "Capacity": 16,
                "CapacityAllocationUnits": "byte * 2^30",
                "Datastore": {"ID": "ds-1"}
            }],
            "NICs": [{"Name": "nic0", "MAC": "00:50:56:aa:bb:cc", "Network": "VM Network"}]
        })
    }

    #[test]
    fn capacity_units() {
        assert_eq!(resource_capacity(5, ""), Ok(5));
        assert_eq!(resource_capacity(2, "megabytes"), Ok(2 * MIB));
        assert_eq!(resource_capacity(3, "byte * 2^20"), Ok(3 * MIB));
        assert_eq!(resource_capacity(1, "byte * 2^30"), Ok(1 << 30));
        assert!(resource_capacity(1, "furlongs").is_err());
    }

    #[tokio::test]
    async fn loads_ova_layout() {
        let loader = SchemaLoader::new(
            ProviderSchema::ova(),
            Arc::new(StaticInventory::default().with(VMS, ova_vm())),
        );
        let vm = loader.load(&Ref::with_id("vm-1")).await.unwrap();
        assert_eq!(vm.name, "centos");
        assert_eq!(vm.memory_mb, 4096);
        assert_eq!((vm.cpu_count, vm.cores_per_socket), (4, 2));
        assert_eq!(vm.firmware, FirmwareKind::Efi);
        assert_eq!(vm.disks[0].capacity_bytes, 16 << 30);
        assert_eq!(vm.disks[0].storage, Ref::with_id("ds-1"));
        assert_eq!(vm.nics[0].mac, "00:50:56:aa:bb:cc");
        assert_eq!(vm.power_state, PowerState::Unknown);
    }

    #[tokio::test]
    async fn generic_defaults() {
        let loader = SchemaLoader::new(
            ProviderSchema::generic(),
            Arc::new(StaticInventory::default().with(
                VMS,
                json!({"id": "vm-1", "name": "xen", "coresPerSocket": 0, "powerState": "running"}),
            )),
        );
        let vm = loader.load(&Ref::with_id("vm-1")).await.unwrap();
        assert_eq!(vm.memory_mb, DEFAULT_MEMORY_MB);
        assert_eq!((vm.cpu_count, vm.cores_per_socket), (1, 1));
        assert_eq!(vm.firmware, FirmwareKind::Bios);
        assert_eq!(vm.power_state, PowerState::On);
        assert!(vm.disks.is_empty());
    }

    #[test]
    fn disk_without_id_is_rejected() {
        let loader = SchemaLoader::new(
            ProviderSchema::generic(),
            Arc::new(StaticInventory::default()),
        );
        let err = loader
            .source_vm(&json!({"id": "vm-1", "name": "xen", "disks": [{"capacity": 1}]}))
            .unwrap_err();
        assert!(err.to_string().contains("no id"));
    }
}
