//! OpenStack inventory model

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use forklift_common::crd::{Ref, GLANCE_SOURCE};
use forklift_common::{Error, Result};

use crate::context::PlanContext;
use crate::inventory::{self, Inventory, IMAGES, NETWORKS, VMS, VOLUMES};
use crate::model::{FirmwareKind, SourceDisk, SourceNic, SourceVm, VmLoader};
use crate::providers::parse_power_state;

/// Collection of Cinder volume types
pub(crate) const VOLUME_TYPES: &str = "volumetypes";
/// Image property naming the volume an image was uploaded from
pub(crate) const PROPERTY_ORIGINAL_VOLUME: &str = "forklift_original_volume_id";
/// Glance status of an image that can be read
pub(crate) const IMAGE_ACTIVE: &str = "active";

const GIB: i64 = 1 << 30;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Flavor {
    pub vcpus: u32,
    /// MiB
    pub ram: i64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct IdRef {
    pub id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Address {
    #[serde(rename = "OS-EXT-IPS-MAC:mac_addr")]
    pub mac: String,
    pub addr: String,
    #[serde(rename = "OS-EXT-IPS:type")]
    pub type_: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Vm {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(rename = "imageID")]
    pub image_id: String,
    #[serde(rename = "hostID")]
    pub host_id: String,
    pub flavor: Flavor,
    pub attached_volumes: Vec<IdRef>,
    /// Addresses keyed by network name
    pub addresses: BTreeMap<String, Vec<Address>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Attachment {
    #[serde(rename = "serverID")]
    pub server_id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Volume {
    pub id: String,
    pub name: String,
    /// GiB
    pub size: i64,
    pub volume_type: String,
    pub bootable: String,
    pub attachments: Vec<Attachment>,
    pub volume_image_metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct VolumeType {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Network {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct Image {
    pub id: String,
    pub name: String,
    pub status: String,
    pub disk_format: String,
    pub size_bytes: i64,
    pub virtual_size: i64,
    pub properties: BTreeMap<String, Value>,
}

impl Image {
    /// Virtual size when Glance reports it, else the stored size
    pub fn capacity(&self) -> i64 {
        if self.virtual_size > 0 {
            self.virtual_size
        } else {
            self.size_bytes
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

/// Glance image a volume is uploaded to for a migration
pub(crate) fn volume_image_name(ctx: &PlanContext, vm_id: &str, volume_id: &str) -> String {
    format!("{}-{}-{}", ctx.migration_uid(), vm_id, volume_id)
}

/// Glance image an image-booted server is snapshotted to for a migration
pub(crate) fn server_image_name(ctx: &PlanContext, vm_id: &str) -> String {
    format!("{}-{}", ctx.migration_uid(), vm_id)
}

/// Image the disk is transferred from
pub(crate) fn disk_image_name(ctx: &PlanContext, vm: &SourceVm, disk: &SourceDisk) -> String {
    if disk.storage.id == GLANCE_SOURCE {
        server_image_name(ctx, &vm.id)
    } else {
        volume_image_name(ctx, &vm.id, &disk.id)
    }
}

/// Loads OpenStack servers, their volumes and images from the inventory
#[derive(Clone)]
pub(crate) struct OpenstackLoader {
    inventory: Arc<dyn Inventory>,
}

impl OpenstackLoader {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self { inventory }
    }

    pub async fn vm(&self, vm: &Ref) -> Result<Vm> {
        inventory::find_as(self.inventory.as_ref(), VMS, vm).await
    }

    async fn volume(&self, id: &str) -> Result<Volume> {
        inventory::get_as(self.inventory.as_ref(), VOLUMES, id).await
    }

    pub async fn image(&self, id: &str) -> Result<Image> {
        inventory::get_as(self.inventory.as_ref(), IMAGES, id).await
    }

    /// Image with an exact name; `None` until the inventory has seen it
    pub async fn image_named(&self, name: &str) -> Result<Option<Image>> {
        for value in self.inventory.list(IMAGES).await? {
            if value.get("name").and_then(Value::as_str) == Some(name) {
                let image = serde_json::from_value(value).map_err(|e| {
                    Error::serialization_for_kind(IMAGES, e.to_string())
                })?;
                return Ok(Some(image));
            }
        }
        Ok(None)
    }

    async fn volume_type(&self, name: &str) -> Result<Option<VolumeType>> {
        let types: Vec<VolumeType> = self
            .inventory
            .list(VOLUME_TYPES)
            .await?
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        Ok(types.into_iter().find(|t| t.name == name))
    }

    async fn networks(&self) -> Result<Vec<Network>> {
        Ok(self
            .inventory
            .list(NETWORKS)
            .await?
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// Image metadata describing the guest: the boot image's properties,
    /// or the bootable volume's copy of them
    pub async fn guest_properties(&self, vm: &Vm) -> Result<BTreeMap<String, String>> {
        if !vm.image_id.is_empty() {
            let image = self.image(&vm.image_id).await?;
            return Ok(image
                .properties
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect());
        }
        for attached in &vm.attached_volumes {
            let volume = self.volume(&attached.id).await?;
            if volume.bootable.eq_ignore_ascii_case("true") {
                return Ok(volume.volume_image_metadata);
            }
        }
        Ok(BTreeMap::new())
    }

    pub async fn source_vm(&self, vm: &Vm) -> Result<SourceVm> {
        let mut disks = Vec::new();
        if !vm.image_id.is_empty() {
            let image = self.image(&vm.image_id).await?;
            disks.push(SourceDisk {
                id: image.id.clone(),
                name: image.name.clone(),
                capacity_bytes: image.capacity(),
                storage: Ref::with_id(GLANCE_SOURCE),
                bus: Some("virtio".to_string()),
                format: (!image.disk_format.is_empty()).then(|| image.disk_format.clone()),
                ..Default::default()
            });
        }
        for attached in &vm.attached_volumes {
            let volume = self.volume(&attached.id).await?;
            let storage = match self.volume_type(&volume.volume_type).await? {
                Some(t) => Ref::new(t.id, t.name),
                None => Ref::new("", volume.volume_type.clone()),
            };
            disks.push(SourceDisk {
                name: volume.name,
                capacity_bytes: volume.size * GIB,
                storage,
                shared: volume.attachments.len() > 1,
                bus: Some("virtio".to_string()),
                format: Some("raw".to_string()),
                id: volume.id,
                ..Default::default()
            });
        }

        let networks = self.networks().await?;
        let nics = vm
            .addresses
            .iter()
            .flat_map(|(network, addresses)| {
                let id = networks
                    .iter()
                    .find(|n| &n.name == network)
                    .map(|n| n.id.clone())
                    .unwrap_or_default();
                addresses
                    .iter()
                    .filter(|a| a.type_ != "floating")
                    .map(move |a| SourceNic {
                        name: network.clone(),
                        mac: a.mac.clone(),
                        network: Ref::new(id.clone(), network.clone()),
                        ip_addresses: vec![a.addr.clone()],
                    })
            })
            .collect();

        let properties = self.guest_properties(vm).await?;
        let firmware = match properties.get("hw_firmware_type").map(String::as_str) {
            Some("uefi") => FirmwareKind::Efi,
            _ => FirmwareKind::Bios,
        };
        Ok(SourceVm {
            id: vm.id.clone(),
            name: vm.name.clone(),
            power_state: parse_power_state(&vm.status),
            firmware,
            secure_boot: properties
                .get("os_secure_boot")
                .is_some_and(|v| v == "required"),
            cpu_count: vm.flavor.vcpus,
            cores_per_socket: 1,
            memory_mb: vm.flavor.ram,
            guest_os: guest_os(&properties),
            host: (!vm.host_id.is_empty()).then(|| vm.host_id.clone()),
            disks,
            nics,
            ..Default::default()
        })
    }
}

/// `os_distro` and `os_version` joined, e.g. `rhel9.2` or `windows2019`
pub(crate) fn guest_os(properties: &BTreeMap<String, String>) -> String {
    let distro = properties.get("os_distro").map(String::as_str).unwrap_or_default();
    let version = properties.get("os_version").map(String::as_str).unwrap_or_default();
    format!("{}{}", distro, version).to_ascii_lowercase()
}

#[async_trait]
impl VmLoader for OpenstackLoader {
    async fn load(&self, vm: &Ref) -> Result<SourceVm> {
        let raw = self.vm(vm).await?;
        self.source_vm(&raw).await
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    use super::VOLUME_TYPES;
    use crate::inventory::{StaticInventory, IMAGES, NETWORKS, VMS, VOLUMES};

    pub fn vm() -> Value {
        json!({
            "id": "vm-1",
            "name": "web-01",
            "status": "SHUTOFF",
            "imageID": "img-base",
            "flavor": {"vcpus": 2, "ram": 4096},
            "attachedVolumes": [{"id": "vol-1"}],
            "addresses": {
                "tenant": [
                    {"OS-EXT-IPS-MAC:mac_addr": "fa:16:3e:00:00:01", "addr": "10.0.0.5", "OS-EXT-IPS:type": "fixed"},
                    {"OS-EXT-IPS-MAC:mac_addr": "fa:16:3e:00:00:01", "addr": "172.24.4.9", "OS-EXT-IPS:type": "floating"}
                ]
            }
        })
    }

    pub fn inventory() -> StaticInventory {
        StaticInventory::default()
            .with(VMS, vm())
            .with(
                IMAGES,
                json!({"id": "img-base", "name": "rhel-9.2", "status": "active", "diskFormat": "qcow2",
                       "sizeBytes": 1_073_741_824_i64, "virtualSize": 10_737_418_240_i64,
                       "properties": {"os_distro": "rhel", "os_version": "9.2", "hw_firmware_type": "uefi"}}),
            )
            .with(
                VOLUMES,
                json!({"id": "vol-1", "name": "data", "size": 20, "volumeType": "ceph",
                       "bootable": "false", "attachments": [{"serverID": "vm-1"}]}),
            )
            .with(VOLUME_TYPES, json!({"id": "ds-1", "name": "ceph"}))
            .with(NETWORKS, json!({"id": "net-1", "name": "tenant"}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forklift_common::crd::PowerState;

    #[tokio::test]
    async fn maps_server_image_and_volumes() {
        let loader = OpenstackLoader::new(Arc::new(fixtures::inventory()));
        let vm = loader.load(&Ref::with_id("vm-1")).await.unwrap();
        assert_eq!(vm.power_state, PowerState::Off);
        assert_eq!(vm.firmware, FirmwareKind::Efi);
        assert_eq!((vm.cpu_count, vm.memory_mb), (2, 4096));
        assert_eq!(vm.guest_os, "rhel9.2");

        assert_eq!(vm.disks.len(), 2);
        assert_eq!(vm.disks[0].storage.id, GLANCE_SOURCE);
        assert_eq!(vm.disks[0].capacity_bytes, 10_737_418_240);
        assert_eq!(vm.disks[0].format.as_deref(), Some("qcow2"));
        assert_eq!(vm.disks[1].storage, Ref::new("ds-1", "ceph"));
        assert_eq!(vm.disks[1].capacity_bytes, 20 * GIB);
        assert!(!vm.disks[1].shared);

        // Floating addresses are NAT entries, not NICs.
        assert_eq!(vm.nics.len(), 1);
        assert_eq!(vm.nics[0].network, Ref::new("net-1", "tenant"));
        assert_eq!(vm.nics[0].mac, "fa:16:3e:00:00:01");
    }

    #[tokio::test]
    async fn images_are_found_by_exact_name() {
        let loader = OpenstackLoader::new(Arc::new(fixtures::inventory()));
        assert_eq!(
            loader.image_named("rhel-9.2").await.unwrap().map(|i| i.id),
            Some("img-base".to_string())
        );
        assert!(loader.image_named("rhel").await.unwrap().is_none());
    }
}
