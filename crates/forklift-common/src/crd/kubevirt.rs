//! KubeVirt VirtualMachine
//!
//! A typed subset of `kubevirt.io/v1` VirtualMachine covering the fields
//! builders populate. Unknown fields on listed objects are ignored.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// KubeVirt VirtualMachine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    namespaced,
    status = "VirtualMachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Run strategy ("Always", "Halted", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_strategy: Option<String>,

    /// Legacy running flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,

    /// Instance type providing CPU and memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instancetype: Option<Matcher>,

    /// Preference providing device defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<Matcher>,

    /// VMI template
    #[serde(default)]
    pub template: VmiTemplate,
}

/// Status of a VirtualMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Human-readable status ("Running", "Stopped", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub printable_status: Option<String>,

    /// Whether the VMI is ready
    #[serde(default)]
    pub ready: bool,
}

/// Reference to an instance type or preference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Matcher {
    /// Object name
    pub name: String,
    /// Object kind (cluster-scoped by default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// VMI template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct VmiTemplate {
    /// Template metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,

    /// VMI spec
    #[serde(default)]
    pub spec: VmiSpec,
}

/// VMI spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VmiSpec {
    /// Virtual hardware
    #[serde(default)]
    pub domain: DomainSpec,

    /// Networks referenced by interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,

    /// Volumes referenced by disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

/// Virtual hardware
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// CPU topology
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,

    /// Guest memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,

    /// Firmware
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Firmware>,

    /// Hypervisor features
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,

    /// Machine type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<Machine>,

    /// Devices
    #[serde(default)]
    pub devices: Devices,
}

/// CPU topology
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Cpu {
    /// Cores per socket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    /// Sockets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sockets: Option<u32>,
    /// Threads per core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
}

/// Guest memory
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Memory {
    /// Memory visible to the guest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<Quantity>,
}

/// Firmware
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Firmware {
    /// SMBIOS serial number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Bootloader
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootloader: Option<Bootloader>,
}

/// Bootloader selection; exactly one of `bios` or `efi`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Bootloader {
    /// Legacy BIOS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bios: Option<EmptyObject>,
    /// UEFI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi: Option<Efi>,
}

/// UEFI settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Efi {
    /// Secure boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_boot: Option<bool>,
}

/// Hypervisor features
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Features {
    /// System management mode (required for secure boot)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smm: Option<FeatureState>,
}

/// Enabled flag for a feature
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct FeatureState {
    /// Whether the feature is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Machine type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Machine {
    /// QEMU machine type (e.g. "q35")
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

/// Devices
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct Devices {
    /// Disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,
    /// Network interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<Interface>,
    /// Input devices
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Input>,
}

/// A disk device
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Name; matches a volume
    pub name: String,
    /// Disk target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskTarget>,
    /// Boot order (1 is first)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<u32>,
    /// Serial number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Shareable between VMs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shareable: Option<bool>,
}

/// Disk bus
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DiskTarget {
    /// Bus ("virtio", "sata", "scsi")
    pub bus: String,
}

/// A network interface
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    /// Name; matches a network
    pub name: String,
    /// MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// NIC model ("virtio", "e1000e")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Masquerade binding (pod network)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masquerade: Option<EmptyObject>,
    /// Bridge binding (multus)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<EmptyObject>,
    /// Network binding plugin (e.g. "l2bridge" for UDN)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<PluginBinding>,
}

/// Network binding plugin
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PluginBinding {
    /// Plugin name
    pub name: String,
}

/// An input device
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Input {
    /// Device name
    pub name: String,
    /// Device type ("tablet")
    #[serde(rename = "type")]
    pub type_: String,
    /// Bus ("virtio", "usb")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
}

/// A network referenced by an interface
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Network {
    /// Name; matches an interface
    pub name: String,
    /// Pod network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<EmptyObject>,
    /// Multus network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multus: Option<MultusNetwork>,
}

/// Multus network reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MultusNetwork {
    /// `namespace/name` of the NetworkAttachmentDefinition
    pub network_name: String,
}

/// A volume referenced by a disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Name; matches a disk
    pub name: String,
    /// PVC backing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PvcVolumeSource>,
    /// DataVolume backing; the PVC carries the DataVolume's name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeVolumeSource>,
}

impl Volume {
    /// Name of the PVC behind the volume, for PVC and DataVolume backings
    pub fn claim_name(&self) -> Option<&str> {
        self.persistent_volume_claim
            .as_ref()
            .map(|p| p.claim_name.as_str())
            .or_else(|| self.data_volume.as_ref().map(|d| d.name.as_str()))
    }
}

/// DataVolume volume source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DataVolumeVolumeSource {
    /// DataVolume name
    pub name: String,
}

/// PVC volume source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcVolumeSource {
    /// PVC name
    pub claim_name: String,
}

/// Serializes as `{}`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EmptyObject {}

impl VirtualMachineSpec {
    /// MAC addresses of every interface, in order; unset MACs are ""
    pub fn interface_macs(&self) -> Vec<String> {
        self.template
            .spec
            .domain
            .devices
            .interfaces
            .iter()
            .map(|i| i.mac_address.clone().unwrap_or_default())
            .collect()
    }
}
