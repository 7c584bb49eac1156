//! Provider-neutral view of a source VM
//!
//! Each provider maps its inventory object into a [`SourceVm`]. The shared
//! checks, VM-spec mapping and draft helpers work on this view so that they
//! are written once and behave identically for every provider.

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::{PowerState, Ref};
use forklift_common::Result;

/// Firmware of a source VM
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FirmwareKind {
    /// Legacy BIOS
    #[default]
    Bios,
    /// UEFI
    Efi,
}

impl FirmwareKind {
    /// Parse a provider firmware string; anything mentioning EFI is UEFI
    pub fn parse(s: &str) -> Self {
        if s.to_ascii_lowercase().contains("efi") {
            Self::Efi
        } else {
            Self::Bios
        }
    }

    /// Name recorded on the VM status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bios => "bios",
            Self::Efi => "efi",
        }
    }
}

/// A direct-attached LUN
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Lun {
    /// LUN identifier
    pub lun_id: String,
    /// iSCSI target IQN
    pub target: String,
    /// iSCSI portal address
    pub portal: String,
    /// LUN number
    pub lun: i32,
}

/// A source disk
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceDisk {
    /// Stable identifier within the VM
    pub id: String,
    /// Display name
    pub name: String,
    /// Backing file or path, where the provider has one
    pub file: String,
    /// Capacity in bytes
    pub capacity_bytes: i64,
    /// Storage domain, datastore or volume type the disk lives on
    pub storage: Ref,
    /// Attached to more than one VM
    pub shared: bool,
    /// Source bus (scsi, sata, ide, ...)
    pub bus: Option<String>,
    /// On-disk format (raw, qcow2, vmdk)
    pub format: Option<String>,
    /// Set for direct-attached LUNs
    pub lun: Option<Lun>,
}

/// A source NIC
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceNic {
    /// Display name
    pub name: String,
    /// MAC address, "" when unset
    pub mac: String,
    /// Network the NIC is attached to
    pub network: Ref,
    /// Guest IP addresses reported by tools
    pub ip_addresses: Vec<String>,
}

/// Provider-neutral source VM
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceVm {
    /// Provider ID
    pub id: String,
    /// Name
    pub name: String,
    /// BIOS UUID, used as the destination serial
    pub uuid: String,
    /// Current power state
    pub power_state: PowerState,
    /// Firmware
    pub firmware: FirmwareKind,
    /// Secure boot enabled
    pub secure_boot: bool,
    /// Total vCPUs
    pub cpu_count: u32,
    /// Cores per socket
    pub cores_per_socket: u32,
    /// Memory in MiB
    pub memory_mb: i64,
    /// Guest OS identifier as reported by the provider
    pub guest_os: String,
    /// Host the VM runs on
    pub host: Option<String>,
    /// Changed block tracking enabled
    pub change_tracking_enabled: bool,
    /// VM has snapshots
    pub has_snapshot: bool,
    /// Guest tools report static IP configuration
    pub static_ips: bool,
    /// Disks in source order
    pub disks: Vec<SourceDisk>,
    /// NICs in source order
    pub nics: Vec<SourceNic>,
}

impl SourceVm {
    /// Reference to this VM
    pub fn reference(&self) -> Ref {
        Ref::new(self.id.clone(), self.name.clone())
    }

    /// MAC addresses in NIC order, including unset ones
    pub fn macs(&self) -> Vec<String> {
        self.nics.iter().map(|n| n.mac.clone()).collect()
    }

    /// Sum of disk capacities in bytes
    pub fn total_capacity(&self) -> i64 {
        self.disks.iter().map(|d| d.capacity_bytes).sum()
    }
}

/// Loads source VMs from a provider's inventory
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VmLoader: Send + Sync {
    /// The provider-neutral view of a VM
    async fn load(&self, vm: &Ref) -> Result<SourceVm>;

    /// Whether the VM's host is usable (not in maintenance)
    async fn host_ready(&self, _vm: &SourceVm) -> Result<bool> {
        Ok(true)
    }
}
