//! Field-path schemas for dynamic providers
//!
//! A dynamic provider's inventory objects are opaque JSON. A [`ProviderSchema`]
//! maps semantic field names (`id`, `cpuCount`, `disks`, ...) to dotted JSON
//! paths within those objects. Paths are looked up exactly as stored.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Field mapping for one inventory object kind
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Fields that must be present on every object
    #[serde(default)]
    pub required: BTreeMap<String, String>,

    /// Optional fields
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Schema {
    /// Resolve a semantic field name to its JSON path
    ///
    /// Required fields shadow optional ones with the same name.
    pub fn get_field(&self, name: &str) -> Option<&str> {
        self.required
            .get(name)
            .or_else(|| self.fields.get(name))
            .map(String::as_str)
    }

    fn with_required(mut self, name: &str, path: &str) -> Self {
        self.required.insert(name.to_string(), path.to_string());
        self
    }

    fn with_field(mut self, name: &str, path: &str) -> Self {
        self.fields.insert(name.to_string(), path.to_string());
        self
    }
}

/// Which sub-schema a lookup targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaKind {
    /// Virtual machine objects
    Vm,
    /// Disk objects
    Disk,
    /// Network objects
    Network,
    /// NIC objects (nested in VMs)
    Nic,
    /// Storage objects
    Storage,
}

impl std::fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vm => write!(f, "VM"),
            Self::Disk => write!(f, "Disk"),
            Self::Network => write!(f, "Network"),
            Self::Nic => write!(f, "NIC"),
            Self::Storage => write!(f, "Storage"),
        }
    }
}

/// Complete schema for a dynamic provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProviderSchema {
    /// Virtual machine fields
    #[serde(default, rename = "VM")]
    pub vm: Schema,
    /// Disk fields
    #[serde(default, rename = "Disk")]
    pub disk: Schema,
    /// Network fields
    #[serde(default, rename = "Network")]
    pub network: Schema,
    /// NIC fields
    #[serde(default, rename = "NIC")]
    pub nic: Schema,
    /// Storage fields
    #[serde(default, rename = "Storage")]
    pub storage: Schema,
}

/// Fields every dynamic schema must define
const MINIMUM_CONTRACT: &[(SchemaKind, &str)] = &[
    (SchemaKind::Vm, "id"),
    (SchemaKind::Vm, "name"),
    (SchemaKind::Disk, "id"),
    (SchemaKind::Disk, "capacity"),
    (SchemaKind::Network, "id"),
    (SchemaKind::Network, "name"),
];

impl ProviderSchema {
    /// Sub-schema for a kind
    pub fn schema(&self, kind: SchemaKind) -> &Schema {
        match kind {
            SchemaKind::Vm => &self.vm,
            SchemaKind::Disk => &self.disk,
            SchemaKind::Network => &self.network,
            SchemaKind::Nic => &self.nic,
            SchemaKind::Storage => &self.storage,
        }
    }

    /// Resolve a field path for a kind
    pub fn get_field(&self, kind: SchemaKind, name: &str) -> Option<&str> {
        self.schema(kind).get_field(name)
    }

    /// Check the minimum contract, listing every missing field
    pub fn validate(&self) -> Result<(), Error> {
        let missing: Vec<String> = MINIMUM_CONTRACT
            .iter()
            .filter(|(kind, name)| self.get_field(*kind, name).is_none())
            .map(|(kind, name)| format!("{}.{}", kind, name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::validation_for_field(
                crate::error::UNKNOWN_CONTEXT,
                "spec.schema",
                format!("schema is missing required fields: {}", missing.join(", ")),
            ))
        }
    }

    /// Schema used when a provider does not supply one
    pub fn generic() -> Self {
        Self {
            vm: Schema::default()
                .with_required("id", "id")
                .with_required("name", "name")
                .with_field("cpuCount", "cpuCount")
                .with_field("memoryMB", "memoryMB")
                .with_field("disks", "disks")
                .with_field("networks", "networks")
                .with_field("nics", "nics")
                .with_field("firmware", "firmware")
                .with_field("secureBoot", "secureBoot")
                .with_field("powerState", "powerState")
                .with_field("uuid", "uuid"),
            disk: Schema::default()
                .with_required("id", "id")
                .with_required("capacity", "capacity")
                .with_field("name", "name")
                .with_field("storage", "storage")
                .with_field("shared", "shared"),
            network: Schema::default()
                .with_required("id", "id")
                .with_required("name", "name"),
            nic: Schema::default()
                .with_required("id", "id")
                .with_field("network", "network")
                .with_field("mac", "mac"),
            storage: Schema::default()
                .with_required("id", "id")
                .with_field("name", "name"),
        }
    }

    /// Schema matching the OVA provider server's inventory layout
    pub fn ova() -> Self {
        Self {
            vm: Schema::default()
                .with_required("id", "ID")
                .with_required("name", "Name")
                .with_field("cpuCount", "CpuCount")
                .with_field("coresPerSocket", "CoresPerSocket")
                .with_field("memoryMB", "MemoryMB")
                .with_field("memoryUnits", "MemoryUnits")
                .with_field("disks", "Disks")
                .with_field("networks", "Networks")
                .with_field("nics", "NICs")
                .with_field("firmware", "Firmware")
                .with_field("secureBoot", "SecureBoot")
                .with_field("uuid", "UUID")
                .with_field("ovaPath", "OvaPath"),
            disk: Schema::default()
                .with_required("id", "ID")
                .with_required("capacity", "Capacity")
                .with_field("name", "Name")
                .with_field("filePath", "FilePath")
                .with_field("storage", "Datastore.ID")
                .with_field("format", "Format")
                .with_field("capacityAllocationUnits", "CapacityAllocationUnits"),
            network: Schema::default()
                .with_required("id", "ID")
                .with_required("name", "Name"),
            nic: Schema::default()
                .with_required("name", "Name")
                .with_field("network", "Network")
                .with_field("mac", "MAC"),
            storage: Schema::default()
                .with_required("id", "ID")
                .with_field("name", "Name"),
        }
    }
}
