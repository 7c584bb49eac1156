//! NetworkMap and StorageMap CRDs
//!
//! Mappings pair source inventory objects with destination descriptors. A
//! Migration resolves both maps once at start; the resolved snapshots drive
//! every Builder and Validator call.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ProviderPair, Ref};

// =============================================================================
// NetworkMap
// =============================================================================

/// Maps source networks to destination networks
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "NetworkMap",
    plural = "networkmaps",
    namespaced,
    status = "MapStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMapSpec {
    /// Provider pair the map applies to
    pub provider: ProviderPair,

    /// Network pairs
    #[serde(default)]
    pub map: Vec<NetworkPair>,
}

/// One source network and its destination
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NetworkPair {
    /// Source network
    pub source: Ref,
    /// Destination network
    pub destination: DestinationNetwork,
}

/// Destination network kind
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// The pod network
    #[default]
    Pod,
    /// A Multus NetworkAttachmentDefinition
    Multus,
    /// Skip NICs on this network
    Ignored,
}

/// Destination network descriptor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DestinationNetwork {
    /// Network kind
    #[serde(rename = "type")]
    pub type_: NetworkType,

    /// NetworkAttachmentDefinition name (multus only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// NetworkAttachmentDefinition namespace (multus only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl DestinationNetwork {
    /// `namespace/name` for multus network references
    pub fn network_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

impl NetworkMapSpec {
    /// Destination for a source network, if mapped
    pub fn find(&self, source: &Ref) -> Option<&DestinationNetwork> {
        self.map
            .iter()
            .find(|pair| pair.source.matches(source))
            .map(|pair| &pair.destination)
    }

    /// Number of pairs mapped to the pod network
    pub fn pod_mappings(&self) -> usize {
        self.map
            .iter()
            .filter(|p| p.destination.type_ == NetworkType::Pod)
            .count()
    }
}

// =============================================================================
// StorageMap
// =============================================================================

/// Maps source storage (datastores, storage domains, volume types) to classes
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "StorageMap",
    plural = "storagemaps",
    namespaced,
    status = "MapStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct StorageMapSpec {
    /// Provider pair the map applies to
    pub provider: ProviderPair,

    /// Storage pairs
    #[serde(default)]
    pub map: Vec<StoragePair>,
}

/// One source storage and its destination
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StoragePair {
    /// Source storage; the name "glance" selects OpenStack image-backed disks
    pub source: Ref,
    /// Destination storage
    pub destination: DestinationStorage,
}

/// Destination storage descriptor
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStorage {
    /// StorageClass for created volumes
    pub storage_class: String,

    /// Access mode (ReadWriteOnce, ReadWriteMany, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,

    /// Volume mode (Filesystem or Block)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
}

/// Volume mode for block devices
pub const VOLUME_MODE_BLOCK: &str = "Block";
/// Volume mode for filesystems
pub const VOLUME_MODE_FILESYSTEM: &str = "Filesystem";
/// Source storage name for OpenStack image-backed disks
pub const GLANCE_SOURCE: &str = "glance";

impl StorageMapSpec {
    /// Destination for a source storage, if mapped
    pub fn find(&self, source: &Ref) -> Option<&DestinationStorage> {
        self.map
            .iter()
            .find(|pair| pair.source.matches(source))
            .map(|pair| &pair.destination)
    }

    /// Destination for the "glance" pseudo-storage
    pub fn glance(&self) -> Option<&DestinationStorage> {
        self.map
            .iter()
            .find(|pair| pair.source.name == GLANCE_SOURCE)
            .map(|pair| &pair.destination)
    }
}

/// Status shared by both map kinds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct MapStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
