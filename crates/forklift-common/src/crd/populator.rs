//! Volume populator CRDs
//!
//! Populators are the alternative to DataVolume sources: the PVC carries a
//! `dataSourceRef` to one of these CRs and a provider-specific populator pod
//! fills it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the populator CRs
pub const POPULATOR_API_GROUP: &str = "forklift.konveyor.io";

/// Populates a PVC from an oVirt disk through imageio
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "OvirtVolumePopulator",
    plural = "ovirtvolumepopulators",
    namespaced,
    status = "PopulatorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct OvirtVolumePopulatorSpec {
    /// Engine API URL
    pub engine_url: String,
    /// Credentials secret
    pub engine_secret_name: String,
    /// Disk ID
    pub disk_id: String,
    /// NetworkAttachmentDefinition for the populator pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_network: Option<String>,
}

/// Populates a PVC from an OpenStack Glance image
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "OpenstackVolumePopulator",
    plural = "openstackvolumepopulators",
    namespaced,
    status = "PopulatorStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct OpenstackVolumePopulatorSpec {
    /// Keystone URL
    pub identity_url: String,
    /// Credentials secret
    pub secret_name: String,
    /// Glance image ID
    pub image_id: String,
    /// NetworkAttachmentDefinition for the populator pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_network: Option<String>,
}

/// Status shared by populator CRs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PopulatorStatus {
    /// Progress; a percentage for oVirt, transferred bytes for OpenStack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    /// Transferred bytes as reported by the OpenStack populator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transferred: Option<String>,
}

impl PopulatorStatus {
    /// Progress as a percentage
    pub fn percent(&self) -> Option<f64> {
        self.progress
            .as_deref()
            .and_then(|p| p.trim_end_matches('%').parse().ok())
    }

    /// Transferred bytes
    pub fn transferred_bytes(&self) -> Option<i64> {
        self.transferred.as_deref().and_then(|t| t.parse().ok())
    }
}
