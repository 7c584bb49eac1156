//! CDI DataVolume
//!
//! A typed subset of `cdi.kubevirt.io/v1beta1` DataVolume. The source is a
//! closed set of typed variants; dynamic providers return the same JSON shape.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::VolumeResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::kubevirt::EmptyObject;

/// CDI DataVolume
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "DataVolume",
    plural = "datavolumes",
    shortname = "dv",
    namespaced,
    status = "DataVolumeStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    /// Where the contents come from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DataVolumeSource>,

    /// Volume to create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Warm migration checkpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checkpoints: Vec<DataVolumeCheckpoint>,

    /// Whether the last checkpoint is final
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub final_checkpoint: bool,
}

/// Source of a DataVolume; exactly one field is set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DataVolumeSource {
    /// Empty volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blank: Option<EmptyObject>,
    /// HTTP(S) download
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSource>,
    /// Container registry image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistrySource>,
    /// Clone of an existing PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PvcSource>,
    /// vSphere VDDK import
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vddk: Option<VddkSource>,
    /// oVirt imageio import
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imageio: Option<ImageioSource>,
}

impl DataVolumeSource {
    /// A blank source
    pub fn blank() -> Self {
        Self {
            blank: Some(EmptyObject {}),
            ..Default::default()
        }
    }
}

/// HTTP source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpSource {
    /// URL
    pub url: String,
    /// Secret with accessKeyId/secretKey
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    /// ConfigMap with a CA bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
    /// Secrets whose values are sent as extra headers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_extra_headers: Vec<String>,
}

/// Registry source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySource {
    /// Image URL
    pub url: String,
    /// Pull secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

/// PVC clone source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PvcSource {
    /// PVC name
    pub name: String,
    /// PVC namespace
    pub namespace: String,
}

/// vSphere VDDK source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VddkSource {
    /// Datastore path of the disk backing file
    pub backing_file: String,
    /// VM BIOS UUID
    pub uuid: String,
    /// vCenter/ESXi SDK URL
    pub url: String,
    /// Credentials secret
    pub secret_ref: String,
    /// Server certificate thumbprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,
    /// Image carrying the VDDK library
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_image_url: Option<String>,
}

/// oVirt imageio source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageioSource {
    /// Engine API URL
    pub url: String,
    /// Disk ID
    pub disk_id: String,
    /// Credentials secret
    pub secret_ref: String,
    /// ConfigMap with the engine CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
}

/// Volume to create for a DataVolume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Access modes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_modes: Option<Vec<String>>,
    /// Volume mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    /// StorageClass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    /// Size request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<VolumeResourceRequirements>,
}

impl StorageSpec {
    /// Storage with a size request and optional class/mode overrides
    pub fn sized(
        size: Quantity,
        storage_class: &str,
        access_mode: Option<&str>,
        volume_mode: Option<&str>,
    ) -> Self {
        Self {
            access_modes: access_mode.map(|m| vec![m.to_string()]),
            volume_mode: volume_mode.map(str::to_string),
            storage_class_name: (!storage_class.is_empty()).then(|| storage_class.to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), size)])),
                ..Default::default()
            }),
        }
    }

    /// The requested size
    pub fn size(&self) -> Option<&Quantity> {
        self.resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
    }
}

/// A warm migration checkpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DataVolumeCheckpoint {
    /// Previous snapshot/change ID ("" for the first)
    pub previous: String,
    /// Current snapshot/change ID
    pub current: String,
}

/// Status of a DataVolume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStatus {
    /// Phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Progress as a percentage string, e.g. "45.5%"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    /// Bound PVC name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_name: Option<String>,
    /// Importer restarts
    #[serde(default)]
    pub restart_count: i32,
}

/// DataVolume phases the pipeline and converter act on
pub mod phase {
    /// Waiting to be scheduled
    pub const PENDING: &str = "Pending";
    /// PVC bound
    pub const PVC_BOUND: &str = "PVCBound";
    /// Importer pod scheduled
    pub const IMPORT_SCHEDULED: &str = "ImportScheduled";
    /// Importer running
    pub const IMPORT_IN_PROGRESS: &str = "ImportInProgress";
    /// Warm importer waiting for the next checkpoint
    pub const PAUSED: &str = "Paused";
    /// Done
    pub const SUCCEEDED: &str = "Succeeded";
    /// Failed
    pub const FAILED: &str = "Failed";
    /// Waiting for a consumer pod
    pub const WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";
}

impl DataVolume {
    /// Current phase, or "" when unknown
    pub fn phase(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("")
    }

    /// Progress as a number in [0, 100], if reported
    pub fn progress_percent(&self) -> Option<f64> {
        self.status
            .as_ref()
            .and_then(|s| s.progress.as_deref())
            .and_then(|p| p.trim_end_matches('%').parse::<f64>().ok())
    }
}
