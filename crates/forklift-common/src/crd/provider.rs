//! Provider CRD
//!
//! A Provider describes a source or destination virtualization platform: its
//! kind, endpoint and credentials. Dynamic providers additionally publish the
//! feature flags and service endpoint of their out-of-process provider server.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::schema::ProviderSchema;
use super::types::{Condition, ProviderType, ResourceRef};
use super::MigrationType;

/// Provider describes a virtualization platform
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Provider",
    plural = "providers",
    namespaced,
    status = "ProviderStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Provider kind
    #[serde(rename = "type")]
    pub type_: ProviderType,

    /// API endpoint; empty means the local (host) cluster for openshift
    #[serde(default)]
    pub url: String,

    /// Credentials secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<ResourceRef>,

    /// Provider-specific settings (e.g. "vddkInitImage", "sdkEndpoint")
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,

    /// Inventory schema for dynamic providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ProviderSchema>,
}

/// Status of a Provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// Current phase (e.g. "Ready", "ConnectionFailed")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Capabilities reported by a dynamic provider server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<ProviderFeatures>,

    /// In-cluster service fronting a dynamic provider server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ProviderService>,
}

/// Capabilities of a dynamic provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderFeatures {
    /// Disks land in a non-raw format and must go through the converter
    #[serde(default)]
    pub requires_conversion: bool,

    /// Migration types the provider can perform
    #[serde(default)]
    pub supported_migration_types: Vec<MigrationType>,

    /// The server implements `POST /vms/{id}/build-spec`
    #[serde(default)]
    pub supports_custom_builder: bool,
}

/// Service endpoint of a dynamic provider server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ProviderService {
    /// Service name
    pub name: String,
    /// Service namespace
    pub namespace: String,
    /// Service port
    pub port: u16,
}

impl ProviderService {
    /// In-cluster base URL of the service
    pub fn base_url(&self) -> String {
        format!(
            "http://{}.{}.svc.cluster.local:{}",
            self.name, self.namespace, self.port
        )
    }
}

/// Settings key: VDDK init image for vSphere imports
pub const SETTING_VDDK_INIT_IMAGE: &str = "vddkInitImage";
/// Settings key: vSphere SDK endpoint type ("vcenter" or "esxi")
pub const SETTING_SDK_ENDPOINT: &str = "sdkEndpoint";
/// Settings key: use virt-v2v for the copy instead of VDDK importers
pub const SETTING_USE_V2V_COPY: &str = "useVirtV2vCopy";

impl Provider {
    /// Provider kind
    pub fn provider_type(&self) -> ProviderType {
        self.spec.type_
    }

    /// Whether this provider is the local cluster
    pub fn is_host(&self) -> bool {
        self.spec.type_ == ProviderType::Openshift && self.spec.url.is_empty()
    }

    /// A provider setting
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.spec.settings.get(key).map(String::as_str)
    }

    /// Dynamic provider features, defaulting to none
    pub fn features(&self) -> ProviderFeatures {
        self.status
            .as_ref()
            .and_then(|s| s.features.clone())
            .unwrap_or_default()
    }

    /// Base URL of the dynamic provider server
    ///
    /// Prefers the published service; falls back to `spec.url`.
    pub fn service_url(&self) -> Option<String> {
        self.status
            .as_ref()
            .and_then(|s| s.service.as_ref())
            .map(ProviderService::base_url)
            .or_else(|| {
                (!self.spec.url.is_empty()).then(|| self.spec.url.trim_end_matches('/').to_string())
            })
    }

    /// Schema for a dynamic provider, defaulting to the generic one
    pub fn schema(&self) -> ProviderSchema {
        self.spec.schema.clone().unwrap_or_else(ProviderSchema::generic)
    }
}
