//! Client for the dynamic provider server
//!
//! The provider server answers three calls on behalf of the controller:
//! the CDI source of a disk, the virt-v2v input type of a VM, and (when the
//! provider advertises a custom builder) the whole VM spec.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::{DataVolumeSource, VirtualMachineSpec};
use forklift_common::{Error, Result};

/// Body of a datavolume-source request
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourceRequest {
    /// StorageClass the disk lands on
    pub target_storage_class: String,
    /// Namespace of the DataVolume
    pub target_namespace: String,
}

/// Answer of a datavolume-source request
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DataVolumeSourceResponse {
    /// CDI source for the disk
    pub source: DataVolumeSource,
    /// Size of the volume as a Kubernetes quantity
    pub size: String,
    /// Provider-specific extras
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Plan identity sent with a build-spec request
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PlanIdentity {
    /// Plan name
    pub name: String,
    /// Plan namespace
    pub namespace: String,
}

/// Body of a build-spec request
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct BuildSpecRequest {
    /// The plan asking
    pub plan: PlanIdentity,
}

/// The VM returned by build-spec; only the spec is used
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RemoteVirtualMachine {
    /// VM spec
    #[serde(default)]
    pub spec: VirtualMachineSpec,
}

/// What the provider detected while building the spec
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpecMetadata {
    /// Detected guest OS
    #[serde(default, rename = "detectedOS")]
    pub detected_os: Option<String>,
    /// Firmware the spec uses
    #[serde(default)]
    pub firmware: Option<String>,
    /// Secure boot enabled
    #[serde(default)]
    pub secure_boot: bool,
    /// Guest tools were found
    #[serde(default)]
    pub guest_tools_detected: bool,
}

/// Answer of a build-spec request
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpecResponse {
    /// The VM to create
    pub virtual_machine: RemoteVirtualMachine,
    /// Detection results
    #[serde(default)]
    pub metadata: BuildSpecMetadata,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputTypeResponse {
    input_type: String,
}

/// Calls into a dynamic provider server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DynamicService: Send + Sync {
    /// CDI source and size for one disk
    async fn datavolume_source(
        &self,
        vm_id: &str,
        disk_id: &str,
        request: &DataVolumeSourceRequest,
    ) -> Result<DataVolumeSourceResponse>;

    /// virt-v2v input type for a VM ("ova" or "libvirtxml")
    async fn v2v_input_type(&self, vm_id: &str) -> Result<String>;

    /// Complete VM spec built by the provider
    async fn build_spec(&self, vm_id: &str, request: &BuildSpecRequest)
        -> Result<BuildSpecResponse>;
}

/// [`DynamicService`] over HTTP
pub struct HttpDynamicService {
    http: reqwest::Client,
    base: Url,
}

impl HttpDynamicService {
    /// Client for the server at `base_url`; every call is bounded by `timeout`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::http(base_url, format!("invalid provider URL: {}", e)))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("dynamic provider", e.to_string()))?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::http(self.base.as_str(), "provider URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn datavolume_source_request(
        &self,
        vm_id: &str,
        disk_id: &str,
        body: &DataVolumeSourceRequest,
    ) -> Result<reqwest::Request> {
        let url = self.endpoint(&["vms", vm_id, "disks", disk_id, "datavolume-source"])?;
        self.http
            .post(url.clone())
            .json(body)
            .build()
            .map_err(|e| Error::http(url.as_str(), e.to_string()))
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::Request) -> Result<T> {
        let url = request.url().to_string();
        debug!(method = %request.method(), url = %url, "dynamic provider request");
        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| Error::http(&url, e.to_string()))?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::http_status(url, status.as_u16(), body));
        }
        response
            .json()
            .await
            .map_err(|e| Error::http(url, format!("invalid JSON: {}", e)))
    }
}

#[async_trait]
impl DynamicService for HttpDynamicService {
    async fn datavolume_source(
        &self,
        vm_id: &str,
        disk_id: &str,
        request: &DataVolumeSourceRequest,
    ) -> Result<DataVolumeSourceResponse> {
        let request = self.datavolume_source_request(vm_id, disk_id, request)?;
        self.execute(request).await
    }

    async fn v2v_input_type(&self, vm_id: &str) -> Result<String> {
        let url = self.endpoint(&["vms", vm_id, "v2v-input-type"])?;
        let request = self
            .http
            .get(url.clone())
            .build()
            .map_err(|e| Error::http(url.as_str(), e.to_string()))?;
        let response: InputTypeResponse = self.execute(request).await?;
        Ok(response.input_type)
    }

    async fn build_spec(
        &self,
        vm_id: &str,
        request: &BuildSpecRequest,
    ) -> Result<BuildSpecResponse> {
        let url = self.endpoint(&["vms", vm_id, "build-spec"])?;
        let request = self
            .http
            .post(url.clone())
            .json(request)
            .build()
            .map_err(|e| Error::http(url.as_str(), e.to_string()))?;
        self.execute(request).await
    }
}
