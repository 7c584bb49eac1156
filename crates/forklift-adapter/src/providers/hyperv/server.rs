//! Power control through the Hyper-V provider server
//!
//! The provider server holds the WinRM session to the Hyper-V host; the
//! controller asks it to stop a VM and reads power state from inventory.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

#[cfg(test)]
use mockall::automock;

use forklift_common::{Error, Result};

/// Calls the Hyper-V provider server makes on the controller's behalf
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait HypervServer: Send + Sync {
    /// Stop the VM named `vm_name` (Hyper-V addresses VMs by name)
    async fn stop_vm(&self, vm_id: &str, vm_name: &str) -> Result<()>;
}

/// [`HypervServer`] over HTTP
pub(crate) struct HttpHypervServer {
    http: reqwest::Client,
    base: Url,
}

impl HttpHypervServer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::http(base_url, format!("invalid provider URL: {}", e)))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("hyperv provider", e.to_string()))?;
        Ok(Self { http, base })
    }

    fn stop_url(&self, vm_id: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::http(self.base.as_str(), "provider URL cannot be a base"))?
            .pop_if_empty()
            .extend(["vms", vm_id, "stop"]);
        Ok(url)
    }
}

#[async_trait]
impl HypervServer for HttpHypervServer {
    async fn stop_vm(&self, vm_id: &str, vm_name: &str) -> Result<()> {
        let url = self.stop_url(vm_id)?;
        debug!(url = %url, vm = vm_name, "hyperv stop request");
        let response = self
            .http
            .post(url.clone())
            .json(&serde_json::json!({ "name": vm_name }))
            .send()
            .await
            .map_err(|e| Error::http(url.as_str(), e.to_string()))?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::http_status(url.as_str(), status.as_u16(), body))
            }
        }
    }
}
