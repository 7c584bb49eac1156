//! oVirt engine REST API

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::PowerState;
use forklift_common::{Error, Result};

use crate::providers::parse_power_state;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const SNAPSHOT_DESCRIPTION: &str = "Forklift Operator warm migration precopy";

/// Engine calls the controller makes on a VM
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait OvirtApi: Send + Sync {
    /// Power state of a VM
    async fn vm_status(&self, vm: &str) -> Result<PowerState>;

    /// Start a VM
    async fn start(&self, vm: &str) -> Result<()>;

    /// Stop a VM
    async fn stop(&self, vm: &str) -> Result<()>;

    /// Create a disk-only snapshot; returns its ID
    async fn create_snapshot(&self, vm: &str) -> Result<String>;

    /// Snapshot status ("locked", "ok"), `None` once it is gone
    async fn snapshot_status(&self, vm: &str, snapshot: &str) -> Result<Option<String>>;

    /// Delete a snapshot
    async fn remove_snapshot(&self, vm: &str, snapshot: &str) -> Result<()>;

    /// Image ID of every disk at a snapshot, keyed by disk ID
    async fn snapshot_disks(&self, vm: &str, snapshot: &str) -> Result<BTreeMap<String, String>>;
}

#[derive(Deserialize)]
struct SnapshotBody {
    #[serde(default)]
    id: String,
    #[serde(default)]
    snapshot_status: String,
}

#[derive(Deserialize)]
struct SnapshotDisk {
    id: String,
    #[serde(default)]
    image_id: String,
}

#[derive(Deserialize)]
struct SnapshotDisks {
    #[serde(default)]
    disk: Vec<SnapshotDisk>,
}

/// [`OvirtApi`] over HTTP basic auth
pub(crate) struct HttpOvirtApi {
    http: reqwest::Client,
    base: url::Url,
    user: String,
    password: String,
}

impl HttpOvirtApi {
    /// API rooted at the engine URL (`https://engine/ovirt-engine/api`)
    pub fn new(engine_url: &str, user: String, password: String, insecure: bool) -> Result<Self> {
        let base = url::Url::parse(engine_url)
            .map_err(|e| Error::http(engine_url, format!("invalid engine URL: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::http(engine_url, "engine URL cannot be a base"));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| Error::internal_with_context("ovirt", e.to_string()))?;
        Ok(Self {
            http,
            base,
            user,
            password,
        })
    }

    fn url(&self, segments: &[&str]) -> String {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.to_string()
    }

    /// Send a request; `None` on 404
    async fn call(&self, method: Method, url: String, body: Option<Value>) -> Result<Option<Value>> {
        debug!(method = %method, url = %url, "oVirt request");
        let mut request = self
            .http
            .request(method, &url)
            .basic_auth(&self.user, Some(&self.password))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::http(&url, e.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::http_status(url, status.as_u16(), body));
        }
        let text = response
            .text()
            .await
            .map_err(|e| Error::http(&url, e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| Error::http(url, format!("invalid JSON: {}", e)))
    }

    async fn required(&self, method: Method, url: String, body: Option<Value>) -> Result<Value> {
        self.call(method, url.clone(), body)
            .await?
            .ok_or_else(|| Error::http_status(url, 404, "not found"))
    }

    async fn action(&self, vm: &str, action: &str) -> Result<()> {
        self.required(Method::POST, self.url(&["vms", vm, action]), Some(json!({})))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OvirtApi for HttpOvirtApi {
    async fn vm_status(&self, vm: &str) -> Result<PowerState> {
        let body = self
            .required(Method::GET, self.url(&["vms", vm]), None)
            .await?;
        Ok(parse_power_state(
            body.get("status").and_then(Value::as_str).unwrap_or_default(),
        ))
    }

    async fn start(&self, vm: &str) -> Result<()> {
        self.action(vm, "start").await
    }

    async fn stop(&self, vm: &str) -> Result<()> {
        self.action(vm, "stop").await
    }

    async fn create_snapshot(&self, vm: &str) -> Result<String> {
        let body = self
            .required(
                Method::POST,
                self.url(&["vms", vm, "snapshots"]),
                Some(json!({
                    "description": SNAPSHOT_DESCRIPTION,
                    "persist_memorystate": false,
                })),
            )
            .await?;
        let snapshot: SnapshotBody = serde_json::from_value(body)
            .map_err(|e| Error::serialization_for_kind("Snapshot", e.to_string()))?;
        Ok(snapshot.id)
    }

    async fn snapshot_status(&self, vm: &str, snapshot: &str) -> Result<Option<String>> {
        let Some(body) = self
            .call(Method::GET, self.url(&["vms", vm, "snapshots", snapshot]), None)
            .await?
        else {
            return Ok(None);
        };
        let snapshot: SnapshotBody = serde_json::from_value(body)
            .map_err(|e| Error::serialization_for_kind("Snapshot", e.to_string()))?;
        Ok(Some(snapshot.snapshot_status))
    }

    async fn remove_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.call(
            Method::DELETE,
            self.url(&["vms", vm, "snapshots", snapshot]),
            None,
        )
        .await?;
        Ok(())
    }

    async fn snapshot_disks(&self, vm: &str, snapshot: &str) -> Result<BTreeMap<String, String>> {
        let body = self
            .required(
                Method::GET,
                self.url(&["vms", vm, "snapshots", snapshot, "disks"]),
                None,
            )
            .await?;
        let disks: SnapshotDisks = serde_json::from_value(body)
            .map_err(|e| Error::serialization_for_kind("Disk", e.to_string()))?;
        Ok(disks
            .disk
            .into_iter()
            .filter(|d| !d.image_id.is_empty())
            .map(|d| (d.id, d.image_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_extend_the_engine_path() {
        let api = HttpOvirtApi::new(
            "https://engine.example.com/ovirt-engine/api/",
            "admin@internal".to_string(),
            "secret".to_string(),
            false,
        )
        .unwrap();
        assert_eq!(
            api.url(&["vms", "vm-1", "snapshots", "s-1"]),
            "https://engine.example.com/ovirt-engine/api/vms/vm-1/snapshots/s-1"
        );
    }

    #[test]
    fn snapshot_disks_decode() {
        let disks: SnapshotDisks = serde_json::from_value(json!({
            "disk": [
                {"id": "d-1", "image_id": "img-9"},
                {"id": "d-2"}
            ]
        }))
        .unwrap();
        assert_eq!(disks.disk.len(), 2);
        assert_eq!(disks.disk[0].image_id, "img-9");
        assert!(disks.disk[1].image_id.is_empty());
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(HttpOvirtApi::new("mailto:admin@example.com", String::new(), String::new(), false).is_err());
    }
}
