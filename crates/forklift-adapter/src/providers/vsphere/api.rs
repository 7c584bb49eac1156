//! vSphere VI/JSON API
//!
//! The controller needs a handful of managed-object calls: find a VM by
//! BIOS UUID, read and change its power state, and drive snapshots. Each
//! mutating call returns a Task reference that is polled on later
//! reconciles instead of waited on.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::PowerState;
use forklift_common::{Error, Result};

use crate::providers::parse_power_state;

const API_RELEASE: &str = "8.0.1.0";
const SESSION_HEADER: &str = "vmware-api-session-id";
const SNAPSHOT_NAME: &str = "forklift-migration-precopy";
const SNAPSHOT_DESCRIPTION: &str = "Forklift Operator warm migration precopy";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// State of a vSphere Task
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Queued or running
    Running,
    /// Finished; carries the result MoRef value when there is one
    Success(Option<String>),
    /// Failed with a message
    Error(String),
}

/// Managed-object calls against vCenter or ESXi
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait VsphereApi: Send + Sync {
    /// MoRef of the VM with a BIOS UUID
    async fn find_vm(&self, uuid: &str) -> Result<String>;

    /// Power state of a VM
    async fn power_state(&self, vm: &str) -> Result<PowerState>;

    /// Start `PowerOnVM_Task`
    async fn power_on(&self, vm: &str) -> Result<String>;

    /// Start `PowerOffVM_Task`
    async fn power_off(&self, vm: &str) -> Result<String>;

    /// Start `CreateSnapshot_Task`
    async fn create_snapshot(&self, vm: &str) -> Result<String>;

    /// Start `RemoveSnapshot_Task`
    async fn remove_snapshot(&self, snapshot: &str) -> Result<String>;

    /// State of a Task
    async fn task_state(&self, task: &str) -> Result<TaskState>;

    /// Change ID of every disk backing at a snapshot, keyed by file name
    async fn change_ids(&self, snapshot: &str) -> Result<BTreeMap<String, String>>;

    /// End the session
    async fn logout(&self);
}

#[derive(Deserialize)]
struct MoRef {
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskInfo {
    state: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<TaskError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskError {
    #[serde(default)]
    localized_message: String,
}

impl TaskInfo {
    fn into_state(self) -> TaskState {
        match self.state.as_str() {
            "success" => TaskState::Success(
                self.result
                    .as_ref()
                    .and_then(|r| r.get("value"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            "error" => TaskState::Error(
                self.error
                    .map(|e| e.localized_message)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "task failed".to_string()),
            ),
            _ => TaskState::Running,
        }
    }
}

/// Change IDs from a snapshot's `config.hardware.device` list
fn disk_change_ids(hardware: &Value) -> BTreeMap<String, String> {
    hardware
        .get("device")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|device| {
            let backing = device.get("backing")?;
            let file = backing.get("fileName")?.as_str()?;
            let change_id = backing.get("changeId")?.as_str()?;
            Some((file.to_string(), change_id.to_string()))
        })
        .collect()
}

/// [`VsphereApi`] over the VI/JSON endpoints
pub(crate) struct HttpVsphereApi {
    http: reqwest::Client,
    base: String,
    user: String,
    password: String,
    session: Mutex<Option<String>>,
}

impl HttpVsphereApi {
    /// API rooted at the provider's SDK URL
    pub fn new(sdk_url: &str, user: String, password: String, insecure: bool) -> Result<Self> {
        let url = url::Url::parse(sdk_url)
            .map_err(|e| Error::http(sdk_url, format!("invalid vSphere URL: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::http(sdk_url, "vSphere URL has no host"))?;
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| Error::internal_with_context("vsphere", e.to_string()))?;
        Ok(Self {
            http,
            base: format!("https://{}/sdk/vim25/{}", authority, API_RELEASE),
            user,
            password,
            session: Mutex::new(None),
        })
    }

    fn url(&self, kind: &str, moref: &str, method: &str) -> String {
        format!("{}/{}/{}/{}", self.base, kind, moref, method)
    }

    async fn session(&self) -> Result<String> {
        let mut session = self.session.lock().await;
        if let Some(id) = session.as_ref() {
            return Ok(id.clone());
        }
        let url = self.url("SessionManager", "SessionManager", "Login");
        debug!(url = %url, "vSphere login");
        let response = self
            .http
            .post(&url)
            .json(&json!({"userName": self.user, "password": self.password}))
            .send()
            .await
            .map_err(|e| Error::http(&url, e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::http_status(url, status, body));
        }
        let id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::http(&url, "login returned no session"))?;
        *session = Some(id.clone());
        Ok(id)
    }

    async fn call(&self, method: Method, url: String, body: Option<Value>) -> Result<Value> {
        let session = self.session().await?;
        let mut request = self
            .http
            .request(method, &url)
            .header(SESSION_HEADER, session);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::http(&url, e.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            // expired; the next call logs in again
            *self.session.lock().await = None;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::http_status(url, status.as_u16(), body));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response
            .json()
            .await
            .map_err(|e| Error::http(url, format!("invalid JSON: {}", e)))
    }

    async fn task(&self, kind: &str, moref: &str, method: &str, body: Value) -> Result<String> {
        let value = self
            .call(Method::POST, self.url(kind, moref, method), Some(body))
            .await?;
        let task: MoRef = serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind("Task", e.to_string()))?;
        debug!(object = %moref, method, task = %task.value, "vSphere task started");
        Ok(task.value)
    }
}

#[async_trait]
impl VsphereApi for HttpVsphereApi {
    async fn find_vm(&self, uuid: &str) -> Result<String> {
        let value = self
            .call(
                Method::POST,
                self.url("SearchIndex", "SearchIndex", "FindByUuid"),
                Some(json!({"uuid": uuid, "vmSearch": true, "instanceUuid": false})),
            )
            .await?;
        if value.is_null() {
            return Err(Error::provider_for(
                uuid,
                "vsphere",
                "VM not found by UUID",
            ));
        }
        let moref: MoRef = serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind("VirtualMachine", e.to_string()))?;
        Ok(moref.value)
    }

    async fn power_state(&self, vm: &str) -> Result<PowerState> {
        let runtime = self
            .call(Method::GET, self.url("VirtualMachine", vm, "runtime"), None)
            .await?;
        Ok(parse_power_state(
            runtime.get("powerState").and_then(Value::as_str).unwrap_or_default(),
        ))
    }

    async fn power_on(&self, vm: &str) -> Result<String> {
        self.task("VirtualMachine", vm, "PowerOnVM_Task", json!({})).await
    }

    async fn power_off(&self, vm: &str) -> Result<String> {
        self.task("VirtualMachine", vm, "PowerOffVM_Task", json!({})).await
    }

    async fn create_snapshot(&self, vm: &str) -> Result<String> {
        self.task(
            "VirtualMachine",
            vm,
            "CreateSnapshot_Task",
            json!({
                "name": SNAPSHOT_NAME,
                "description": SNAPSHOT_DESCRIPTION,
                "memory": false,
                "quiesce": false,
            }),
        )
        .await
    }

    async fn remove_snapshot(&self, snapshot: &str) -> Result<String> {
        self.task(
            "VirtualMachineSnapshot",
            snapshot,
            "RemoveSnapshot_Task",
            json!({"removeChildren": false, "consolidate": true}),
        )
        .await
    }

    async fn task_state(&self, task: &str) -> Result<TaskState> {
        let value = self
            .call(Method::GET, self.url("Task", task, "info"), None)
            .await?;
        let info: TaskInfo = serde_json::from_value(value)
            .map_err(|e| Error::serialization_for_kind("TaskInfo", e.to_string()))?;
        Ok(info.into_state())
    }

    async fn change_ids(&self, snapshot: &str) -> Result<BTreeMap<String, String>> {
        let config = self
            .call(
                Method::GET,
                self.url("VirtualMachineSnapshot", snapshot, "config"),
                None,
            )
            .await?;
        Ok(config
            .get("hardware")
            .map(disk_change_ids)
            .unwrap_or_default())
    }

    async fn logout(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        let url = self.url("SessionManager", "SessionManager", "Logout");
        if let Err(e) = self
            .http
            .post(&url)
            .header(SESSION_HEADER, session)
            .send()
            .await
        {
            warn!(error = %e, "vSphere logout failed");
        }
    }
}
