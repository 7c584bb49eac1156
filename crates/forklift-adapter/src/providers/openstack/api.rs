//! OpenStack Keystone, Nova, Cinder and Glance calls
//!
//! A Keystone v3 token and the service catalog are fetched lazily on first
//! use and dropped when a service answers 401.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::PowerState;
use forklift_common::{Error, Result};

use crate::providers::parse_power_state;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// A Glance image as the image service reports it
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub(crate) struct GlanceImage {
    pub id: String,
    #[serde(default)]
    pub status: String,
}

/// Calls the controller makes against an OpenStack cloud
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait OpenstackApi: Send + Sync {
    /// Power state of a server
    async fn server_status(&self, server: &str) -> Result<PowerState>;

    /// `os-start` a server
    async fn start(&self, server: &str) -> Result<()>;

    /// `os-stop` a server
    async fn stop(&self, server: &str) -> Result<()>;

    /// Snapshot an image-booted server's root disk into a Glance image
    async fn create_server_image(&self, server: &str, name: &str) -> Result<()>;

    /// Upload a Cinder volume into a Glance image
    async fn upload_volume_image(&self, volume: &str, name: &str) -> Result<()>;

    /// Glance image with an exact name
    async fn find_image(&self, name: &str) -> Result<Option<GlanceImage>>;

    /// Delete a Glance image; a missing image is not an error
    async fn delete_image(&self, id: &str) -> Result<()>;
}

/// How the controller authenticates to Keystone
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Credentials {
    Password {
        user: String,
        password: String,
        domain: String,
        project: String,
        project_domain: String,
    },
    ApplicationCredential {
        id: String,
        secret: String,
    },
    Token {
        token: String,
        project: String,
        project_domain: String,
    },
}

impl Credentials {
    /// Body of `POST /v3/auth/tokens`
    fn auth_body(&self) -> Value {
        let scope = |project: &str, domain: &str| {
            json!({"project": {"name": project, "domain": {"name": domain}}})
        };
        match self {
            Self::Password {
                user,
                password,
                domain,
                project,
                project_domain,
            } => json!({"auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {"user": {
                        "name": user,
                        "password": password,
                        "domain": {"name": domain},
                    }},
                },
                "scope": scope(project, project_domain),
            }}),
            Self::ApplicationCredential { id, secret } => json!({"auth": {
                "identity": {
                    "methods": ["application_credential"],
                    "application_credential": {"id": id, "secret": secret},
                },
            }}),
            Self::Token {
                token,
                project,
                project_domain,
            } => json!({"auth": {
                "identity": {"methods": ["token"], "token": {"id": token}},
                "scope": scope(project, project_domain),
            }}),
        }
    }
}

#[derive(Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: String,
    url: String,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    type_: String,
    endpoints: Vec<CatalogEndpoint>,
}

/// Public endpoint of a service type, optionally in one region
fn endpoint(catalog: &Value, service: &str, region: Option<&str>) -> Option<String> {
    let entries: Vec<CatalogEntry> =
        serde_json::from_value(catalog.get("token")?.get("catalog")?.clone()).ok()?;
    entries
        .into_iter()
        .find(|e| e.type_ == service)?
        .endpoints
        .into_iter()
        .filter(|e| e.interface == "public")
        .find(|e| region.map_or(true, |r| e.region == r))
        .map(|e| e.url.trim_end_matches('/').to_string())
}

#[derive(Clone)]
struct Session {
    token: String,
    compute: String,
    image: String,
    volume: String,
}

#[derive(Clone, Copy)]
enum Service {
    Compute,
    Image,
    Volume,
}

/// [`OpenstackApi`] over the services' REST endpoints
pub(crate) struct HttpOpenstackApi {
    http: reqwest::Client,
    identity_url: String,
    credentials: Credentials,
    region: Option<String>,
    session: Mutex<Option<Session>>,
}

impl HttpOpenstackApi {
    /// Client for the cloud behind a Keystone URL
    pub fn new(
        identity_url: &str,
        credentials: Credentials,
        region: Option<String>,
        insecure: bool,
    ) -> Result<Self> {
        url::Url::parse(identity_url)
            .map_err(|e| Error::http(identity_url, format!("invalid identity URL: {}", e)))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| Error::internal_with_context("openstack", e.to_string()))?;
        Ok(Self {
            http,
            identity_url: identity_url.trim_end_matches('/').to_string(),
            credentials,
            region,
            session: Mutex::new(None),
        })
    }

    fn tokens_url(&self) -> String {
        if self.identity_url.ends_with("/v3") {
            format!("{}/auth/tokens", self.identity_url)
        } else {
            format!("{}/v3/auth/tokens", self.identity_url)
        }
    }

    async fn session(&self) -> Result<Session> {
        let mut session = self.session.lock().await;
        if let Some(s) = session.as_ref() {
            return Ok(s.clone());
        }
        let url = self.tokens_url();
        debug!(url = %url, "Keystone authentication");
        let response = self
            .http
            .post(&url)
            .json(&self.credentials.auth_body())
            .send()
            .await
            .map_err(|e| Error::http(&url, e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::http_status(url, status, body));
        }
        let token = response
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::http(&url, "authentication returned no token"))?;
        let catalog: Value = response
            .json()
            .await
            .map_err(|e| Error::http(&url, e.to_string()))?;
        let region = self.region.as_deref();
        let lookup = |service: &str| {
            endpoint(&catalog, service, region).ok_or_else(|| {
                Error::http(&url, format!("no public '{}' endpoint in catalog", service))
            })
        };
        let s = Session {
            token,
            compute: lookup("compute")?,
            image: lookup("image")?,
            volume: lookup("volumev3")?,
        };
        *session = Some(s.clone());
        Ok(s)
    }

    /// Send a request to a service; `None` on 404
    async fn call(
        &self,
        service: Service,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Option<Value>> {
        let session = self.session().await?;
        let base = match service {
            Service::Compute => &session.compute,
            Service::Image => &session.image,
            Service::Volume => &session.volume,
        };
        let url = format!("{}{}", base, path);
        debug!(method = %method, url = %url, "OpenStack request");
        let mut request = self
            .http
            .request(method, &url)
            .header(TOKEN_HEADER, &session.token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::http(&url, e.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            *self.session.lock().await = None;
        }
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

    async fn server_action(&self, server: &str, action: Value) -> Result<()> {
        let path = format!("/servers/{}/action", server);
        self.call(Service::Compute, Method::POST, &path, Some(action))
            .await?
            .ok_or_else(|| Error::http_status(path, 404, "server not found"))?;
        Ok(())
    }
}

#[async_trait]
impl OpenstackApi for HttpOpenstackApi {
    async fn server_status(&self, server: &str) -> Result<PowerState> {
        let path = format!("/servers/{}", server);
        let body = self
            .call(Service::Compute, Method::GET, &path, None)
            .await?
            .ok_or_else(|| Error::http_status(path, 404, "server not found"))?;
        Ok(parse_power_state(
            body.pointer("/server/status")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        ))
    }

    async fn start(&self, server: &str) -> Result<()> {
        self.server_action(server, json!({"os-start": null})).await
    }

    async fn stop(&self, server: &str) -> Result<()> {
        self.server_action(server, json!({"os-stop": null})).await
    }

    async fn create_server_image(&self, server: &str, name: &str) -> Result<()> {
        self.server_action(server, json!({"createImage": {"name": name}}))
            .await
    }

    async fn upload_volume_image(&self, volume: &str, name: &str) -> Result<()> {
        let path = format!("/volumes/{}/action", volume);
        let body = json!({"os-volume_upload_image": {
            "image_name": name,
            "force": true,
            "disk_format": "raw",
            "container_format": "bare",
        }});
        self.call(Service::Volume, Method::POST, &path, Some(body))
            .await?
            .ok_or_else(|| Error::http_status(path, 404, "volume not found"))?;
        Ok(())
    }

    async fn find_image(&self, name: &str) -> Result<Option<GlanceImage>> {
        let path = {
            let mut query = url::form_urlencoded::Serializer::new(String::new());
            query.append_pair("name", name);
            format!("/v2/images?{}", query.finish())
        };
        let Some(body) = self.call(Service::Image, Method::GET, &path, None).await? else {
            return Ok(None);
        };
        let images: Vec<GlanceImage> = body
            .get("images")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::serialization_for_kind("Image", e.to_string()))?
            .unwrap_or_default();
        Ok(images.into_iter().next())
    }

    async fn delete_image(&self, id: &str) -> Result<()> {
        let path = format!("/v2/images/{}", id);
        self.call(Service::Image, Method::DELETE, &path, None).await?;
        Ok(())
    }
}
