//! Source inventory access
//!
//! The inventory service mirrors every source provider into a queryable model
//! at `/providers/{type}/{uid}/{collection}/{id}`. Adapters read it as raw
//! JSON and deserialize into their own provider models.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::{Provider, Ref};
use forklift_common::{Error, Result};

/// Collection of virtual machines
pub const VMS: &str = "vms";
/// Collection of networks
pub const NETWORKS: &str = "networks";
/// Collection of hosts
pub const HOSTS: &str = "hosts";
/// Collection of disks
pub const DISKS: &str = "disks";
/// Collection of volumes
pub const VOLUMES: &str = "volumes";
/// Collection of images
pub const IMAGES: &str = "images";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read access to a provider's inventory
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Get an object by ID
    async fn get(&self, collection: &str, id: &str) -> Result<Value>;

    /// List a collection
    async fn list(&self, collection: &str) -> Result<Vec<Value>>;
}

/// Find an object by reference: by ID when set, else by name
pub async fn find(inventory: &dyn Inventory, collection: &str, reference: &Ref) -> Result<Value> {
    if !reference.id.is_empty() {
        return inventory.get(collection, &reference.id).await;
    }
    inventory
        .list(collection)
        .await?
        .into_iter()
        .find(|obj| field(obj, &["name", "Name"]) == Some(reference.name.as_str()))
        .ok_or_else(|| {
            Error::validation_for(
                reference.to_string(),
                format!("not found in inventory collection '{}'", collection),
            )
        })
}

/// Find an object by reference and deserialize it
pub async fn find_as<T: DeserializeOwned>(
    inventory: &dyn Inventory,
    collection: &str,
    reference: &Ref,
) -> Result<T> {
    let value = find(inventory, collection, reference).await?;
    decode(collection, value)
}

/// Get an object by ID and deserialize it
pub async fn get_as<T: DeserializeOwned>(
    inventory: &dyn Inventory,
    collection: &str,
    id: &str,
) -> Result<T> {
    let value = inventory.get(collection, id).await?;
    decode(collection, value)
}

fn decode<T: DeserializeOwned>(collection: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(collection.to_string(), e.to_string()))
}

fn field<'a>(obj: &'a Value, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|n| obj.get(*n).and_then(Value::as_str))
}

/// Inventory served by the Forklift inventory service over HTTP
pub struct HttpInventory {
    http: reqwest::Client,
    base: String,
}

impl HttpInventory {
    /// Inventory for `provider`, rooted at the service's base URL
    pub fn new(inventory_url: &str, provider: &Provider, token: Option<&str>) -> Result<Self> {
        let uid = provider
            .metadata
            .uid
            .as_deref()
            .ok_or_else(|| Error::validation("provider has no UID"))?;
        let base = format!(
            "{}/providers/{}/{}",
            inventory_url.trim_end_matches('/'),
            provider.provider_type(),
            uid
        );

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = token {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::internal_with_context("inventory", e.to_string()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::internal_with_context("inventory", e.to_string()))?;
        Ok(Self { http, base })
    }

    fn object_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}?detail=4", self.base, collection, id)
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}?detail=1", self.base, collection)
    }

    async fn fetch(&self, url: &str) -> Result<Value> {
        debug!(url = %url, "inventory request");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::http(url, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
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
impl Inventory for HttpInventory {
    async fn get(&self, collection: &str, id: &str) -> Result<Value> {
        self.fetch(&self.object_url(collection, id)).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<Value>> {
        match self.fetch(&self.collection_url(collection)).await? {
            Value::Array(items) => Ok(items),
            other => Err(Error::serialization_for_kind(
                collection.to_string(),
                format!("expected a list, got {}", other),
            )),
        }
    }
}

/// Inventory over a fixed in-memory snapshot
///
/// Objects are matched by their `id` (or `ID`) field. Used for providers
/// whose inventory is handed over whole, and for tests.
#[derive(Clone, Debug, Default)]
pub struct StaticInventory {
    collections: BTreeMap<String, Vec<Value>>,
}

impl StaticInventory {
    /// Add an object to a collection
    pub fn with(mut self, collection: &str, object: Value) -> Self {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(object);
        self
    }
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn get(&self, collection: &str, id: &str) -> Result<Value> {
        self.collections
            .get(collection)
            .and_then(|objs| objs.iter().find(|o| field(o, &["id", "ID"]) == Some(id)))
            .cloned()
            .ok_or_else(|| {
                Error::http_status(format!("{}/{}", collection, id), 404, "not found")
            })
    }

    async fn list(&self, collection: &str) -> Result<Vec<Value>> {
        Ok(self.collections.get(collection).cloned().unwrap_or_default())
    }
}
