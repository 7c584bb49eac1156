//! kubemacpool exclusion for same-cluster migrations
//!
//! When an OpenShift VM migrates to the cluster it already runs on, the
//! kubemacpool webhook sees the source and destination VMs share MACs and
//! rejects the destination. While a plan runs, the target namespace is
//! labelled so the webhook skips it.
//!
//! Several plans may target one namespace, and the label may already be
//! there for unrelated reasons. The namespace therefore carries:
//! - the owners annotation: comma-joined UIDs of plans holding the exclusion
//! - the managed annotation: `"true"` when this controller applied the label
//!
//! A label with any value other than `ignore` counts as absent and is
//! overwritten. The label is removed only when the last owner releases and
//! the managed marker is set. Every patch carries the namespace's `resourceVersion`, so
//! a concurrent writer makes the patch fail with a conflict and the
//! reconcile retries against fresh state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use forklift_adapter::{ClusterClient, PlanContext};
use forklift_common::crd::{ExclusionOwner, Provider, ProviderType};
use forklift_common::labels::{
    ANNOTATION_KUBEMACPOOL_MANAGED, ANNOTATION_KUBEMACPOOL_OWNERS, KUBEMACPOOL_IGNORE_VALUE,
    LABEL_KUBEMACPOOL_IGNORE,
};
use forklift_common::{Error, Result};

/// Normalize a provider URL for same-cluster comparison
///
/// Lowercases scheme and host, drops the scheme's default port and the
/// trailing path slash. Unparsable input is lowercased and stripped of
/// trailing slashes.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let parsed = match Url::parse(trimmed) {
        Ok(url) if url.has_host() => url,
        _ => return trimmed.to_lowercase().trim_end_matches('/').to_string(),
    };
    let mut out = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().unwrap_or_default().to_lowercase()
    );
    // `port()` is None when it equals the scheme default
    if let Some(port) = parsed.port() {
        out.push_str(&format!(":{}", port));
    }
    out.push_str(parsed.path().trim_end_matches('/'));
    out
}

/// Whether two OpenShift providers refer to the same cluster
pub fn same_cluster(source: &Provider, destination: &Provider) -> bool {
    let (a, b) = (&source.spec.url, &destination.spec.url);
    if a.is_empty() && b.is_empty() {
        return true;
    }
    if a.is_empty() || b.is_empty() {
        return false;
    }
    normalize_url(a) == normalize_url(b)
}

/// Whether the exclusion applies to a plan
pub fn applies(ctx: &PlanContext) -> bool {
    let source = &ctx.source.provider;
    let destination = &ctx.destination.provider;
    source.provider_type() == ProviderType::Openshift
        && destination.provider_type() == ProviderType::Openshift
        && same_cluster(source, destination)
        && !ctx.target_namespace().is_empty()
}

fn parse_owners(annotations: Option<&BTreeMap<String, String>>) -> BTreeSet<String> {
    annotations
        .and_then(|a| a.get(ANNOTATION_KUBEMACPOOL_OWNERS))
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn join_owners(owners: &BTreeSet<String>) -> Value {
    if owners.is_empty() {
        Value::Null
    } else {
        Value::String(owners.iter().cloned().collect::<Vec<_>>().join(","))
    }
}

/// Reference-counted kubemacpool exclusion on a plan's target namespace
pub struct NamespaceCoordinator {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    plan_uid: String,
    applicable: bool,
}

impl NamespaceCoordinator {
    /// Coordinator for the plan in `ctx`
    pub fn new(ctx: &PlanContext) -> Self {
        Self {
            cluster: ctx.destination.cluster.clone(),
            namespace: ctx.target_namespace().to_string(),
            plan_uid: ctx.plan_uid().to_string(),
            applicable: applies(ctx),
        }
    }

    /// Coordinator for an exclusion recorded earlier, when the plan itself
    /// can no longer be resolved
    pub fn for_owner(cluster: Arc<dyn ClusterClient>, owner: &ExclusionOwner) -> Self {
        Self {
            cluster,
            namespace: owner.namespace.clone(),
            plan_uid: owner.plan_uid.clone(),
            applicable: true,
        }
    }

    /// Whether the plan needs the exclusion at all
    pub fn is_applicable(&self) -> bool {
        self.applicable
    }

    /// The owners entry this coordinator maintains
    pub fn owner(&self) -> ExclusionOwner {
        ExclusionOwner {
            namespace: self.namespace.clone(),
            plan_uid: self.plan_uid.clone(),
        }
    }

    /// Add this plan to the owners, labelling the namespace if needed
    ///
    /// Returns `false` when the exclusion does not apply.
    pub async fn ensure_exclusion(&self) -> Result<bool> {
        if !self.applicable {
            return Ok(false);
        }
        let ns = self
            .cluster
            .get_namespace(&self.namespace)
            .await?
            .ok_or_else(|| {
                Error::internal_with_context(
                    "kubemacpool",
                    format!("target namespace {} not found", self.namespace),
                )
            })?;
        let meta = &ns.metadata;

        let mut owners = parse_owners(meta.annotations.as_ref());
        let mut labels = Map::new();
        let mut annotations = Map::new();
        if owners.insert(self.plan_uid.clone()) {
            annotations.insert(ANNOTATION_KUBEMACPOOL_OWNERS.to_string(), join_owners(&owners));
        }
        let labelled = meta
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_KUBEMACPOOL_IGNORE))
            .is_some_and(|v| v == KUBEMACPOOL_IGNORE_VALUE);
        if !labelled {
            labels.insert(
                LABEL_KUBEMACPOOL_IGNORE.to_string(),
                json!(KUBEMACPOOL_IGNORE_VALUE),
            );
            annotations.insert(ANNOTATION_KUBEMACPOOL_MANAGED.to_string(), json!("true"));
        }

        self.patch(meta.resource_version.as_deref(), labels, annotations)
            .await?;
        Ok(true)
    }

    /// Remove this plan from the owners; drop the label when we applied it
    /// and no owner remains
    ///
    /// Returns `false` when the exclusion does not apply.
    pub async fn remove_exclusion(&self) -> Result<bool> {
        if !self.applicable {
            return Ok(false);
        }
        let Some(ns) = self.cluster.get_namespace(&self.namespace).await? else {
            return Ok(true);
        };
        let meta = &ns.metadata;

        let mut owners = parse_owners(meta.annotations.as_ref());
        let mut labels = Map::new();
        let mut annotations = Map::new();
        if owners.remove(&self.plan_uid) {
            annotations.insert(ANNOTATION_KUBEMACPOOL_OWNERS.to_string(), join_owners(&owners));
        }
        let managed = meta
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_KUBEMACPOOL_MANAGED))
            .is_some_and(|v| v == "true");
        if owners.is_empty() && managed {
            labels.insert(LABEL_KUBEMACPOOL_IGNORE.to_string(), Value::Null);
            annotations.insert(ANNOTATION_KUBEMACPOOL_MANAGED.to_string(), Value::Null);
        }

        self.patch(meta.resource_version.as_deref(), labels, annotations)
            .await?;
        Ok(true)
    }

    async fn patch(
        &self,
        resource_version: Option<&str>,
        labels: Map<String, Value>,
        annotations: Map<String, Value>,
    ) -> Result<()> {
        if labels.is_empty() && annotations.is_empty() {
            return Ok(());
        }
        let mut metadata = Map::new();
        if let Some(rv) = resource_version {
            metadata.insert("resourceVersion".to_string(), json!(rv));
        }
        if !labels.is_empty() {
            metadata.insert("labels".to_string(), Value::Object(labels));
        }
        if !annotations.is_empty() {
            metadata.insert("annotations".to_string(), Value::Object(annotations));
        }
        let patch = json!({ "metadata": metadata });
        debug!(namespace = %self.namespace, plan = %self.plan_uid, patch = %patch, "patching kubemacpool exclusion");
        self.cluster.patch_namespace(&self.namespace, patch).await
    }
}
