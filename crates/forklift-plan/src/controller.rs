//! Migration reconciliation controller
//!
//! Each reconcile resolves the Migration's Plan into a [`PlanContext`],
//! builds the provider adapter and advances every VM's pipeline by one tick:
//! - VMs in a terminal phase are skipped
//! - a transient error on one VM does not stop the others; the first one is
//!   returned so the runtime backs off
//! - once every VM is terminal, the namespace exclusion is released, the
//!   source client is finalized and the Migration gets its final condition
//!
//! Status is written back after every tick, successful or not.
//!
//! The namespace exclusion a plan holds is recorded on the Migration status.
//! A finalizer keeps the Migration around until that record is released, and
//! a Plan that can no longer be resolved fails the Migration and releases it
//! too.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::controller::Action;
use kube::{Client, Config, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use forklift_adapter::{
    create_adapter, ClusterClient, DestinationContext, HttpInventory, Inventory,
    KubeClusterClient, PlanContext, SourceContext, StaticInventory,
};
use forklift_common::crd::{
    set_condition, Condition, ConditionStatus, Migration, MigrationPhase, MigrationStatus,
    NetworkMap, Plan, Provider, ProviderType, ResourceRef, StorageMap, VmPhase, VmStatus,
};
use forklift_common::CONTROLLER_NAME;
use forklift_common::kube_utils::patch_resource_status;
use forklift_common::{Error, Result};

use crate::namespace::NamespaceCoordinator;
use crate::pipeline::{Pipeline, CONDITION_CANCELED, CONDITION_FAILED, CONDITION_SUCCEEDED};
use crate::settings::Settings;

/// Requeue delay after a failed reconcile
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Finalizer holding a Migration until its namespace exclusion is released
pub const MIGRATION_FINALIZER: &str = "forklift.konveyor.io/migration";

/// Secret key holding the bearer token of a remote cluster
const TOKEN_KEY: &str = "token";
/// Secret key holding the CA bundle of a remote cluster
const CA_CERT_KEY: &str = "cacert";
/// Secret key disabling TLS verification
const INSECURE_KEY: &str = "insecureSkipVerify";

/// Reads and writes the objects a Migration refers to
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// A Plan
    async fn get_plan(&self, reference: &ResourceRef) -> Result<Option<Plan>>;
    /// A Provider
    async fn get_provider(&self, reference: &ResourceRef) -> Result<Option<Provider>>;
    /// A NetworkMap
    async fn get_network_map(&self, reference: &ResourceRef) -> Result<Option<NetworkMap>>;
    /// A StorageMap
    async fn get_storage_map(&self, reference: &ResourceRef) -> Result<Option<StorageMap>>;
    /// A Secret
    async fn get_secret(&self, reference: &ResourceRef) -> Result<Option<Secret>>;
    /// Replace the status of a Migration
    async fn patch_migration_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MigrationStatus,
    ) -> Result<()>;
    /// Replace the finalizers of a Migration
    async fn set_migration_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()>;
}

/// [`PlanStore`] backed by the API server
pub struct KubePlanStore {
    client: Client,
}

impl KubePlanStore {
    /// Store reading through `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get<K>(&self, reference: &ResourceRef) -> Result<Option<K>>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &reference.namespace);
        Ok(api.get_opt(&reference.name).await?)
    }
}

#[async_trait]
impl PlanStore for KubePlanStore {
    async fn get_plan(&self, reference: &ResourceRef) -> Result<Option<Plan>> {
        self.get(reference).await
    }

    async fn get_provider(&self, reference: &ResourceRef) -> Result<Option<Provider>> {
        self.get(reference).await
    }

    async fn get_network_map(&self, reference: &ResourceRef) -> Result<Option<NetworkMap>> {
        self.get(reference).await
    }

    async fn get_storage_map(&self, reference: &ResourceRef) -> Result<Option<StorageMap>> {
        self.get(reference).await
    }

    async fn get_secret(&self, reference: &ResourceRef) -> Result<Option<Secret>> {
        self.get(reference).await
    }

    async fn patch_migration_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MigrationStatus,
    ) -> Result<()> {
        patch_resource_status::<Migration>(&self.client, name, namespace, status).await?;
        Ok(())
    }

    async fn set_migration_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let api: Api<Migration> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(CONTROLLER_NAME), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Shared state for the Migration controller
pub struct Context {
    /// Plan, provider and map lookups
    pub store: Arc<dyn PlanStore>,
    /// The cluster the controller runs in
    pub cluster: Arc<dyn ClusterClient>,
    /// Controller settings
    pub settings: Settings,
}

impl Context {
    /// Context for the cluster behind `client`
    pub fn new(client: Client, settings: Settings) -> Self {
        Self {
            store: Arc::new(KubePlanStore::new(client.clone())),
            cluster: Arc::new(KubeClusterClient::new(client)),
            settings,
        }
    }
}

/// Error policy for the Migration controller
pub fn error_policy(migration: Arc<Migration>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        migration = %migration.name_any(),
        retryable = error.is_retryable(),
        error = %error,
        "Migration reconcile failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Reconcile a Migration: advance every VM of its Plan by one tick
#[instrument(skip(migration, ctx), fields(migration = %migration.name_any(), namespace = ?migration.namespace()))]
pub async fn reconcile(migration: Arc<Migration>, ctx: Arc<Context>) -> Result<Action> {
    let name = migration.name_any();
    let namespace = migration
        .namespace()
        .ok_or_else(|| Error::validation("Migration must be namespaced"))?;
    if migration.metadata.deletion_timestamp.is_some() {
        return cleanup(&migration, &namespace, &name, &ctx).await;
    }
    if !has_finalizer(&migration) {
        info!("Adding finalizer");
        let mut finalizers = migration.finalizers().to_vec();
        finalizers.push(MIGRATION_FINALIZER.to_string());
        ctx.store
            .set_migration_finalizers(&namespace, &name, finalizers)
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let mut status = migration.status.clone().unwrap_or_default();
    if status.phase.is_terminal() {
        debug!(phase = %status.phase, "Migration already finished");
        return Ok(Action::await_change());
    }

    let plan = match resolve(&migration, &ctx).await {
        Ok(plan) => Arc::new(plan),
        Err(e) if e.is_fatal() => {
            warn!(error = %e, "plan cannot be resolved, failing the migration");
            release(&ctx, &mut status).await?;
            status.phase = MigrationPhase::Failed;
            status.completed = Some(Utc::now());
            set_condition(
                &mut status.conditions,
                Condition::new(
                    CONDITION_FAILED,
                    ConditionStatus::True,
                    "PlanNotReady",
                    e.to_string(),
                ),
            );
            ctx.store
                .patch_migration_status(&namespace, &name, &status)
                .await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };
    let adapter = create_adapter(&plan.source.provider)?;
    let pipeline = Pipeline::new(plan.clone(), adapter.as_ref())?;

    let result = run(&pipeline, &plan, &mut status).await;
    ctx.store
        .patch_migration_status(&namespace, &name, &status)
        .await?;
    result?;

    if status.phase.is_terminal() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(ctx.settings.requeue_interval))
    }
}

fn has_finalizer(migration: &Migration) -> bool {
    migration.finalizers().iter().any(|f| f == MIGRATION_FINALIZER)
}

/// Release the exclusion recorded on `status`, if any
async fn release(ctx: &Context, status: &mut MigrationStatus) -> Result<()> {
    if let Some(owner) = &status.exclusion {
        NamespaceCoordinator::for_owner(ctx.cluster.clone(), owner)
            .remove_exclusion()
            .await?;
        info!(namespace = %owner.namespace, plan = %owner.plan_uid, "released kubemacpool exclusion");
    }
    status.exclusion = None;
    Ok(())
}

async fn cleanup(
    migration: &Migration,
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<Action> {
    let mut status = migration.status.clone().unwrap_or_default();
    release(ctx, &mut status).await?;
    if has_finalizer(migration) {
        let finalizers = migration
            .finalizers()
            .iter()
            .filter(|f| *f != MIGRATION_FINALIZER)
            .cloned()
            .collect();
        ctx.store
            .set_migration_finalizers(namespace, name, finalizers)
            .await?;
    }
    Ok(Action::await_change())
}

/// Advance every non-terminal VM one tick and close out a finished migration
pub async fn run(pipeline: &Pipeline, plan: &PlanContext, status: &mut MigrationStatus) -> Result<()> {
    if status.started.is_none() {
        status.started = Some(Utc::now());
        status.phase = MigrationPhase::Running;
        info!(vms = plan.plan.spec.vms.len(), "Migration started");
    }
    for vm in &plan.plan.spec.vms {
        if status.find_vm(&vm.vm_ref).is_none() {
            status.vms.push(VmStatus::new(vm.vm_ref.clone()));
        }
    }

    let coordinator = pipeline.coordinator();
    if coordinator.is_applicable() && status.exclusion.is_none() {
        status.exclusion = Some(coordinator.owner());
    }

    let mut first_error = None;
    let mut history = std::mem::take(&mut status.history);
    for vm in status.vms.iter_mut().filter(|vm| !vm.phase.is_terminal()) {
        if let Err(e) = pipeline.tick(vm, &mut history).await {
            first_error.get_or_insert(e);
        }
    }
    status.history = history;

    if let Some(e) = first_error {
        return Err(e);
    }
    if status.all_terminal() {
        complete(pipeline, plan, status).await?;
    }
    Ok(())
}

async fn complete(pipeline: &Pipeline, plan: &PlanContext, status: &mut MigrationStatus) -> Result<()> {
    pipeline.coordinator().remove_exclusion().await?;
    status.exclusion = None;
    pipeline.client().finalize(&status.vms, plan.plan_name()).await;
    pipeline.client().close().await;

    let failed = status.vms.iter().filter(|vm| vm.phase == VmPhase::Failed).count();
    let canceled = status.vms.iter().filter(|vm| vm.phase == VmPhase::Canceled).count();
    let (phase, condition, message) = if failed > 0 {
        (
            MigrationPhase::Failed,
            CONDITION_FAILED,
            format!("{} of {} VMs failed.", failed, status.vms.len()),
        )
    } else if canceled > 0 {
        (
            MigrationPhase::Canceled,
            CONDITION_CANCELED,
            format!("{} of {} VMs canceled.", canceled, status.vms.len()),
        )
    } else {
        (
            MigrationPhase::Succeeded,
            CONDITION_SUCCEEDED,
            "The migration has SUCCEEDED.".to_string(),
        )
    };
    status.phase = phase;
    status.completed = Some(Utc::now());
    set_condition(
        &mut status.conditions,
        Condition::new(condition, ConditionStatus::True, "Completed", message),
    );
    info!(phase = %phase, failed, canceled, "Migration finished");
    Ok(())
}

// =============================================================================
// Plan resolution
// =============================================================================

fn in_namespace(reference: &ResourceRef, namespace: &str) -> ResourceRef {
    ResourceRef::new(reference.namespace_or(namespace), reference.name.clone())
}

fn required<T>(found: Result<Option<T>>, kind: &str, reference: &ResourceRef) -> Result<T> {
    found?.ok_or_else(|| Error::validation(format!("{} {} not found", kind, reference)))
}

async fn provider_secret(
    store: &dyn PlanStore,
    provider: &Provider,
    namespace: &str,
) -> Result<Option<Secret>> {
    match &provider.spec.secret {
        Some(reference) => {
            let reference = in_namespace(reference, namespace);
            Ok(Some(required(store.get_secret(&reference).await, "secret", &reference)?))
        }
        None => Ok(None),
    }
}

fn credential(secret: Option<&Secret>, key: &str) -> Option<Vec<u8>> {
    let secret = secret?;
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|v| v.clone().into_bytes())
        })
}

/// Kubeconfig for a remote cluster provider
///
/// The token comes from the `token` key, the CA bundle from `cacert`, and
/// `insecureSkipVerify=true` disables TLS verification.
pub fn remote_kubeconfig(provider: &Provider, secret: Option<&Secret>) -> Result<Kubeconfig> {
    let token = credential(secret, TOKEN_KEY)
        .map(|t| String::from_utf8_lossy(&t).trim().to_string())
        .ok_or_else(|| {
            Error::validation(format!("provider {} secret has no token", provider.name_any()))
        })?;
    let insecure = credential(secret, INSECURE_KEY)
        .is_some_and(|v| String::from_utf8_lossy(&v).eq_ignore_ascii_case("true"));

    let mut cluster = json!({ "server": provider.spec.url });
    if insecure {
        cluster["insecure-skip-tls-verify"] = json!(true);
    } else if let Some(ca) = credential(secret, CA_CERT_KEY) {
        cluster["certificate-authority-data"] = json!(STANDARD.encode(ca));
    }
    let kubeconfig = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": "remote", "cluster": cluster }],
        "users": [{ "name": "remote", "user": { "token": token } }],
        "contexts": [{ "name": "remote", "context": { "cluster": "remote", "user": "remote" } }],
        "current-context": "remote",
    });
    serde_json::from_value(kubeconfig)
        .map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))
}

async fn remote_cluster(provider: &Provider, secret: Option<&Secret>) -> Result<Arc<dyn ClusterClient>> {
    let kubeconfig = remote_kubeconfig(provider, secret)?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::internal_with_context("remote cluster", e.to_string()))?;
    let client = Client::try_from(config)?;
    Ok(Arc::new(KubeClusterClient::new(client)))
}

fn inventory(settings: &Settings, provider: &Provider) -> Result<Arc<dyn Inventory>> {
    if settings.inventory_url.is_empty() {
        return Ok(Arc::new(StaticInventory::default()));
    }
    Ok(Arc::new(HttpInventory::new(
        &settings.inventory_url,
        provider,
        settings.inventory_token.as_deref(),
    )?))
}

/// Resolve everything the Migration's Plan refers to
pub async fn resolve(migration: &Migration, ctx: &Context) -> Result<PlanContext> {
    let store = ctx.store.as_ref();
    let namespace = migration.namespace().unwrap_or_default();

    let plan_ref = in_namespace(&migration.spec.plan, &namespace);
    let plan = required(store.get_plan(&plan_ref).await, "plan", &plan_ref)?;
    let plan_ns = plan.namespace().unwrap_or_else(|| namespace.clone());
    let spec = &plan.spec;

    let source_ref = in_namespace(&spec.provider.source, &plan_ns);
    let source = required(store.get_provider(&source_ref).await, "provider", &source_ref)?;
    let destination_ref = in_namespace(&spec.provider.destination, &plan_ns);
    let destination =
        required(store.get_provider(&destination_ref).await, "provider", &destination_ref)?;
    let network_ref = in_namespace(&spec.map.network, &plan_ns);
    let network_map =
        required(store.get_network_map(&network_ref).await, "network map", &network_ref)?;
    let storage_ref = in_namespace(&spec.map.storage, &plan_ns);
    let storage_map =
        required(store.get_storage_map(&storage_ref).await, "storage map", &storage_ref)?;

    let source_ns = source.namespace().unwrap_or_else(|| plan_ns.clone());
    let source_secret = provider_secret(store, &source, &source_ns).await?;
    let source_cluster = if source.provider_type() == ProviderType::Openshift && !source.is_host() {
        Some(remote_cluster(&source, source_secret.as_ref()).await?)
    } else {
        None
    };
    let destination_cluster = if destination.is_host() {
        ctx.cluster.clone()
    } else {
        let destination_ns = destination.namespace().unwrap_or_else(|| plan_ns.clone());
        let secret = provider_secret(store, &destination, &destination_ns).await?;
        remote_cluster(&destination, secret.as_ref()).await?
    };

    debug!(
        plan = %plan_ref,
        source = %source_ref,
        source_type = %source.provider_type(),
        "resolved plan"
    );
    Ok(PlanContext {
        source: SourceContext {
            inventory: inventory(&ctx.settings, &source)?,
            provider: source,
            secret: source_secret,
            cluster: source_cluster,
        },
        destination: DestinationContext {
            provider: destination,
            cluster: destination_cluster,
        },
        plan,
        migration: migration.clone(),
        network_map,
        storage_map,
        settings: ctx.settings.adapter.clone(),
    })
}
