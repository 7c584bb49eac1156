//! Cluster access for adapters and the pipeline
//!
//! [`ClusterClient`] is the single seam through which the controller reads
//! and writes a Kubernetes cluster: the destination for every migration, and
//! the source for KubeVirt-to-KubeVirt migrations. Gets return `None` on
//! NotFound; creates surface AlreadyExists as an error so callers can apply
//! their own policy.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolume, PersistentVolumeClaim, Secret,
};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams, PostParams,
};
use kube::Client;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::{
    DataVolume, OpenstackVolumePopulator, OvirtVolumePopulator, PopulatorStatus, VirtualMachine,
    POPULATOR_API_GROUP,
};
use forklift_common::error::is_not_found;
use forklift_common::kube_utils::FIELD_MANAGER;
use forklift_common::{Error, Result};

/// Populator CR kinds the controller creates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopulatorKind {
    /// `OvirtVolumePopulator`
    Ovirt,
    /// `OpenstackVolumePopulator`
    Openstack,
}

impl PopulatorKind {
    /// Kubernetes kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ovirt => "OvirtVolumePopulator",
            Self::Openstack => "OpenstackVolumePopulator",
        }
    }

    /// Plural resource name
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Ovirt => "ovirtvolumepopulators",
            Self::Openstack => "openstackvolumepopulators",
        }
    }

    fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(POPULATOR_API_GROUP, "v1beta1", self.kind()),
            self.plural(),
        )
    }
}

/// A populator CR to create
#[derive(Clone, Debug)]
pub enum PopulatorCr {
    /// oVirt imageio populator
    Ovirt(OvirtVolumePopulator),
    /// OpenStack Glance populator
    Openstack(OpenstackVolumePopulator),
}

impl PopulatorCr {
    /// Name of the CR
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Ovirt(p) => p.metadata.name.as_deref(),
            Self::Openstack(p) => p.metadata.name.as_deref(),
        }
    }
}

/// A populator CR as listed from the cluster
#[derive(Clone, Debug, Default)]
pub struct PopulatorObject {
    /// Name
    pub name: String,
    /// UID
    pub uid: Option<String>,
    /// Status, if reported
    pub status: PopulatorStatus,
}

/// Read/write access to a Kubernetes cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List KubeVirt VMs in a namespace, optionally filtered by label selector
    async fn list_virtual_machines(
        &self,
        namespace: &str,
        selector: Option<String>,
    ) -> Result<Vec<VirtualMachine>>;

    /// Get a KubeVirt VM
    async fn get_virtual_machine(&self, namespace: &str, name: &str)
        -> Result<Option<VirtualMachine>>;

    /// Create a KubeVirt VM
    async fn create_virtual_machine(&self, vm: &VirtualMachine) -> Result<VirtualMachine>;

    /// Merge-patch a KubeVirt VM
    async fn patch_virtual_machine(&self, namespace: &str, name: &str, patch: Value)
        -> Result<()>;

    /// List DataVolumes matching a label selector
    async fn list_data_volumes(&self, namespace: &str, selector: String)
        -> Result<Vec<DataVolume>>;

    /// Create a DataVolume
    async fn create_data_volume(&self, dv: &DataVolume) -> Result<DataVolume>;

    /// Merge-patch a DataVolume
    async fn patch_data_volume(&self, namespace: &str, name: &str, patch: Value) -> Result<()>;

    /// Delete a DataVolume; NotFound is success
    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()>;

    /// List PVCs matching a label selector
    async fn list_persistent_volume_claims(
        &self,
        namespace: &str,
        selector: String,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    /// Get a PVC
    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>>;

    /// Create a PVC
    async fn create_persistent_volume_claim(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    /// List PVs matching a label selector
    async fn list_persistent_volumes(&self, selector: String) -> Result<Vec<PersistentVolume>>;

    /// Create a PV
    async fn create_persistent_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume>;

    /// Get a ConfigMap
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;

    /// Create a ConfigMap
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Create a Secret
    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;

    /// Get a Job
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    /// Create a Job
    async fn create_job(&self, job: &Job) -> Result<Job>;

    /// Get a Namespace
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;

    /// Merge-patch a Namespace
    async fn patch_namespace(&self, name: &str, patch: Value) -> Result<()>;

    /// Create a populator CR
    async fn create_populator(&self, populator: &PopulatorCr) -> Result<()>;

    /// List populator CRs matching a label selector
    async fn list_populators(
        &self,
        kind: PopulatorKind,
        namespace: &str,
        selector: String,
    ) -> Result<Vec<PopulatorObject>>;

    /// Merge-patch a populator CR
    async fn patch_populator(
        &self,
        kind: PopulatorKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<()>;

    /// Delete a populator CR; NotFound is success
    async fn delete_populator(&self, kind: PopulatorKind, namespace: &str, name: &str)
        -> Result<()>;

    /// Create a `VirtualMachineExport` for a VM
    async fn create_vm_export(&self, namespace: &str, name: &str, vm_name: &str) -> Result<()>;

    /// Get a `VirtualMachineExport` as raw JSON
    async fn get_vm_export(&self, namespace: &str, name: &str) -> Result<Option<Value>>;

    /// Delete a `VirtualMachineExport`; NotFound is success
    async fn delete_vm_export(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`ClusterClient`] backed by a kube client
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn export_resource() -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("export.kubevirt.io", "v1beta1", "VirtualMachineExport"),
            "virtualmachineexports",
        )
    }

    fn populators(&self, kind: PopulatorKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

fn list_params(selector: Option<&str>) -> ListParams {
    match selector {
        Some(s) if !s.is_empty() => ListParams::default().labels(s),
        _ => ListParams::default(),
    }
}

fn patch_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER)
}

/// Map NotFound to `None`
fn optional<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Map NotFound to success for deletes
fn deleted<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn namespace_of(meta: &kube::api::ObjectMeta) -> Result<&str> {
    meta.namespace
        .as_deref()
        .ok_or_else(|| Error::internal_with_context("cluster", "object has no namespace"))
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_virtual_machines(
        &self,
        namespace: &str,
        selector: Option<String>,
    ) -> Result<Vec<VirtualMachine>> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&list_params(selector.as_deref())).await?.items)
    }

    async fn get_virtual_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn create_virtual_machine(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        let api: Api<VirtualMachine> =
            Api::namespaced(self.client.clone(), namespace_of(&vm.metadata)?);
        Ok(api.create(&PostParams::default(), vm).await?)
    }

    async fn patch_virtual_machine(&self, namespace: &str, name: &str, patch: Value) -> Result<()> {
        let api: Api<VirtualMachine> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_data_volumes(&self, namespace: &str, selector: String) -> Result<Vec<DataVolume>> {
        let api: Api<DataVolume> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&list_params(Some(&selector))).await?.items)
    }

    async fn create_data_volume(&self, dv: &DataVolume) -> Result<DataVolume> {
        let api: Api<DataVolume> = Api::namespaced(self.client.clone(), namespace_of(&dv.metadata)?);
        Ok(api.create(&PostParams::default(), dv).await?)
    }

    async fn patch_data_volume(&self, namespace: &str, name: &str, patch: Value) -> Result<()> {
        let api: Api<DataVolume> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DataVolume> = Api::namespaced(self.client.clone(), namespace);
        debug!(namespace = %namespace, name = %name, "deleting DataVolume");
        deleted(api.delete(name, &DeleteParams::background()).await)
    }

    async fn list_persistent_volume_claims(
        &self,
        namespace: &str,
        selector: String,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&list_params(Some(&selector))).await?.items)
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn create_persistent_volume_claim(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), namespace_of(&pvc.metadata)?);
        Ok(api.create(&PostParams::default(), pvc).await?)
    }

    async fn list_persistent_volumes(&self, selector: String) -> Result<Vec<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.list(&list_params(Some(&selector))).await?.items)
    }

    async fn create_persistent_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), pv).await?)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), namespace_of(&config_map.metadata)?);
        Ok(api.create(&PostParams::default(), config_map).await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace_of(&secret.metadata)?);
        Ok(api.create(&PostParams::default(), secret).await?)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace_of(&job.metadata)?);
        Ok(api.create(&PostParams::default(), job).await?)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        optional(api.get(name).await)
    }

    async fn patch_namespace(&self, name: &str, patch: Value) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.patch(name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn create_populator(&self, populator: &PopulatorCr) -> Result<()> {
        match populator {
            PopulatorCr::Ovirt(p) => {
                let api: Api<OvirtVolumePopulator> =
                    Api::namespaced(self.client.clone(), namespace_of(&p.metadata)?);
                api.create(&PostParams::default(), p).await?;
            }
            PopulatorCr::Openstack(p) => {
                let api: Api<OpenstackVolumePopulator> =
                    Api::namespaced(self.client.clone(), namespace_of(&p.metadata)?);
                api.create(&PostParams::default(), p).await?;
            }
        }
        Ok(())
    }

    async fn list_populators(
        &self,
        kind: PopulatorKind,
        namespace: &str,
        selector: String,
    ) -> Result<Vec<PopulatorObject>> {
        let list = self
            .populators(kind, namespace)
            .list(&list_params(Some(&selector)))
            .await?;
        list.items
            .into_iter()
            .map(|obj| {
                let status = match obj.data.get("status") {
                    Some(s) => serde_json::from_value(s.clone()).map_err(|e| {
                        Error::serialization_for_kind(kind.kind(), e.to_string())
                    })?,
                    None => PopulatorStatus::default(),
                };
                Ok(PopulatorObject {
                    name: obj.metadata.name.unwrap_or_default(),
                    uid: obj.metadata.uid,
                    status,
                })
            })
            .collect()
    }

    async fn patch_populator(
        &self,
        kind: PopulatorKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<()> {
        self.populators(kind, namespace)
            .patch(name, &patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_populator(&self, kind: PopulatorKind, namespace: &str, name: &str) -> Result<()> {
        deleted(
            self.populators(kind, namespace)
                .delete(name, &DeleteParams::background())
                .await,
        )
    }

    async fn create_vm_export(&self, namespace: &str, name: &str, vm_name: &str) -> Result<()> {
        let ar = Self::export_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let mut export = DynamicObject::new(name, &ar).within(namespace);
        export.data = serde_json::json!({
            "spec": {
                "source": {
                    "apiGroup": "kubevirt.io",
                    "kind": "VirtualMachine",
                    "name": vm_name,
                }
            }
        });
        api.create(&PostParams::default(), &export).await?;
        Ok(())
    }

    async fn get_vm_export(&self, namespace: &str, name: &str) -> Result<Option<Value>> {
        let ar = Self::export_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        Ok(optional(api.get(name).await)?.map(|obj| obj.data))
    }

    async fn delete_vm_export(&self, namespace: &str, name: &str) -> Result<()> {
        let ar = Self::export_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        deleted(api.delete(name, &DeleteParams::background()).await)
    }
}
