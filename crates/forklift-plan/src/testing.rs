//! Fixtures shared by the plan tests
//!
//! [`FakeCluster`] is an in-memory destination that honours label selectors,
//! `generateName`, AlreadyExists and resourceVersion conflicts. The stub
//! collaborators record what the pipeline asked of them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, EnvVar, Namespace, PersistentVolume, PersistentVolumeClaim, Secret,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::error::ErrorResponse;
use serde_json::Value;

use forklift_adapter::builder::VolumeInputs;
use forklift_adapter::client::SnapshotRef;
use forklift_adapter::cluster::PopulatorObject;
use forklift_adapter::{
    AdapterSettings, Builder, ClusterClient, DestinationClient, DestinationContext, MacConflict,
    PlanContext, PopulatorCr, PopulatorKind, SourceClient, SourceContext, StaticInventory,
    Validator,
};
use forklift_common::crd::{
    dv_phase, DataVolume, DataVolumeStatus, Migration, MigrationSpec, NetworkMap,
    NetworkMapSpec, Plan, PlanMap, PlanSpec, PlanVm, PowerState, Precopy, Provider,
    ProviderPair, ProviderSpec, ProviderType, Ref, ResourceRef, StorageMap, StorageMapSpec,
    Task, VirtualMachine, VirtualMachineSpec, VmStatus,
};
use forklift_common::kube_utils::mib_quantity;
use forklift_common::labels::{
    ANNOTATION_CURRENT_CHECKPOINT, ANNOTATION_DISK_INDEX, ANNOTATION_DISK_SOURCE,
};
use forklift_common::{Error, Result};

// =============================================================================
// Context
// =============================================================================

/// A provider in `openshift-mtv` with uid `{name}-uid`
pub fn provider(name: &str, type_: ProviderType, url: &str) -> Provider {
    let mut p = Provider::new(
        name,
        ProviderSpec {
            type_,
            url: url.to_string(),
            ..Default::default()
        },
    );
    p.metadata.namespace = Some("openshift-mtv".to_string());
    p.metadata.uid = Some(format!("{}-uid", name));
    p
}

/// Plan `openshift-mtv/plan` migrating `vm-1` into `ns`
pub fn plan() -> Plan {
    let mut plan = Plan::new(
        "plan",
        PlanSpec {
            provider: ProviderPair {
                source: ResourceRef::new("openshift-mtv", "source"),
                destination: ResourceRef::new("openshift-mtv", "host"),
            },
            target_namespace: "ns".to_string(),
            map: PlanMap {
                network: ResourceRef::new("openshift-mtv", "net"),
                storage: ResourceRef::new("openshift-mtv", "store"),
            },
            vms: vec![PlanVm {
                vm_ref: Ref::new("vm-1", "web-01"),
                ..Default::default()
            }],
            migrate_shared_disks: true,
            ..Default::default()
        },
    );
    plan.metadata.namespace = Some("openshift-mtv".to_string());
    plan.metadata.uid = Some("plan-1-uid".to_string());
    plan
}

/// Migration of [`plan`]
pub fn migration() -> Migration {
    let mut m = Migration::new(
        "migration",
        MigrationSpec {
            plan: ResourceRef::new("openshift-mtv", "plan"),
            cancel: vec![],
            cancel_all: false,
            cutover: None,
        },
    );
    m.metadata.namespace = Some("openshift-mtv".to_string());
    m.metadata.uid = Some("migration-1-uid".to_string());
    m
}

/// A cold vSphere plan targeting namespace `ns` on a fresh fake cluster
pub fn context() -> PlanContext {
    context_on(&FakeCluster::default())
}

/// A cold vSphere plan targeting namespace `ns` on `cluster`
pub fn context_on(cluster: &FakeCluster) -> PlanContext {
    PlanContext {
        plan: plan(),
        migration: migration(),
        source: SourceContext {
            provider: provider("source", ProviderType::Vsphere, "https://source.example.com/sdk"),
            secret: None,
            inventory: Arc::new(StaticInventory::default()),
            cluster: None,
        },
        destination: DestinationContext {
            provider: provider("host", ProviderType::Openshift, ""),
            cluster: Arc::new(cluster.clone()),
        },
        network_map: NetworkMap::new(
            "net",
            NetworkMapSpec {
                provider: Default::default(),
                map: vec![],
            },
        ),
        storage_map: StorageMap::new(
            "store",
            StorageMapSpec {
                provider: Default::default(),
                map: vec![],
            },
        ),
        settings: AdapterSettings::default(),
    }
}

// =============================================================================
// FakeCluster
// =============================================================================

fn api_error(code: u16, reason: &str, message: &str) -> Error {
    Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

fn selected(meta: &ObjectMeta, selector: &str) -> bool {
    let labels = meta.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
}

fn same_object(a: &ObjectMeta, b: &ObjectMeta) -> bool {
    a.name == b.name && a.namespace == b.namespace
}

/// RFC 7386 merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[derive(Default)]
struct ClusterState {
    virtual_machines: Vec<VirtualMachine>,
    data_volumes: Vec<DataVolume>,
    persistent_volume_claims: Vec<PersistentVolumeClaim>,
    persistent_volumes: Vec<PersistentVolume>,
    config_maps: Vec<ConfigMap>,
    secrets: Vec<Secret>,
    jobs: Vec<Job>,
    namespaces: BTreeMap<String, Namespace>,
    namespace_patches: Vec<Value>,
    bump_on_get: BTreeSet<String>,
    populators: Vec<(PopulatorKind, ObjectMeta)>,
    vm_exports: BTreeMap<(String, String), Value>,
    fail_creates: Option<String>,
    generated: u32,
}

impl ClusterState {
    /// Resolve `generateName`, then check for failures and duplicates
    fn admit(&mut self, meta: &mut ObjectMeta, existing: &[ObjectMeta]) -> Result<()> {
        if let Some(message) = &self.fail_creates {
            return Err(api_error(403, "Forbidden", message));
        }
        if meta.name.is_none() {
            self.generated += 1;
            let prefix = meta.generate_name.clone().unwrap_or_default();
            meta.name = Some(format!("{}{}", prefix, self.generated));
        }
        if existing.iter().any(|m| same_object(m, meta)) {
            return Err(api_error(409, "AlreadyExists", "already exists"));
        }
        self.generated += 1;
        meta.uid = Some(format!("uid-{}", self.generated));
        Ok(())
    }
}

/// In-memory destination cluster
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    fn with<T>(&self, f: impl FnOnce(&mut ClusterState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn data_volumes(&self) -> Vec<DataVolume> {
        self.with(|s| s.data_volumes.clone())
    }

    pub fn virtual_machines(&self) -> Vec<VirtualMachine> {
        self.with(|s| s.virtual_machines.clone())
    }

    pub fn persistent_volume_claims(&self) -> Vec<PersistentVolumeClaim> {
        self.with(|s| s.persistent_volume_claims.clone())
    }

    pub fn secrets(&self) -> Vec<Secret> {
        self.with(|s| s.secrets.clone())
    }

    pub fn job(&self, name: &str) -> Option<Job> {
        self.with(|s| {
            s.jobs
                .iter()
                .find(|j| j.metadata.name.as_deref() == Some(name))
                .cloned()
        })
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.with(|s| s.namespaces.get(name).cloned())
    }

    pub fn namespace_patches(&self) -> Vec<Value> {
        self.with(|s| s.namespace_patches.clone())
    }

    pub fn insert_secret(&self, secret: Secret) {
        self.with(|s| s.secrets.push(secret));
    }

    pub fn insert_data_volume(&self, dv: DataVolume) {
        self.with(|s| s.data_volumes.push(dv));
    }

    pub fn insert_persistent_volume_claim(&self, pvc: PersistentVolumeClaim) {
        self.with(|s| s.persistent_volume_claims.push(pvc));
    }

    pub fn insert_namespace(&self, mut ns: Namespace) {
        ns.metadata.resource_version.get_or_insert_with(|| "1".to_string());
        let name = ns.metadata.name.clone().unwrap_or_default();
        self.with(|s| s.namespaces.insert(name, ns));
    }

    /// The next read of `name` returns a copy that is already stale
    pub fn bump_namespace_version_on_next_get(&self, name: &str) {
        self.with(|s| s.bump_on_get.insert(name.to_string()));
    }

    /// Every create fails with a 403 carrying `message`
    pub fn fail_creates(&self, message: &str) {
        self.with(|s| s.fail_creates = Some(message.to_string()));
    }

    pub fn set_data_volume_phase(&self, name: &str, phase: &str) {
        self.update_data_volume(name, |status| status.phase = Some(phase.to_string()));
    }

    pub fn set_data_volume_progress(&self, name: &str, progress: &str) {
        self.update_data_volume(name, |status| status.progress = Some(progress.to_string()));
    }

    /// Set the phase of every DataVolume
    pub fn set_all_data_volume_phases(&self, phase: &str) {
        for dv in self.data_volumes() {
            self.set_data_volume_phase(dv.metadata.name.as_deref().unwrap_or_default(), phase);
        }
    }

    /// Pause every DataVolume on `checkpoint`, the way CDI does once an
    /// importer has copied it
    pub fn pause_data_volumes_at(&self, checkpoint: &str) {
        self.with(|s| {
            for dv in &mut s.data_volumes {
                dv.metadata.annotations.get_or_insert_with(Default::default).insert(
                    ANNOTATION_CURRENT_CHECKPOINT.to_string(),
                    checkpoint.to_string(),
                );
                dv.status.get_or_insert_with(Default::default).phase =
                    Some(dv_phase::PAUSED.to_string());
            }
        });
    }

    fn update_data_volume(&self, name: &str, f: impl FnOnce(&mut DataVolumeStatus)) {
        self.with(|s| {
            if let Some(dv) = s
                .data_volumes
                .iter_mut()
                .find(|dv| dv.metadata.name.as_deref() == Some(name))
            {
                f(dv.status.get_or_insert_with(Default::default));
            }
        });
    }

    pub fn set_job_status(&self, name: &str, status: JobStatus) {
        self.with(|s| {
            if let Some(job) = s
                .jobs
                .iter_mut()
                .find(|j| j.metadata.name.as_deref() == Some(name))
            {
                job.status = Some(status);
            }
        });
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_virtual_machines(
        &self,
        namespace: &str,
        selector: Option<String>,
    ) -> Result<Vec<VirtualMachine>> {
        let selector = selector.unwrap_or_default();
        Ok(self.with(|s| {
            s.virtual_machines
                .iter()
                .filter(|vm| vm.metadata.namespace.as_deref() == Some(namespace))
                .filter(|vm| selected(&vm.metadata, &selector))
                .cloned()
                .collect()
        }))
    }

    async fn get_virtual_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>> {
        Ok(self.with(|s| {
            s.virtual_machines
                .iter()
                .find(|vm| {
                    vm.metadata.namespace.as_deref() == Some(namespace)
                        && vm.metadata.name.as_deref() == Some(name)
                })
                .cloned()
        }))
    }

    async fn create_virtual_machine(&self, vm: &VirtualMachine) -> Result<VirtualMachine> {
        self.with(|s| {
            let mut vm = vm.clone();
            let existing: Vec<_> = s.virtual_machines.iter().map(|v| v.metadata.clone()).collect();
            s.admit(&mut vm.metadata, &existing)?;
            s.virtual_machines.push(vm.clone());
            Ok(vm)
        })
    }

    async fn patch_virtual_machine(&self, _namespace: &str, _name: &str, _patch: Value) -> Result<()> {
        Ok(())
    }

    async fn list_data_volumes(&self, namespace: &str, selector: String) -> Result<Vec<DataVolume>> {
        Ok(self.with(|s| {
            s.data_volumes
                .iter()
                .filter(|dv| dv.metadata.namespace.as_deref() == Some(namespace))
                .filter(|dv| selected(&dv.metadata, &selector))
                .cloned()
                .collect()
        }))
    }

    async fn create_data_volume(&self, dv: &DataVolume) -> Result<DataVolume> {
        self.with(|s| {
            let mut dv = dv.clone();
            let existing: Vec<_> = s.data_volumes.iter().map(|d| d.metadata.clone()).collect();
            s.admit(&mut dv.metadata, &existing)?;
            s.data_volumes.push(dv.clone());
            Ok(dv)
        })
    }

    async fn patch_data_volume(&self, _namespace: &str, _name: &str, _patch: Value) -> Result<()> {
        Ok(())
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<()> {
        self.with(|s| {
            s.data_volumes.retain(|dv| {
                !(dv.metadata.namespace.as_deref() == Some(namespace)
                    && dv.metadata.name.as_deref() == Some(name))
            })
        });
        Ok(())
    }

    async fn list_persistent_volume_claims(
        &self,
        namespace: &str,
        selector: String,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self.with(|s| {
            s.persistent_volume_claims
                .iter()
                .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
                .filter(|p| selected(&p.metadata, &selector))
                .cloned()
                .collect()
        }))
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.with(|s| {
            s.persistent_volume_claims
                .iter()
                .find(|p| {
                    p.metadata.namespace.as_deref() == Some(namespace)
                        && p.metadata.name.as_deref() == Some(name)
                })
                .cloned()
        }))
    }

    async fn create_persistent_volume_claim(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        self.with(|s| {
            let mut pvc = pvc.clone();
            let existing: Vec<_> = s
                .persistent_volume_claims
                .iter()
                .map(|p| p.metadata.clone())
                .collect();
            s.admit(&mut pvc.metadata, &existing)?;
            s.persistent_volume_claims.push(pvc.clone());
            Ok(pvc)
        })
    }

    async fn list_persistent_volumes(&self, selector: String) -> Result<Vec<PersistentVolume>> {
        Ok(self.with(|s| {
            s.persistent_volumes
                .iter()
                .filter(|p| selected(&p.metadata, &selector))
                .cloned()
                .collect()
        }))
    }

    async fn create_persistent_volume(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        self.with(|s| {
            let mut pv = pv.clone();
            let existing: Vec<_> = s.persistent_volumes.iter().map(|p| p.metadata.clone()).collect();
            s.admit(&mut pv.metadata, &existing)?;
            s.persistent_volumes.push(pv.clone());
            Ok(pv)
        })
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.with(|s| {
            s.config_maps
                .iter()
                .find(|c| {
                    c.metadata.namespace.as_deref() == Some(namespace)
                        && c.metadata.name.as_deref() == Some(name)
                })
                .cloned()
        }))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        self.with(|s| {
            let mut cm = config_map.clone();
            let existing: Vec<_> = s.config_maps.iter().map(|c| c.metadata.clone()).collect();
            s.admit(&mut cm.metadata, &existing)?;
            s.config_maps.push(cm.clone());
            Ok(cm)
        })
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.with(|s| {
            s.secrets
                .iter()
                .find(|c| {
                    c.metadata.namespace.as_deref() == Some(namespace)
                        && c.metadata.name.as_deref() == Some(name)
                })
                .cloned()
        }))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        self.with(|s| {
            let mut secret = secret.clone();
            let existing: Vec<_> = s.secrets.iter().map(|c| c.metadata.clone()).collect();
            s.admit(&mut secret.metadata, &existing)?;
            s.secrets.push(secret.clone());
            Ok(secret)
        })
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.with(|s| {
            s.jobs
                .iter()
                .find(|j| {
                    j.metadata.namespace.as_deref() == Some(namespace)
                        && j.metadata.name.as_deref() == Some(name)
                })
                .cloned()
        }))
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        self.with(|s| {
            let mut job = job.clone();
            let existing: Vec<_> = s.jobs.iter().map(|j| j.metadata.clone()).collect();
            s.admit(&mut job.metadata, &existing)?;
            s.jobs.push(job.clone());
            Ok(job)
        })
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Ok(self.with(|s| {
            let found = s.namespaces.get(name).cloned();
            if s.bump_on_get.remove(name) {
                if let Some(ns) = s.namespaces.get_mut(name) {
                    ns.metadata.resource_version = Some("stale".to_string());
                }
            }
            found
        }))
    }

    async fn patch_namespace(&self, name: &str, patch: Value) -> Result<()> {
        self.with(|s| {
            let Some(ns) = s.namespaces.get(name) else {
                return Err(api_error(404, "NotFound", "namespace not found"));
            };
            let current = ns.metadata.resource_version.clone().unwrap_or_default();
            if let Some(expected) = patch["metadata"]["resourceVersion"].as_str() {
                if expected != current {
                    return Err(api_error(409, "Conflict", "the object has been modified"));
                }
            }
            let mut value = serde_json::to_value(ns)
                .map_err(|e| Error::serialization(e.to_string()))?;
            merge_patch(&mut value, &patch);
            let mut updated: Namespace = serde_json::from_value(value)
                .map_err(|e| Error::serialization(e.to_string()))?;
            let next = current.parse::<u64>().unwrap_or(0) + 1;
            updated.metadata.resource_version = Some(next.to_string());
            s.namespaces.insert(name.to_string(), updated);
            s.namespace_patches.push(patch);
            Ok(())
        })
    }

    async fn create_populator(&self, populator: &PopulatorCr) -> Result<()> {
        let (kind, meta) = match populator {
            PopulatorCr::Ovirt(p) => (PopulatorKind::Ovirt, p.metadata.clone()),
            PopulatorCr::Openstack(p) => (PopulatorKind::Openstack, p.metadata.clone()),
        };
        self.with(|s| s.populators.push((kind, meta)));
        Ok(())
    }

    async fn list_populators(
        &self,
        kind: PopulatorKind,
        namespace: &str,
        selector: String,
    ) -> Result<Vec<PopulatorObject>> {
        Ok(self.with(|s| {
            s.populators
                .iter()
                .filter(|(k, m)| {
                    *k == kind
                        && m.namespace.as_deref() == Some(namespace)
                        && selected(m, &selector)
                })
                .map(|(_, m)| PopulatorObject {
                    name: m.name.clone().unwrap_or_default(),
                    uid: m.uid.clone(),
                    ..Default::default()
                })
                .collect()
        }))
    }

    async fn patch_populator(
        &self,
        _kind: PopulatorKind,
        _namespace: &str,
        _name: &str,
        _patch: Value,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete_populator(&self, kind: PopulatorKind, namespace: &str, name: &str) -> Result<()> {
        self.with(|s| {
            s.populators.retain(|(k, m)| {
                !(*k == kind
                    && m.namespace.as_deref() == Some(namespace)
                    && m.name.as_deref() == Some(name))
            })
        });
        Ok(())
    }

    async fn create_vm_export(&self, namespace: &str, name: &str, vm_name: &str) -> Result<()> {
        self.with(|s| {
            s.vm_exports.insert(
                (namespace.to_string(), name.to_string()),
                serde_json::json!({"spec": {"source": {"name": vm_name}}}),
            )
        });
        Ok(())
    }

    async fn get_vm_export(&self, namespace: &str, name: &str) -> Result<Option<Value>> {
        Ok(self.with(|s| {
            s.vm_exports
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }))
    }

    async fn delete_vm_export(&self, namespace: &str, name: &str) -> Result<()> {
        self.with(|s| s.vm_exports.remove(&(namespace.to_string(), name.to_string())));
        Ok(())
    }
}

// =============================================================================
// Stub collaborators
// =============================================================================

/// Builder over a fixed disk list
#[derive(Clone)]
pub struct StubBuilder {
    /// `(disk id, size in MiB)`
    pub disks: Vec<(String, i64)>,
    /// Fill disks through populators instead of DataVolumes
    pub populators: bool,
    /// Bytes every populator reports
    pub populated_bytes: i64,
    /// Put data into the importer Secret
    pub with_secret: bool,
    /// Fail preference lookups the way providers without a mapping do
    pub no_preference: bool,
}

impl Default for StubBuilder {
    fn default() -> Self {
        Self {
            disks: vec![("disk-0".to_string(), 1024), ("disk-1".to_string(), 2048)],
            populators: false,
            populated_bytes: 0,
            with_secret: false,
            no_preference: false,
        }
    }
}

fn disk_annotations(id: &str, index: usize) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ANNOTATION_DISK_SOURCE.to_string(), id.to_string()),
        (ANNOTATION_DISK_INDEX.to_string(), index.to_string()),
    ])
}

#[async_trait]
impl Builder for StubBuilder {
    async fn data_volumes(
        &self,
        _vm: &Ref,
        inputs: &VolumeInputs,
        template: &DataVolume,
    ) -> Result<Vec<DataVolume>> {
        Ok(self
            .disks
            .iter()
            .enumerate()
            .map(|(i, (id, _))| {
                let mut dv = template.clone();
                let annotations = dv.metadata.annotations.get_or_insert_with(BTreeMap::new);
                annotations.extend(disk_annotations(id, i));
                if let Some(secret) = &inputs.secret {
                    annotations.insert("test/secret".to_string(), secret.clone());
                }
                dv
            })
            .collect())
    }

    async fn virtual_machine(
        &self,
        _vm: &Ref,
        spec: &mut VirtualMachineSpec,
        _pvcs: &[PersistentVolumeClaim],
        _use_instance_type: bool,
        _sort_by_libvirt: bool,
    ) -> Result<()> {
        spec.run_strategy = Some("Always".to_string());
        Ok(())
    }

    async fn tasks(&self, _vm: &Ref) -> Result<Vec<Task>> {
        Ok(self
            .disks
            .iter()
            .map(|(id, mib)| Task::new(id.clone(), *mib))
            .collect())
    }

    async fn secret(&self, _vm: &Ref, _input: &Secret, output: &mut Secret) -> Result<()> {
        if self.with_secret {
            output.string_data = Some(BTreeMap::from([(
                "accessKeyId".to_string(),
                "admin".to_string(),
            )]));
        }
        Ok(())
    }

    async fn populator_volumes(
        &self,
        _vm: &Ref,
        annotations: &BTreeMap<String, String>,
        _secret_name: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        if !self.populators {
            return Err(Error::VolumePopulatorNotSupported);
        }
        Ok(self
            .disks
            .iter()
            .enumerate()
            .map(|(i, (id, mib))| {
                let mut all = annotations.clone();
                all.extend(disk_annotations(id, i));
                PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        generate_name: Some("web-01-".to_string()),
                        annotations: Some(all),
                        ..Default::default()
                    },
                    spec: Some(k8s_openapi::api::core::v1::PersistentVolumeClaimSpec {
                        resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                            requests: Some(BTreeMap::from([(
                                "storage".to_string(),
                                mib_quantity(*mib),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }
            })
            .collect())
    }

    async fn populator_transferred_bytes(&self, _pvc: &PersistentVolumeClaim) -> Result<i64> {
        Ok(self.populated_bytes)
    }

    fn supports_volume_populators(&self) -> bool {
        self.populators
    }

    async fn template_labels(&self, _vm: &Ref) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::from([(
            "os.template.kubevirt.io/fedora".to_string(),
            "true".to_string(),
        )]))
    }

    async fn preference_name(&self, vm: &Ref) -> Result<String> {
        if self.no_preference {
            return Err(Error::provider_permanent(vm.to_string(), "ova", "no preference"));
        }
        Ok("fedora".to_string())
    }

    async fn pod_environment(&self, _vm: &Ref, _source_secret: &str) -> Result<Vec<EnvVar>> {
        Ok(Vec::new())
    }
}

/// What the pipeline asked of the source
#[derive(Debug, Default)]
pub struct ClientCalls {
    /// Current power state
    pub power: PowerState,
    /// Power-off requests
    pub power_offs: u32,
    /// Snapshots created, in order
    pub snapshots: Vec<String>,
    /// Snapshots removed, in order
    pub removed: Vec<String>,
    /// `final` flag of every SetCheckpoints call
    pub checkpoints: Vec<bool>,
    /// Pre-transfer calls remaining before ready
    pub pre_transfer_pending: u32,
    /// Error returned by pre-transfer actions
    pub pre_transfer_error: Option<Error>,
    /// Disks detached
    pub detached: u32,
}

/// Source client that powers off instantly and snapshots on request
#[derive(Clone)]
pub struct StubClient {
    pub calls: Arc<Mutex<ClientCalls>>,
}

impl Default for StubClient {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(ClientCalls {
                power: PowerState::On,
                ..Default::default()
            })),
        }
    }
}

#[async_trait]
impl SourceClient for StubClient {
    async fn power_state(&self, _vm: &Ref) -> Result<PowerState> {
        Ok(self.calls.lock().unwrap().power)
    }

    async fn power_on(&self, _vm: &Ref) -> Result<()> {
        self.calls.lock().unwrap().power = PowerState::On;
        Ok(())
    }

    async fn power_off(&self, _vm: &Ref) -> Result<()> {
        let mut calls = self.calls.lock().unwrap();
        calls.power_offs += 1;
        calls.power = PowerState::Off;
        Ok(())
    }

    async fn create_snapshot(&self, _vm: &Ref) -> Result<SnapshotRef> {
        let mut calls = self.calls.lock().unwrap();
        let id = format!("snap-{}", calls.snapshots.len() + 1);
        calls.snapshots.push(id.clone());
        Ok(SnapshotRef { id, task_id: None })
    }

    async fn remove_snapshot(&self, _vm: &Ref, snapshot: &str) -> Result<Option<String>> {
        self.calls.lock().unwrap().removed.push(snapshot.to_string());
        Ok(None)
    }

    async fn get_snapshot_deltas(
        &self,
        _vm: &Ref,
        snapshot: &str,
    ) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::from([("disk-0".to_string(), format!("{}-change", snapshot))]))
    }

    async fn set_checkpoints(
        &self,
        _vm: &Ref,
        _precopies: &[Precopy],
        _data_volumes: &[DataVolume],
        final_checkpoint: bool,
    ) -> Result<()> {
        self.calls.lock().unwrap().checkpoints.push(final_checkpoint);
        Ok(())
    }

    async fn pre_transfer_actions(&self, _vm: &Ref) -> Result<bool> {
        let mut calls = self.calls.lock().unwrap();
        if let Some(err) = calls.pre_transfer_error.take() {
            return Err(err);
        }
        if calls.pre_transfer_pending > 0 {
            calls.pre_transfer_pending -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    async fn detach_disks(&self, _vm: &Ref) -> Result<()> {
        self.calls.lock().unwrap().detached += 1;
        Ok(())
    }
}

/// Validator whose checks are fixed flags; everything passes by default
#[derive(Clone)]
pub struct StubValidator {
    pub storage_mapped: bool,
    pub networks_mapped: bool,
    pub host_ready: bool,
    pub change_tracking: bool,
    pub power_state_ok: bool,
    pub pvc_template_valid: bool,
    pub unsupported_disks: Vec<String>,
    pub mac_conflicts: Vec<MacConflict>,
}

impl Default for StubValidator {
    fn default() -> Self {
        Self {
            storage_mapped: true,
            networks_mapped: true,
            host_ready: true,
            change_tracking: true,
            power_state_ok: true,
            pvc_template_valid: true,
            unsupported_disks: Vec::new(),
            mac_conflicts: Vec::new(),
        }
    }
}

#[async_trait]
impl Validator for StubValidator {
    async fn storage_mapped(&self, _vm: &Ref) -> Result<bool> {
        Ok(self.storage_mapped)
    }

    async fn networks_mapped(&self, _vm: &Ref) -> Result<bool> {
        Ok(self.networks_mapped)
    }

    async fn pod_network(&self, _vm: &Ref) -> Result<bool> {
        Ok(true)
    }

    async fn maintenance_mode(&self, _vm: &Ref) -> Result<bool> {
        Ok(self.host_ready)
    }

    fn warm_migration(&self) -> bool {
        true
    }

    fn migration_type(&self) -> bool {
        true
    }

    async fn static_ips(&self, _vm: &Ref) -> Result<bool> {
        Ok(true)
    }

    async fn shared_disks(&self, _vm: &Ref) -> Result<(bool, String)> {
        Ok((true, String::new()))
    }

    async fn change_tracking_enabled(&self, _vm: &Ref) -> Result<bool> {
        Ok(self.change_tracking)
    }

    async fn has_snapshot(&self, _vm: &Ref) -> Result<(bool, String)> {
        Ok((true, String::new()))
    }

    async fn power_state(&self, _vm: &Ref) -> Result<bool> {
        Ok(self.power_state_ok)
    }

    async fn unsupported_disks(&self, _vm: &Ref) -> Result<Vec<String>> {
        Ok(self.unsupported_disks.clone())
    }

    async fn invalid_disk_sizes(&self, _vm: &Ref) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn mac_conflicts(&self, _vm: &Ref) -> Result<Vec<MacConflict>> {
        Ok(self.mac_conflicts.clone())
    }

    async fn pvc_name_template(&self, _vm: &Ref, _template: &str) -> Result<bool> {
        Ok(self.pvc_template_valid)
    }
}

/// Destination client counting its calls
#[derive(Clone, Default)]
pub struct StubDestination {
    pub cleaned: Arc<Mutex<Vec<String>>>,
    pub ownership_calls: Arc<Mutex<u32>>,
}

#[async_trait]
impl DestinationClient for StubDestination {
    async fn delete_populator_data_source(&self, vm: &VmStatus) -> Result<()> {
        self.cleaned.lock().unwrap().push(vm.vm_ref.id.clone());
        Ok(())
    }

    async fn set_populator_cr_ownership(&self) -> Result<()> {
        *self.ownership_calls.lock().unwrap() += 1;
        Ok(())
    }
}
