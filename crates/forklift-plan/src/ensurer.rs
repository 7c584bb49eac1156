//! Idempotent creation of destination objects
//!
//! Owned objects (VirtualMachine, DataVolume, PVC) are found again through
//! the owner label triple and keyed by their `disk-source` annotation, so a
//! second pass over the same drafts creates nothing. Shared objects
//! (ConfigMap, Secret) are keyed by name and tolerate AlreadyExists.
//!
//! Nothing here updates or patches an existing object.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolume, PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use forklift_adapter::ClusterClient;
use forklift_common::crd::{DataVolume, VirtualMachine};
use forklift_common::kube_utils::merge_into;
use forklift_common::labels::{disk_source, ANNOTATION_FORKLIFT_SOURCE};
use forklift_common::{Error, Result};

use crate::labeler::Labeler;

/// Creates the destination objects for one VM
pub struct Ensurer {
    cluster: Arc<dyn ClusterClient>,
    labeler: Labeler,
}

impl Ensurer {
    /// Ensurer writing to `cluster` on behalf of the VM behind `labeler`
    pub fn new(cluster: Arc<dyn ClusterClient>, labeler: Labeler) -> Self {
        Self { cluster, labeler }
    }

    /// The labeler stamping created objects
    pub fn labeler(&self) -> &Labeler {
        &self.labeler
    }

    // =========================================================================
    // Owned objects
    // =========================================================================

    /// Create the DataVolumes whose disk is not yet present
    ///
    /// Returns every DataVolume for the VM, existing and created.
    pub async fn ensure_data_volumes(&self, drafts: Vec<DataVolume>) -> Result<Vec<DataVolume>> {
        let namespace = self.labeler.namespace();
        let mut existing = self
            .cluster
            .list_data_volumes(namespace, self.labeler.selector())
            .await?;
        let present = disk_keys(existing.iter().map(|dv| &dv.metadata));

        for mut draft in drafts {
            if is_present(&present, &draft.metadata) {
                continue;
            }
            self.labeler.stamp(&mut draft.metadata);
            let created = self.cluster.create_data_volume(&draft).await?;
            info!(
                namespace = %namespace,
                name = %created.metadata.name.as_deref().unwrap_or_default(),
                vm = %self.labeler.owner().vm_id,
                "created DataVolume"
            );
            existing.push(created);
        }
        Ok(existing)
    }

    /// Create the PVCs whose disk is not yet present
    pub async fn ensure_persistent_volume_claims(
        &self,
        drafts: Vec<PersistentVolumeClaim>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let namespace = self.labeler.namespace();
        let mut existing = self
            .cluster
            .list_persistent_volume_claims(namespace, self.labeler.selector())
            .await?;
        let present = disk_keys(existing.iter().map(|pvc| &pvc.metadata));

        for mut draft in drafts {
            if is_present(&present, &draft.metadata) {
                continue;
            }
            self.labeler.stamp(&mut draft.metadata);
            let created = self.cluster.create_persistent_volume_claim(&draft).await?;
            info!(
                namespace = %namespace,
                name = %created.metadata.name.as_deref().unwrap_or_default(),
                vm = %self.labeler.owner().vm_id,
                "created PersistentVolumeClaim"
            );
            existing.push(created);
        }
        Ok(existing)
    }

    /// Create the destination VM unless one already exists for the VM
    pub async fn ensure_virtual_machine(&self, mut draft: VirtualMachine) -> Result<VirtualMachine> {
        let namespace = self.labeler.namespace();
        let existing = self
            .cluster
            .list_virtual_machines(namespace, Some(self.labeler.selector()))
            .await?;
        if let Some(vm) = existing.into_iter().next() {
            debug!(
                namespace = %namespace,
                name = %vm.metadata.name.as_deref().unwrap_or_default(),
                "VirtualMachine already exists"
            );
            return Ok(vm);
        }

        self.labeler.stamp(&mut draft.metadata);
        let created = self.cluster.create_virtual_machine(&draft).await?;
        info!(
            namespace = %namespace,
            name = %created.metadata.name.as_deref().unwrap_or_default(),
            vm = %self.labeler.owner().vm_id,
            "created VirtualMachine"
        );
        Ok(created)
    }

    /// Create the LUN PersistentVolumes not yet present, keyed by name
    pub async fn ensure_lun_persistent_volumes(
        &self,
        drafts: Vec<PersistentVolume>,
    ) -> Result<Vec<PersistentVolume>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        let mut existing = self
            .cluster
            .list_persistent_volumes(self.labeler.selector())
            .await?;
        let present = name_keys(existing.iter().map(|pv| &pv.metadata));

        for mut draft in drafts {
            if draft.metadata.name.as_ref().is_some_and(|n| present.contains(n)) {
                continue;
            }
            // cluster-scoped: labels only
            self.labeler
                .owner()
                .stamp(draft.metadata.labels.get_or_insert_with(BTreeMap::new));
            let created = self.cluster.create_persistent_volume(&draft).await?;
            info!(
                name = %created.metadata.name.as_deref().unwrap_or_default(),
                vm = %self.labeler.owner().vm_id,
                "created LUN PersistentVolume"
            );
            existing.push(created);
        }
        Ok(existing)
    }

    /// Create the LUN PVCs not yet present, keyed by name
    pub async fn ensure_lun_persistent_volume_claims(
        &self,
        drafts: Vec<PersistentVolumeClaim>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        let namespace = self.labeler.namespace();
        let existing = self
            .cluster
            .list_persistent_volume_claims(namespace, self.labeler.selector())
            .await?;

        let mut claims = Vec::new();
        for mut draft in drafts {
            let found = draft
                .metadata
                .name
                .as_ref()
                .and_then(|name| existing.iter().find(|pvc| pvc.metadata.name.as_ref() == Some(name)));
            if let Some(found) = found {
                claims.push(found.clone());
                continue;
            }
            self.labeler.stamp(&mut draft.metadata);
            let created = self.cluster.create_persistent_volume_claim(&draft).await?;
            info!(
                namespace = %namespace,
                name = %created.metadata.name.as_deref().unwrap_or_default(),
                vm = %self.labeler.owner().vm_id,
                "created LUN PersistentVolumeClaim"
            );
            claims.push(created);
        }
        Ok(claims)
    }

    // =========================================================================
    // Shared objects
    // =========================================================================

    /// Create a shared Secret, tolerating one that already exists
    pub async fn ensure_secret(&self, mut draft: Secret) -> Result<Secret> {
        mark_shared(&mut draft.metadata, self.labeler.namespace());
        match self.cluster.create_secret(&draft).await {
            Ok(created) => {
                info!(
                    namespace = %self.labeler.namespace(),
                    name = %created.metadata.name.as_deref().unwrap_or_default(),
                    "created Secret"
                );
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                let name = draft.metadata.name.clone().unwrap_or_default();
                let found = self
                    .cluster
                    .get_secret(self.labeler.namespace(), &name)
                    .await?
                    .ok_or_else(|| missing_after_conflict("Secret", &name))?;
                log_pre_existing("Secret", &found.metadata);
                Ok(found)
            }
            Err(e) => Err(e),
        }
    }

    /// Create a shared ConfigMap, tolerating one that already exists
    pub async fn ensure_config_map(&self, mut draft: ConfigMap) -> Result<ConfigMap> {
        mark_shared(&mut draft.metadata, self.labeler.namespace());
        match self.cluster.create_config_map(&draft).await {
            Ok(created) => {
                info!(
                    namespace = %self.labeler.namespace(),
                    name = %created.metadata.name.as_deref().unwrap_or_default(),
                    "created ConfigMap"
                );
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                let name = draft.metadata.name.clone().unwrap_or_default();
                let found = self
                    .cluster
                    .get_config_map(self.labeler.namespace(), &name)
                    .await?
                    .ok_or_else(|| missing_after_conflict("ConfigMap", &name))?;
                log_pre_existing("ConfigMap", &found.metadata);
                Ok(found)
            }
            Err(e) => Err(e),
        }
    }
}

fn disk_keys<'a>(metas: impl Iterator<Item = &'a ObjectMeta>) -> HashSet<String> {
    metas
        .filter_map(|m| disk_source(m.annotations.as_ref()))
        .map(str::to_string)
        .collect()
}

fn name_keys<'a>(metas: impl Iterator<Item = &'a ObjectMeta>) -> HashSet<String> {
    metas.filter_map(|m| m.name.clone()).collect()
}

fn is_present(present: &HashSet<String>, draft: &ObjectMeta) -> bool {
    disk_source(draft.annotations.as_ref()).is_some_and(|key| present.contains(key))
}

fn mark_shared(meta: &mut ObjectMeta, namespace: &str) {
    meta.namespace = Some(namespace.to_string());
    merge_into(
        &mut meta.annotations,
        [(ANNOTATION_FORKLIFT_SOURCE.to_string(), "true".to_string())],
    );
}

fn log_pre_existing(kind: &str, meta: &ObjectMeta) {
    let name = meta.name.as_deref().unwrap_or_default();
    let ours = meta
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(ANNOTATION_FORKLIFT_SOURCE));
    if ours {
        debug!(kind = %kind, name = %name, "shared object already created");
    } else {
        info!(kind = %kind, name = %name, "pre-existing, assumed intentional");
    }
}

fn missing_after_conflict(kind: &str, name: &str) -> Error {
    Error::internal_with_context(
        "ensurer",
        format!("{} {} reported AlreadyExists but cannot be read", kind, name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, FakeCluster};
    use forklift_common::crd::{DataVolumeSpec, Ref, VirtualMachineSpec};
    use forklift_common::labels::{ANNOTATION_DISK_SOURCE, LABEL_VM_ID};

    fn ensurer(cluster: &FakeCluster) -> Ensurer {
        let ctx = context();
        Ensurer::new(
            Arc::new(cluster.clone()),
            Labeler::new(&ctx, &Ref::new("vm-1", "web-01")),
        )
    }

    fn draft(disk: &str) -> DataVolume {
        let mut dv = DataVolume::new("", DataVolumeSpec::default());
        dv.metadata.name = None;
        dv.metadata.generate_name = Some("web-01-".to_string());
        dv.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_DISK_SOURCE.to_string(),
            disk.to_string(),
        )]));
        dv
    }

    // =========================================================================
    // Story Tests: Owned Objects
    // =========================================================================

    /// Story: the second reconcile finds every disk already allocated
    #[tokio::test]
    async fn story_data_volumes_created_once() {
        let cluster = FakeCluster::default();
        let e = ensurer(&cluster);

        let first = e
            .ensure_data_volumes(vec![draft("disk-0"), draft("disk-1")])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        let labels = first[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_VM_ID], "vm-1");

        let second = e
            .ensure_data_volumes(vec![draft("disk-0"), draft("disk-1")])
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(cluster.data_volumes().len(), 2);
    }

    /// Story: only the missing disk is created on a partial retry
    #[tokio::test]
    async fn story_partial_retry_creates_only_missing() {
        let cluster = FakeCluster::default();
        let e = ensurer(&cluster);
        e.ensure_data_volumes(vec![draft("disk-0")]).await.unwrap();
        let all = e
            .ensure_data_volumes(vec![draft("disk-0"), draft("disk-1")])
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(cluster.data_volumes().len(), 2);
    }

    #[tokio::test]
    async fn at_most_one_virtual_machine() {
        let cluster = FakeCluster::default();
        let e = ensurer(&cluster);
        let draft = || {
            let mut vm = VirtualMachine::new("web-01", VirtualMachineSpec::default());
            vm.metadata.namespace = None;
            vm
        };
        let first = e.ensure_virtual_machine(draft()).await.unwrap();
        let second = e.ensure_virtual_machine(draft()).await.unwrap();
        assert_eq!(first.metadata.name, second.metadata.name);
        assert_eq!(cluster.virtual_machines().len(), 1);
        assert_eq!(
            cluster.virtual_machines()[0].metadata.namespace.as_deref(),
            Some("ns")
        );
    }

    #[tokio::test]
    async fn lun_claims_are_keyed_by_name() {
        let cluster = FakeCluster::default();
        let e = ensurer(&cluster);
        let claim = || PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("lun-0".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        e.ensure_lun_persistent_volume_claims(vec![claim()])
            .await
            .unwrap();
        let again = e
            .ensure_lun_persistent_volume_claims(vec![claim()])
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(cluster.persistent_volume_claims().len(), 1);
    }

    // =========================================================================
    // Story Tests: Shared Objects
    // =========================================================================

    /// Story: a Secret the admin created by hand is reused as-is
    #[tokio::test]
    async fn story_pre_existing_secret_is_reused() {
        let cluster = FakeCluster::default();
        cluster.insert_secret(Secret {
            metadata: ObjectMeta {
                name: Some("plan-vm-1".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let e = ensurer(&cluster);
        let secret = e
            .ensure_secret(Secret {
                metadata: ObjectMeta {
                    name: Some("plan-vm-1".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(secret.metadata.annotations.is_none());
    }

    #[tokio::test]
    async fn shared_config_map_twice_is_fine() {
        let cluster = FakeCluster::default();
        let e = ensurer(&cluster);
        let draft = || ConfigMap {
            metadata: ObjectMeta {
                name: Some("plan-vm-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        e.ensure_config_map(draft()).await.unwrap();
        let again = e.ensure_config_map(draft()).await.unwrap();
        assert_eq!(
            again.metadata.annotations.unwrap()[ANNOTATION_FORKLIFT_SOURCE],
            "true"
        );
    }

    #[tokio::test]
    async fn other_create_errors_propagate() {
        let cluster = FakeCluster::default();
        cluster.fail_creates("forbidden");
        let e = ensurer(&cluster);
        let err = e
            .ensure_config_map(ConfigMap {
                metadata: ObjectMeta {
                    name: Some("cm".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(!err.is_already_exists());
    }
}
