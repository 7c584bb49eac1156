//! The Builder collaborator
//!
//! A Builder turns a source VM's inventory into destination drafts: one
//! DataVolume per disk, the KubeVirt VM spec, per-disk progress tasks, and
//! the auxiliary Secret/ConfigMap contents the importers need. Drafts are
//! deterministic for a given inventory snapshot and mapping.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, EnvVar, PersistentVolume, PersistentVolumeClaim, Secret,
};

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::{DataVolume, Ref, Task, VirtualMachineSpec};
use forklift_common::labels::disk_source;
use forklift_common::{Error, Result};

/// Names of the auxiliary objects the DataVolume sources reference
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeInputs {
    /// Secret holding importer credentials
    pub secret: Option<String>,
    /// ConfigMap holding a CA bundle
    pub config_map: Option<String>,
}

/// Builds destination drafts for source VMs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Builder: Send + Sync {
    /// One DataVolume draft per migrated disk, in disk order
    ///
    /// Each draft starts from `template` (labels, annotations, name prefix)
    /// and carries the `disk-source` and `disk-index` annotations.
    async fn data_volumes(
        &self,
        vm: &Ref,
        inputs: &VolumeInputs,
        template: &DataVolume,
    ) -> Result<Vec<DataVolume>>;

    /// Populate `spec` for the destination VM backed by `pvcs`
    async fn virtual_machine(
        &self,
        vm: &Ref,
        spec: &mut VirtualMachineSpec,
        pvcs: &[PersistentVolumeClaim],
        use_instance_type: bool,
        sort_by_libvirt: bool,
    ) -> Result<()>;

    /// Per-disk progress tasks, totals in MiB
    async fn tasks(&self, vm: &Ref) -> Result<Vec<Task>>;

    /// Fill the importer Secret from the provider secret
    async fn secret(&self, _vm: &Ref, _input: &Secret, _output: &mut Secret) -> Result<()> {
        Ok(())
    }

    /// Fill the importer ConfigMap from the provider secret
    async fn config_map(&self, _vm: &Ref, _input: &Secret, _output: &mut ConfigMap) -> Result<()> {
        Ok(())
    }

    /// PersistentVolumes for direct-attached LUNs
    async fn lun_persistent_volumes(&self, _vm: &Ref) -> Result<Vec<PersistentVolume>> {
        Ok(Vec::new())
    }

    /// PVCs binding the LUN PersistentVolumes
    async fn lun_persistent_volume_claims(&self, _vm: &Ref) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(Vec::new())
    }

    /// PVCs filled by volume populators instead of DataVolumes
    ///
    /// Returns [`Error::VolumePopulatorNotSupported`] for providers without
    /// populators.
    async fn populator_volumes(
        &self,
        _vm: &Ref,
        _annotations: &BTreeMap<String, String>,
        _secret_name: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Err(Error::VolumePopulatorNotSupported)
    }

    /// Bytes a populator has written into `pvc`
    async fn populator_transferred_bytes(&self, _pvc: &PersistentVolumeClaim) -> Result<i64> {
        Err(Error::VolumePopulatorNotSupported)
    }

    /// Whether disks are filled by populators
    fn supports_volume_populators(&self) -> bool {
        false
    }

    /// Stable disk identifier of a DataVolume
    fn resolve_data_volume_identifier(&self, dv: &DataVolume) -> String {
        disk_source(dv.metadata.annotations.as_ref())
            .unwrap_or_default()
            .to_string()
    }

    /// Stable disk identifier of a PVC
    fn resolve_persistent_volume_claim_identifier(&self, pvc: &PersistentVolumeClaim) -> String {
        disk_source(pvc.metadata.annotations.as_ref())
            .unwrap_or_default()
            .to_string()
    }

    /// KubeVirt template labels describing the guest
    async fn template_labels(&self, vm: &Ref) -> Result<BTreeMap<String, String>>;

    /// KubeVirt preference matching the guest
    async fn preference_name(&self, vm: &Ref) -> Result<String>;

    /// Environment for the provider's virt-v2v conversion pod
    async fn pod_environment(&self, vm: &Ref, source_secret: &str) -> Result<Vec<EnvVar>>;
}
