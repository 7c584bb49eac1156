use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, EnvVar, ISCSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, Secret, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

use forklift_common::crd::{
    DataVolume, DataVolumeSource, ImageioSource, OvirtVolumePopulator, OvirtVolumePopulatorSpec,
    Ref, Task, VirtualMachineSpec, VOLUME_MODE_BLOCK,
};
use forklift_common::kube_utils::{bytes_quantity, quantity_to_bytes};
use forklift_common::labels::{LABEL_MIGRATION, ANNOTATION_DISK_SOURCE};
use forklift_common::{Error, Result};

use super::model::OvirtLoader;
use crate::builder::{Builder, VolumeInputs};
use crate::cluster::{PopulatorCr, PopulatorKind};
use crate::context::PlanContext;
use crate::drafts::{disk_tasks, draft_data_volume, migratable_disks, populator_claim};
use crate::model::{SourceDisk, SourceVm, VmLoader};
use crate::providers::{ensure_populator, env, put_secret_data, secret_value};
use crate::vmspec::{build_vm_spec, preference_for, template_labels, template_os, VmSpecOptions};

const LABEL_VOLUME: &str = "volume";
const ACCESS_READ_WRITE_MANY: &str = "ReadWriteMany";
const CA_KEY: &str = "ca.pem";

/// Template OS for an oVirt `osType` such as `rhel_9x64` or `windows_2019x64`
fn guest_template_os(os_type: &str) -> Option<&'static str> {
    template_os(&os_type.replace('_', ""))
}

/// Builder for oVirt sources
///
/// Cold migrations to the local cluster fill disks with
/// `OvirtVolumePopulator`s; everything else goes through CDI's imageio
/// importer. Direct LUNs are attached as iSCSI PersistentVolumes.
pub(crate) struct OvirtBuilder {
    ctx: Arc<PlanContext>,
    loader: OvirtLoader,
}

impl OvirtBuilder {
    pub fn new(ctx: Arc<PlanContext>, loader: OvirtLoader) -> Self {
        Self { ctx, loader }
    }

    fn luns(vm: &SourceVm) -> impl Iterator<Item = &SourceDisk> {
        vm.disks.iter().filter(|d| d.lun.is_some())
    }

    fn lun_name(vm: &SourceVm, disk: &SourceDisk) -> String {
        let lun_id = disk.lun.as_ref().map(|l| l.lun_id.as_str()).unwrap_or(&disk.id);
        format!("{}-{}", vm.id, lun_id).to_ascii_lowercase()
    }

    fn lun_labels(&self, vm: &SourceVm, disk: &SourceDisk) -> BTreeMap<String, String> {
        let mut labels = self.ctx.owner_labels(&vm.reference()).to_map();
        if let Some(lun) = &disk.lun {
            labels.insert(LABEL_VOLUME.to_string(), lun.lun_id.clone());
        }
        labels
    }
}

#[async_trait]
impl Builder for OvirtBuilder {
    async fn data_volumes(
        &self,
        vm: &Ref,
        inputs: &VolumeInputs,
        template: &DataVolume,
    ) -> Result<Vec<DataVolume>> {
        let source = self.loader.load(vm).await?;
        let engine_url = &self.ctx.source.provider.spec.url;
        migratable_disks(&self.ctx, &source)
            .iter()
            .map(|disk| {
                let dv_source = DataVolumeSource {
                    imageio: Some(ImageioSource {
                        url: engine_url.clone(),
                        disk_id: disk.disk.id.clone(),
                        secret_ref: inputs.secret.clone().unwrap_or_default(),
                        cert_config_map: inputs.config_map.clone(),
                    }),
                    ..Default::default()
                };
                draft_data_volume(
                    &self.ctx,
                    template,
                    &source,
                    disk,
                    dv_source,
                    bytes_quantity(disk.disk.capacity_bytes),
                    &disk.disk.id,
                )
            })
            .collect()
    }

    async fn virtual_machine(
        &self,
        vm: &Ref,
        spec: &mut VirtualMachineSpec,
        pvcs: &[PersistentVolumeClaim],
        use_instance_type: bool,
        sort_by_libvirt: bool,
    ) -> Result<()> {
        let source = self.loader.load(vm).await?;
        build_vm_spec(
            &self.ctx,
            &source,
            spec,
            pvcs,
            VmSpecOptions {
                use_instance_type,
                sort_by_libvirt,
            },
            |pvc| self.resolve_persistent_volume_claim_identifier(pvc),
        )
    }

    async fn tasks(&self, vm: &Ref) -> Result<Vec<Task>> {
        let source = self.loader.load(vm).await?;
        Ok(disk_tasks(&migratable_disks(&self.ctx, &source)))
    }

    async fn secret(&self, _vm: &Ref, input: &Secret, output: &mut Secret) -> Result<()> {
        let user = secret_value(input, "user");
        let password = secret_value(input, "password");
        put_secret_data(
            output,
            [
                ("accessKeyId", user.clone()),
                ("secretKey", password.clone()),
                ("user", user),
                ("password", password),
                ("cacert", secret_value(input, "cacert")),
                ("insecureSkipVerify", secret_value(input, "insecureSkipVerify")),
            ],
        );
        Ok(())
    }

    async fn config_map(&self, _vm: &Ref, input: &Secret, output: &mut ConfigMap) -> Result<()> {
        if let Some(ca) = secret_value(input, "cacert") {
            output
                .data
                .get_or_insert_with(BTreeMap::new)
                .insert(CA_KEY.to_string(), ca);
        }
        Ok(())
    }

    async fn lun_persistent_volumes(&self, vm: &Ref) -> Result<Vec<PersistentVolume>> {
        let source = self.loader.load(vm).await?;
        let pvs = Self::luns(&source)
            .filter_map(|disk| {
                let lun = disk.lun.as_ref()?;
                let mut pv = PersistentVolume::default();
                pv.metadata.name = Some(Self::lun_name(&source, disk));
                pv.metadata.labels = Some(self.lun_labels(&source, disk));
                pv.spec = Some(PersistentVolumeSpec {
                    capacity: Some(BTreeMap::from([(
                        "storage".to_string(),
                        bytes_quantity(disk.capacity_bytes),
                    )])),
                    access_modes: Some(vec![ACCESS_READ_WRITE_MANY.to_string()]),
                    volume_mode: Some(VOLUME_MODE_BLOCK.to_string()),
                    persistent_volume_reclaim_policy: Some("Retain".to_string()),
                    iscsi: Some(ISCSIPersistentVolumeSource {
                        target_portal: lun.portal.clone(),
                        iqn: lun.target.clone(),
                        lun: lun.lun,
                        read_only: Some(false),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                Some(pv)
            })
            .collect();
        Ok(pvs)
    }

    async fn lun_persistent_volume_claims(&self, vm: &Ref) -> Result<Vec<PersistentVolumeClaim>> {
        let source = self.loader.load(vm).await?;
        let pvcs = Self::luns(&source)
            .map(|disk| {
                let name = Self::lun_name(&source, disk);
                let mut pvc = PersistentVolumeClaim::default();
                pvc.metadata.name = Some(name.clone());
                pvc.metadata.namespace = Some(self.ctx.target_namespace().to_string());
                pvc.metadata.labels = Some(self.lun_labels(&source, disk));
                pvc.metadata.annotations = Some(BTreeMap::from([(
                    ANNOTATION_DISK_SOURCE.to_string(),
                    disk.id.clone(),
                )]));
                pvc.spec = Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec![ACCESS_READ_WRITE_MANY.to_string()]),
                    volume_mode: Some(VOLUME_MODE_BLOCK.to_string()),
                    volume_name: Some(name),
                    storage_class_name: Some(String::new()),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            bytes_quantity(disk.capacity_bytes),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                pvc
            })
            .collect();
        Ok(pvcs)
    }

    async fn populator_volumes(
        &self,
        vm: &Ref,
        annotations: &BTreeMap<String, String>,
        secret_name: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let source = self.loader.load(vm).await?;
        let cluster = self.ctx.destination.cluster.as_ref();
        let namespace = self.ctx.target_namespace();

        let mut pvcs = Vec::new();
        for disk in migratable_disks(&self.ctx, &source) {
            let mut populator = OvirtVolumePopulator::new(
                &disk.disk.id,
                OvirtVolumePopulatorSpec {
                    engine_url: self.ctx.source.provider.spec.url.clone(),
                    engine_secret_name: secret_name.to_string(),
                    disk_id: disk.disk.id.clone(),
                    transfer_network: self.ctx.transfer_network(),
                },
            );
            populator.metadata.namespace = Some(namespace.to_string());
            populator.metadata.labels = Some(self.ctx.owner_labels(&source.reference()).to_map());
            ensure_populator(cluster, &PopulatorCr::Ovirt(populator)).await?;

            pvcs.push(populator_claim(
                &self.ctx,
                &source,
                &disk,
                bytes_quantity(disk.disk.capacity_bytes),
                annotations,
                PopulatorKind::Ovirt.kind(),
                &disk.disk.id,
            ));
        }
        Ok(pvcs)
    }

    async fn populator_transferred_bytes(&self, pvc: &PersistentVolumeClaim) -> Result<i64> {
        let spec = pvc.spec.as_ref();
        let Some(source) = spec.and_then(|s| s.data_source_ref.as_ref()) else {
            return Ok(0);
        };
        let requested = spec
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .cloned()
            .unwrap_or_else(|| Quantity("0".to_string()));
        let size = quantity_to_bytes(&requested)?;

        let namespace = pvc
            .metadata
            .namespace
            .as_deref()
            .unwrap_or(self.ctx.target_namespace());
        let selector = format!("{}={}", LABEL_MIGRATION, self.ctx.migration_uid());
        let populators = self
            .ctx
            .destination
            .cluster
            .list_populators(PopulatorKind::Ovirt, namespace, selector)
            .await?;
        let percent = populators
            .iter()
            .find(|p| p.name == source.name)
            .and_then(|p| p.status.percent())
            .unwrap_or(0.0);
        debug!(populator = %source.name, percent, "oVirt populator progress");
        Ok((size as f64 * percent / 100.0) as i64)
    }

    fn supports_volume_populators(&self) -> bool {
        !self.ctx.is_warm() && self.ctx.destination.provider.is_host()
    }

    async fn template_labels(&self, vm: &Ref) -> Result<BTreeMap<String, String>> {
        let raw = self.loader.vm(vm).await?;
        Ok(template_labels(guest_template_os(&raw.os_type)))
    }

    async fn preference_name(&self, vm: &Ref) -> Result<String> {
        let raw = self.loader.vm(vm).await?;
        guest_template_os(&raw.os_type)
            .and_then(preference_for)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::provider_permanent(
                    vm.to_string(),
                    "ovirt",
                    format!("no preference for OS type '{}'", raw.os_type),
                )
            })
    }

    async fn pod_environment(&self, vm: &Ref, _source_secret: &str) -> Result<Vec<EnvVar>> {
        let raw = self.loader.vm(vm).await?;
        Ok(vec![
            env("V2V_vmName", raw.name),
            env("V2V_source", self.ctx.source_type().to_string()),
        ])
    }
}
