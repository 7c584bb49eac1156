use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, PersistentVolumeClaim, Secret};
use tracing::{debug, info};

use forklift_common::crd::{
    DataVolume, OpenstackVolumePopulator, OpenstackVolumePopulatorSpec, Ref, Task,
    VirtualMachineSpec, MIB, VOLUME_MODE_BLOCK,
};
use forklift_common::kube_utils::bytes_quantity;
use forklift_common::labels::{
    ANNOTATION_DISK_SOURCE, ANNOTATION_REQUIRES_CONVERSION, ANNOTATION_SOURCE_FORMAT,
    LABEL_MIGRATION,
};
use forklift_common::{Error, Result};

use super::model::{disk_image_name, guest_os, OpenstackLoader, IMAGE_ACTIVE, PROPERTY_ORIGINAL_VOLUME};
use crate::builder::{Builder, VolumeInputs};
use crate::cluster::{PopulatorCr, PopulatorKind};
use crate::context::PlanContext;
use crate::drafts::{disk_tasks, migratable_disks, populator_claim};
use crate::model::VmLoader;
use crate::providers::{ensure_populator, put_secret_data, secret_value};
use crate::vmspec::{build_vm_spec, preference_for, template_labels, template_os, VmSpecOptions};

const FORMAT_QCOW2: &str = "qcow2";
/// Share of a filesystem volume lost to filesystem metadata
const FILESYSTEM_OVERHEAD: f64 = 0.1;

/// Secret keys the populator pod reads
const SECRET_KEYS: &[&str] = &[
    "authType",
    "username",
    "password",
    "userID",
    "token",
    "applicationCredentialID",
    "applicationCredentialName",
    "applicationCredentialSecret",
    "domainName",
    "projectName",
    "projectID",
    "regionName",
    "insecureSkipVerify",
    "cacert",
];

/// Bytes to request so a disk image fits on a filesystem volume, MiB aligned
fn with_filesystem_overhead(bytes: i64) -> i64 {
    let padded = (bytes as f64 / (1.0 - FILESYSTEM_OVERHEAD)).ceil() as i64;
    (padded + MIB - 1) / MIB * MIB
}

/// Builder for OpenStack sources
///
/// Every disk is first uploaded to Glance by the client's pre-transfer
/// actions; the builder then creates one `OpenstackVolumePopulator` per
/// image and a PVC that references it. There are no DataVolumes.
pub(crate) struct OpenstackBuilder {
    ctx: Arc<PlanContext>,
    loader: OpenstackLoader,
}

impl OpenstackBuilder {
    pub fn new(ctx: Arc<PlanContext>, loader: OpenstackLoader) -> Self {
        Self { ctx, loader }
    }

    async fn template_os(&self, vm: &Ref) -> Result<Option<&'static str>> {
        let raw = self.loader.vm(vm).await?;
        let properties = self.loader.guest_properties(&raw).await?;
        Ok(template_os(&guest_os(&properties)))
    }
}

#[async_trait]
impl Builder for OpenstackBuilder {
    async fn data_volumes(
        &self,
        _vm: &Ref,
        _inputs: &VolumeInputs,
        _template: &DataVolume,
    ) -> Result<Vec<DataVolume>> {
        Ok(Vec::new())
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
        put_secret_data(
            output,
            SECRET_KEYS.iter().map(|k| (*k, secret_value(input, k))),
        );
        Ok(())
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
            let image_name = disk_image_name(&self.ctx, &source, disk.disk);
            let Some(image) = self.loader.image_named(&image_name).await? else {
                info!(vm = %vm, image = %image_name, "image not in inventory yet");
                continue;
            };
            if image.status != IMAGE_ACTIVE {
                info!(vm = %vm, image = %image_name, status = %image.status, "image not ready yet");
                continue;
            }

            let mut populator = OpenstackVolumePopulator::new(
                &image.name,
                OpenstackVolumePopulatorSpec {
                    identity_url: self.ctx.source.provider.spec.url.clone(),
                    secret_name: secret_name.to_string(),
                    image_id: image.id.clone(),
                    transfer_network: self.ctx.transfer_network(),
                },
            );
            populator.metadata.namespace = Some(namespace.to_string());
            populator.metadata.labels = Some(self.ctx.owner_labels(&source.reference()).to_map());
            ensure_populator(cluster, &PopulatorCr::Openstack(populator)).await?;

            let block = disk.storage.volume_mode.as_deref() == Some(VOLUME_MODE_BLOCK);
            let size = if block {
                image.capacity()
            } else {
                with_filesystem_overhead(image.capacity())
            };
            let mut claim_annotations = annotations.clone();
            if image.disk_format == FORMAT_QCOW2 {
                claim_annotations.insert(ANNOTATION_REQUIRES_CONVERSION.to_string(), "true".to_string());
                claim_annotations.insert(ANNOTATION_SOURCE_FORMAT.to_string(), FORMAT_QCOW2.to_string());
            }
            let mut pvc = populator_claim(
                &self.ctx,
                &source,
                &disk,
                bytes_quantity(size),
                &claim_annotations,
                PopulatorKind::Openstack.kind(),
                &image.name,
            );
            pvc.metadata.name = Some(image.id.clone());
            pvc.metadata.generate_name = None;
            if let Some(volume) = image.property(PROPERTY_ORIGINAL_VOLUME) {
                debug!(image = %image.name, volume = %volume, "image comes from a volume");
                pvc.metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(ANNOTATION_DISK_SOURCE.to_string(), volume.to_string());
            }
            pvcs.push(pvc);
        }
        Ok(pvcs)
    }

    async fn populator_transferred_bytes(&self, pvc: &PersistentVolumeClaim) -> Result<i64> {
        let Some(source) = pvc.spec.as_ref().and_then(|s| s.data_source_ref.as_ref()) else {
            return Ok(0);
        };
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
            .list_populators(PopulatorKind::Openstack, namespace, selector)
            .await?;
        Ok(populators
            .iter()
            .find(|p| p.name == source.name)
            .and_then(|p| p.status.transferred_bytes())
            .unwrap_or(0))
    }

    fn supports_volume_populators(&self) -> bool {
        true
    }

    async fn template_labels(&self, vm: &Ref) -> Result<BTreeMap<String, String>> {
        Ok(template_labels(self.template_os(vm).await?))
    }

    async fn preference_name(&self, vm: &Ref) -> Result<String> {
        self.template_os(vm)
            .await?
            .and_then(preference_for)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::provider_permanent(
                    vm.to_string(),
                    "openstack",
                    "image metadata names no known operating system",
                )
            })
    }

    async fn pod_environment(&self, _vm: &Ref, _source_secret: &str) -> Result<Vec<EnvVar>> {
        Ok(Vec::new())
    }
}
