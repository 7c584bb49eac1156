use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, PersistentVolumeClaim};

use forklift_common::crd::{DataVolume, DataVolumeSource, HttpSource, Ref, Task, VirtualMachineSpec};
use forklift_common::kube_utils::bytes_quantity;
use forklift_common::{Error, Result};

use super::OvaLoader;
use crate::builder::{Builder, VolumeInputs};
use crate::context::PlanContext;
use crate::drafts::{disk_tasks, draft_data_volume, migratable_disks};
use crate::model::VmLoader;
use crate::providers::env;
use crate::vmspec::{build_vm_spec, template_labels, template_os, VmSpecOptions};

/// Builder for OVA appliances
///
/// Disks are downloaded over HTTP from the OVA provider server, which
/// extracts them from the appliance on the NFS share.
pub(crate) struct OvaBuilder {
    ctx: Arc<PlanContext>,
    loader: OvaLoader,
    server: String,
}

impl OvaBuilder {
    pub fn new(ctx: Arc<PlanContext>, loader: OvaLoader, server: String) -> Self {
        Self {
            ctx,
            loader,
            server,
        }
    }
}

/// Download URL of one appliance disk on the provider server
pub(super) fn disk_url(server: &str, vm: &str, disk: &str) -> String {
    format!("{}/vms/{}/disks/{}", server.trim_end_matches('/'), vm, disk)
}

#[async_trait]
impl Builder for OvaBuilder {
    async fn data_volumes(
        &self,
        vm: &Ref,
        _inputs: &VolumeInputs,
        template: &DataVolume,
    ) -> Result<Vec<DataVolume>> {
        let source = self.loader.load(vm).await?;
        migratable_disks(&self.ctx, &source)
            .iter()
            .map(|disk| {
                let dv_source = DataVolumeSource {
                    http: Some(HttpSource {
                        url: disk_url(&self.server, &source.id, &disk.disk.id),
                        ..Default::default()
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

    async fn template_labels(&self, vm: &Ref) -> Result<BTreeMap<String, String>> {
        let source = self.loader.load(vm).await?;
        Ok(template_labels(template_os(&source.guest_os)))
    }

    async fn preference_name(&self, vm: &Ref) -> Result<String> {
        Err(Error::provider_permanent(
            vm.to_string(),
            "ova",
            "OVA appliances carry no guest OS for a preference",
        ))
    }

    async fn pod_environment(&self, vm: &Ref, _source_secret: &str) -> Result<Vec<EnvVar>> {
        let (source, ova_path) = self.loader.load_with_path(vm).await?;
        Ok(vec![
            env("V2V_vmName", source.name),
            env("V2V_diskPath", ova_path),
            env("V2V_source", self.ctx.source_type().to_string()),
        ])
    }
}
