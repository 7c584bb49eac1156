use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, EnvVar, PersistentVolumeClaim, Secret};

use forklift_common::crd::{DataVolume, DataVolumeSource, HttpSource, Ref, Task, VirtualMachineSpec};
use forklift_common::kube_utils::bytes_quantity;
use forklift_common::{Error, Result};

use super::model::{OcpLoader, PROVIDER, TOKEN_HEADER};
use crate::builder::{Builder, VolumeInputs};
use crate::context::PlanContext;
use crate::drafts::{disk_tasks, draft_data_volume, migratable_disks};
use crate::model::VmLoader;
use crate::providers::{put_secret_data, secret_value};
use crate::vmspec::{build_vm_spec, template_labels, VmSpecOptions};

const CA_KEY: &str = "ca.pem";

/// Builder for KubeVirt sources
///
/// Disks are pulled over HTTP from the source VM's `VirtualMachineExport`,
/// authenticated by the export token sent as an extra header.
pub(crate) struct OcpBuilder {
    ctx: Arc<PlanContext>,
    loader: OcpLoader,
}

impl OcpBuilder {
    pub fn new(ctx: Arc<PlanContext>, loader: OcpLoader) -> Self {
        Self { ctx, loader }
    }
}

#[async_trait]
impl Builder for OcpBuilder {
    async fn data_volumes(
        &self,
        vm: &Ref,
        inputs: &VolumeInputs,
        template: &DataVolume,
    ) -> Result<Vec<DataVolume>> {
        let export = self.loader.ready_export(vm).await?;
        let link = export.link().ok_or_else(|| {
            Error::provider_for(vm.to_string(), PROVIDER, "export has no links yet")
        })?;
        let source = self.loader.load(vm).await?;

        let mut dvs = Vec::new();
        for disk in migratable_disks(&self.ctx, &source) {
            let claim = disk.disk.id.rsplit('/').next().unwrap_or(&disk.disk.id);
            let url = link.volume_url(claim).ok_or_else(|| {
                Error::provider_permanent(
                    vm.to_string(),
                    PROVIDER,
                    format!("export offers no importable format for {}", claim),
                )
            })?;
            let dv_source = DataVolumeSource {
                http: Some(HttpSource {
                    url: url.to_string(),
                    cert_config_map: inputs.config_map.clone(),
                    secret_extra_headers: inputs.secret.iter().cloned().collect(),
                    ..Default::default()
                }),
                ..Default::default()
            };
            dvs.push(draft_data_volume(
                &self.ctx,
                template,
                &source,
                &disk,
                dv_source,
                bytes_quantity(disk.disk.capacity_bytes),
                &disk.disk.id,
            )?);
        }
        Ok(dvs)
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

    /// Turn the export token into an extra-header entry for CDI
    async fn secret(&self, vm: &Ref, _input: &Secret, output: &mut Secret) -> Result<()> {
        let export = self.loader.ready_export(vm).await?;
        let name = export.token_secret().ok_or_else(|| {
            Error::provider_for(vm.to_string(), PROVIDER, "export has no token secret yet")
        })?;
        let token = self
            .loader
            .cluster()
            .get_secret(&vm.namespace, name)
            .await?
            .and_then(|s| secret_value(&s, "token"))
            .ok_or_else(|| {
                Error::provider_for(
                    vm.to_string(),
                    PROVIDER,
                    format!("export token secret {} has no token", name),
                )
            })?;
        put_secret_data(output, [("token", Some(format!("{}:{}", TOKEN_HEADER, token)))]);
        Ok(())
    }

    async fn config_map(&self, vm: &Ref, _input: &Secret, output: &mut ConfigMap) -> Result<()> {
        let export = self.loader.ready_export(vm).await?;
        if let Some(link) = export.link().filter(|l| !l.cert.is_empty()) {
            output
                .data
                .get_or_insert_with(BTreeMap::new)
                .insert(CA_KEY.to_string(), link.cert.clone());
        }
        Ok(())
    }

    async fn template_labels(&self, _vm: &Ref) -> Result<BTreeMap<String, String>> {
        Ok(template_labels(None))
    }

    /// The preference the source VM already uses
    async fn preference_name(&self, vm: &Ref) -> Result<String> {
        let object = self.loader.virtual_machine(vm).await?;
        object
            .spec
            .preference
            .map(|p| p.name)
            .ok_or_else(|| {
                Error::provider_permanent(vm.to_string(), PROVIDER, "source VM has no preference")
            })
    }

    async fn pod_environment(&self, _vm: &Ref, _source_secret: &str) -> Result<Vec<EnvVar>> {
        Ok(Vec::new())
    }
}
