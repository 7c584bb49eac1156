use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::{debug, info};

use forklift_common::crd::{DataVolume, Ref, Task, VirtualMachineSpec};
use forklift_common::kube_utils::{merge_into, quantity_to_bytes};
use forklift_common::labels::ANNOTATION_DATAVOLUME_ROLE;
use forklift_common::{Error, Result};

use super::loader::SchemaLoader;
use super::service::{BuildSpecRequest, DataVolumeSourceRequest, DynamicService, PlanIdentity};
use crate::builder::{Builder, VolumeInputs};
use crate::context::PlanContext;
use crate::drafts::{disk_tasks, draft_data_volume, migratable_disks};
use crate::model::VmLoader;
use crate::providers::env;
use crate::vmspec::{build_vm_spec, template_labels, template_os, VmSpecOptions};

const ROLE_INPUT: &str = "input";
const ROLE_OUTPUT: &str = "output";

/// Builder for dynamic providers
///
/// Disk sources and, optionally, the VM spec come from the provider server;
/// everything else is read through the schema.
pub struct DynamicBuilder {
    ctx: Arc<PlanContext>,
    loader: SchemaLoader,
    service: Arc<dyn DynamicService>,
}

impl DynamicBuilder {
    pub(super) fn new(
        ctx: Arc<PlanContext>,
        loader: SchemaLoader,
        service: Arc<dyn DynamicService>,
    ) -> Self {
        Self {
            ctx,
            loader,
            service,
        }
    }

    /// Input DataVolumes are converted into blank outputs by the controller
    fn mark_role(&self, dv: &mut DataVolume) {
        let role = if self.ctx.source.provider.features().requires_conversion {
            if let Some(name) = dv.metadata.name.as_mut() {
                name.push_str("-input");
            }
            if let Some(prefix) = dv.metadata.generate_name.as_mut() {
                prefix.push_str("input-");
            }
            ROLE_INPUT
        } else {
            ROLE_OUTPUT
        };
        merge_into(
            &mut dv.metadata.annotations,
            [(ANNOTATION_DATAVOLUME_ROLE.to_string(), role.to_string())],
        );
    }

    async fn remote_spec(
        &self,
        vm: &Ref,
        vm_id: &str,
        spec: &mut VirtualMachineSpec,
        pvcs: &[PersistentVolumeClaim],
    ) -> Result<()> {
        let request = BuildSpecRequest {
            plan: PlanIdentity {
                name: self.ctx.plan_name().to_string(),
                namespace: self.ctx.plan_namespace().to_string(),
            },
        };
        let response = self.service.build_spec(vm_id, &request).await?;
        info!(
            vm = %vm,
            os = response.metadata.detected_os.as_deref().unwrap_or("unknown"),
            guest_tools = response.metadata.guest_tools_detected,
            "using provider-built VM spec"
        );
        *spec = response.virtual_machine.spec;

        // The provider names volumes by disk ID; point them at our PVCs.
        for volume in &mut spec.template.spec.volumes {
            let Some(claim) = volume.persistent_volume_claim.as_mut() else {
                continue;
            };
            if let Some(pvc) = pvcs
                .iter()
                .find(|p| self.resolve_persistent_volume_claim_identifier(p) == claim.claim_name)
            {
                claim.claim_name = pvc.metadata.name.clone().unwrap_or_default();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Builder for DynamicBuilder {
    async fn data_volumes(
        &self,
        vm: &Ref,
        _inputs: &VolumeInputs,
        template: &DataVolume,
    ) -> Result<Vec<DataVolume>> {
        let source = self.loader.load(vm).await?;
        let mut dvs = Vec::new();
        for disk in migratable_disks(&self.ctx, &source) {
            let request = DataVolumeSourceRequest {
                target_storage_class: disk.storage.storage_class.clone(),
                target_namespace: self.ctx.target_namespace().to_string(),
            };
            let response = self
                .service
                .datavolume_source(&source.id, &disk.disk.id, &request)
                .await?;
            let size = Quantity(response.size);
            quantity_to_bytes(&size).map_err(|e| {
                Error::validation_for(
                    source.name.clone(),
                    format!("disk {}: invalid size from provider: {}", disk.disk.id, e),
                )
            })?;
            debug!(vm = %vm, disk = %disk.disk.id, size = %size.0, "provider disk source");

            let mut dv = draft_data_volume(
                &self.ctx,
                template,
                &source,
                &disk,
                response.source,
                size,
                &disk.disk.id,
            )?;
            self.mark_role(&mut dv);
            dvs.push(dv);
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
        if self.ctx.source.provider.features().supports_custom_builder {
            return self.remote_spec(vm, &source.id, spec, pvcs).await;
        }
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
            "dynamic",
            "preferences are not used by dynamic providers",
        ))
    }

    async fn pod_environment(&self, vm: &Ref, _source_secret: &str) -> Result<Vec<EnvVar>> {
        let object = self.loader.object(vm).await?;
        let source = self.loader.source_vm(&object)?;
        let ova_path = self.loader.string_field(&object, "ovaPath").unwrap_or_default();
        let disk_path = if ova_path.ends_with(".ova") {
            ova_path
        } else {
            ova_path.trim_end_matches('/').to_string()
        };

        let mut vars = vec![
            env("V2V_vmName", source.name.clone()),
            env("V2V_diskPath", disk_path),
            env("V2V_source", self.ctx.source_type().to_string()),
        ];
        if self.ctx.source.provider.features().requires_conversion {
            let input_type = self.service.v2v_input_type(&source.id).await?;
            vars.push(env("V2V_inputType", input_type));
        }
        Ok(vars)
    }
}
