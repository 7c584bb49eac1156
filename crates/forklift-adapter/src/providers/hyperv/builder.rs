use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, PersistentVolumeClaim};

use forklift_common::crd::{DataVolume, DataVolumeSource, Ref, Task, VirtualMachineSpec};
use forklift_common::kube_utils::bytes_quantity;
use forklift_common::{Error, Result};

use crate::builder::{Builder, VolumeInputs};
use crate::context::PlanContext;
use crate::drafts::{disk_tasks, draft_data_volume, migratable_disks};
use crate::model::{FirmwareKind, VmLoader};
use crate::providers::dynamic::SchemaLoader;
use crate::providers::env;
use crate::vmspec::{build_vm_spec, template_labels, VmSpecOptions};

/// Builder for Hyper-V sources
///
/// virt-v2v reads the disks from the host's SMB share and writes them into
/// blank DataVolumes.
pub(crate) struct HypervBuilder {
    ctx: Arc<PlanContext>,
    loader: SchemaLoader,
}

impl HypervBuilder {
    pub fn new(ctx: Arc<PlanContext>, loader: SchemaLoader) -> Self {
        Self { ctx, loader }
    }
}

#[async_trait]
impl Builder for HypervBuilder {
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
                draft_data_volume(
                    &self.ctx,
                    template,
                    &source,
                    disk,
                    DataVolumeSource::blank(),
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

    async fn template_labels(&self, _vm: &Ref) -> Result<BTreeMap<String, String>> {
        Ok(template_labels(None))
    }

    async fn preference_name(&self, vm: &Ref) -> Result<String> {
        Err(Error::provider_permanent(
            vm.to_string(),
            "hyperv",
            "preferences are not used for Hyper-V",
        ))
    }

    async fn pod_environment(&self, vm: &Ref, _source_secret: &str) -> Result<Vec<EnvVar>> {
        let source = self.loader.load(vm).await?;
        let disk_paths: Vec<&str> = source
            .disks
            .iter()
            .map(|d| d.file.as_str())
            .filter(|p| !p.is_empty())
            .collect();

        let mut vars = vec![
            env("V2V_vmName", source.name.clone()),
            env("V2V_source", self.ctx.source_type().to_string()),
            env("V2V_diskPath", disk_paths.join(",")),
        ];
        if source.firmware == FirmwareKind::Efi {
            vars.push(env("V2V_firmware", "uefi"));
        }
        Ok(vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::context::testing::context;
    use crate::providers::hyperv::{fixtures, hyperv_schema};
    use forklift_common::crd::{DataVolumeSpec, ProviderType};

    fn builder() -> HypervBuilder {
        let ctx = context(
            ProviderType::HyperV,
            None,
            fixtures::inventory(),
            MockClusterClient::new(),
        );
        let loader = SchemaLoader::new(hyperv_schema(), ctx.source.inventory.clone());
        HypervBuilder::new(Arc::new(ctx), loader)
    }

    // ==========================================================================
    // Story Tests: Converting from the SMB Share
    // ==========================================================================

    /// Story: disks land in blank volumes and virt-v2v is pointed at their
    /// paths on the share
    #[tokio::test]
    async fn story_blank_volumes_and_share_paths() {
        let b = builder();
        let vm = Ref::with_id("vm-1");
        let mut template = DataVolume::new("", DataVolumeSpec::default());
        template.metadata.generate_name = Some("dc-01-".to_string());

        let dvs = b
            .data_volumes(&vm, &VolumeInputs::default(), &template)
            .await
            .unwrap();
        assert_eq!(dvs.len(), 2);
        assert!(dvs
            .iter()
            .all(|dv| dv.spec.source.as_ref().unwrap().blank.is_some()));

        let vars = b.pod_environment(&vm, "").await.unwrap();
        let value = |name: &str| {
            vars.iter()
                .find(|v| v.name == name)
                .and_then(|v| v.value.clone())
        };
        assert_eq!(value("V2V_source").as_deref(), Some("hyperv"));
        assert_eq!(
            value("V2V_diskPath").as_deref(),
            Some(r"\\hv01\vms\dc-01\os.vhdx,\\hv01\vms\dc-01\data.vhdx")
        );
        assert_eq!(value("V2V_firmware").as_deref(), Some("uefi"));
    }

    #[tokio::test]
    async fn tasks_follow_disk_capacity() {
        let tasks = builder().tasks(&Ref::with_id("vm-1")).await.unwrap();
        let totals: Vec<i64> = tasks.iter().map(|t| t.total).collect();
        assert_eq!(totals, vec![40 * 1024, 10 * 1024]);
    }
}
