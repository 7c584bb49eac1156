use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, PersistentVolumeClaim, Secret};
use url::Url;

use forklift_common::crd::{
    DataVolume, DataVolumeSource, Ref, Task, VddkSource, VirtualMachineSpec,
    SETTING_SDK_ENDPOINT, SETTING_USE_V2V_COPY, SETTING_VDDK_INIT_IMAGE,
};
use forklift_common::kube_utils::bytes_quantity;
use forklift_common::labels::disk_source;
use forklift_common::{Error, Result};

use super::model::{base_volume, Host, VsphereLoader};
use crate::builder::{Builder, VolumeInputs};
use crate::context::PlanContext;
use crate::drafts::{disk_tasks, draft_data_volume, migratable_disks};
use crate::model::VmLoader;
use crate::providers::{env, put_secret_data, secret_value};
use crate::vmspec::{build_vm_spec, preference_for, template_labels, template_os, VmSpecOptions};

const SDK_ESXI: &str = "esxi";

/// Builder for vSphere sources
///
/// Disks are imported by CDI's VDDK importer unless the provider asks for
/// virt-v2v to do the copy, in which case the DataVolumes start blank.
pub(crate) struct VsphereBuilder {
    ctx: Arc<PlanContext>,
    loader: VsphereLoader,
}

impl VsphereBuilder {
    pub fn new(ctx: Arc<PlanContext>, loader: VsphereLoader) -> Self {
        Self { ctx, loader }
    }

    fn v2v_copy(&self) -> bool {
        self.ctx
            .source
            .provider
            .setting(SETTING_USE_V2V_COPY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    async fn host(&self, id: Option<&str>) -> Result<Option<Host>> {
        match id {
            Some(id) => Ok(Some(self.loader.host(id).await?)),
            None => Ok(None),
        }
    }

    /// libvirt connection URI virt-v2v reads the guest through
    fn libvirt_url(&self, host: Option<&Host>) -> Result<String> {
        let provider = &self.ctx.source.provider;
        let sdk = Url::parse(&provider.spec.url)
            .map_err(|e| Error::validation_for_field("provider", "spec.url", e.to_string()))?;
        let user = self.ctx.source.credential("user").unwrap_or_default();

        let esxi = provider
            .setting(SETTING_SDK_ENDPOINT)
            .is_some_and(|v| v.eq_ignore_ascii_case(SDK_ESXI));
        let uri = match (esxi, host) {
            (true, Some(host)) => format!("esx://{}", host.name),
            (true, None) => format!("esx://{}", sdk.host_str().unwrap_or_default()),
            (false, host) => format!(
                "vpx://{}{}",
                sdk.host_str().unwrap_or_default(),
                host.map(|h| h.path.as_str()).unwrap_or_default()
            ),
        };
        let mut url = Url::parse(&uri).map_err(|e| {
            Error::validation_for_field("provider", "spec.url", format!("{}: {}", uri, e))
        })?;
        if !user.is_empty() {
            url.set_username(&user).map_err(|_| {
                Error::validation_for_field("provider", "spec.url", "URL cannot carry a user")
            })?;
        }
        url.set_query(Some("no_verify=1"));
        Ok(url.to_string())
    }
}

#[async_trait]
impl Builder for VsphereBuilder {
    async fn data_volumes(
        &self,
        vm: &Ref,
        inputs: &VolumeInputs,
        template: &DataVolume,
    ) -> Result<Vec<DataVolume>> {
        let raw = self.loader.vm(vm).await?;
        let source = self.loader.source_vm(&raw);
        let host = self.host(source.host.as_deref()).await?;
        let copy_by_v2v = self.v2v_copy();
        let provider = &self.ctx.source.provider;

        let mut dvs = Vec::new();
        for disk in migratable_disks(&self.ctx, &source) {
            let dv_source = if copy_by_v2v {
                DataVolumeSource::blank()
            } else {
                DataVolumeSource {
                    vddk: Some(VddkSource {
                        backing_file: disk.disk.id.clone(),
                        uuid: source.uuid.clone(),
                        url: provider.spec.url.clone(),
                        secret_ref: inputs.secret.clone().unwrap_or_default(),
                        thumbprint: host
                            .as_ref()
                            .map(|h| h.thumbprint.clone())
                            .filter(|t| !t.is_empty()),
                        init_image_url: provider
                            .setting(SETTING_VDDK_INIT_IMAGE)
                            .map(str::to_string),
                    }),
                    ..Default::default()
                }
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

    async fn secret(&self, vm: &Ref, input: &Secret, output: &mut Secret) -> Result<()> {
        let raw = self.loader.vm(vm).await?;
        let host = self
            .host((!raw.host.is_empty()).then_some(raw.host.as_str()))
            .await?;
        put_secret_data(
            output,
            [
                ("accessKeyId", secret_value(input, "user")),
                ("secretKey", secret_value(input, "password")),
                ("cacert", secret_value(input, "cacert")),
                (
                    "thumbprint",
                    host.map(|h| h.thumbprint).filter(|t| !t.is_empty()),
                ),
            ],
        );
        Ok(())
    }

    fn resolve_data_volume_identifier(&self, dv: &DataVolume) -> String {
        base_volume(
            disk_source(dv.metadata.annotations.as_ref()).unwrap_or_default(),
            self.ctx.is_warm(),
        )
    }

    fn resolve_persistent_volume_claim_identifier(&self, pvc: &PersistentVolumeClaim) -> String {
        base_volume(
            disk_source(pvc.metadata.annotations.as_ref()).unwrap_or_default(),
            self.ctx.is_warm(),
        )
    }

    async fn template_labels(&self, vm: &Ref) -> Result<BTreeMap<String, String>> {
        let raw = self.loader.vm(vm).await?;
        Ok(template_labels(template_os(&raw.guest_id)))
    }

    async fn preference_name(&self, vm: &Ref) -> Result<String> {
        let raw = self.loader.vm(vm).await?;
        template_os(&raw.guest_id)
            .and_then(preference_for)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::provider_permanent(
                    vm.to_string(),
                    "vsphere",
                    format!("no preference for guest '{}'", raw.guest_id),
                )
            })
    }

    async fn pod_environment(&self, vm: &Ref, source_secret: &str) -> Result<Vec<EnvVar>> {
        let raw = self.loader.vm(vm).await?;
        let host = self
            .host((!raw.host.is_empty()).then_some(raw.host.as_str()))
            .await?;

        let mut vars = vec![
            env("V2V_vmName", raw.name.clone()),
            env("V2V_source", "vSphere"),
            env("V2V_libvirtURL", self.libvirt_url(host.as_ref())?),
            env("V2V_secretName", source_secret),
        ];
        if let Some(host) = host.filter(|h| !h.thumbprint.is_empty()) {
            vars.push(env("V2V_fingerprint", host.thumbprint));
        }
        if self.ctx.plan.spec.preserve_static_ips {
            let ips = raw.static_ips();
            if !ips.is_empty() {
                vars.push(env("V2V_preserveStaticIPs", "true"));
                vars.push(env("V2V_staticIPs", ips.join("_")));
            }
        }
        Ok(vars)
    }
}
