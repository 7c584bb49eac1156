use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use forklift_common::crd::{PowerState, Ref, VmStatus, GLANCE_SOURCE};
use forklift_common::{Error, Result};

use super::api::OpenstackApi;
use super::model::{disk_image_name, OpenstackLoader, IMAGE_ACTIVE};
use crate::client::SourceClient;
use crate::context::PlanContext;
use crate::drafts::migratable_disks;
use crate::model::VmLoader;

const IMAGE_FAILED: &[&str] = &["killed", "deleted", "pending_delete"];

/// Drives OpenStack servers through Nova, Cinder and Glance
pub(crate) struct OpenstackClient {
    ctx: Arc<PlanContext>,
    loader: OpenstackLoader,
    api: Arc<dyn OpenstackApi>,
}

impl OpenstackClient {
    pub fn new(ctx: Arc<PlanContext>, loader: OpenstackLoader, api: Arc<dyn OpenstackApi>) -> Self {
        Self { ctx, loader, api }
    }

    async fn server_id(&self, vm: &Ref) -> Result<String> {
        if !vm.id.is_empty() {
            return Ok(vm.id.clone());
        }
        Ok(self.loader.vm(vm).await?.id)
    }

    /// Glance images the VM's disks are transferred from
    async fn image_names(&self, vm: &Ref) -> Result<Vec<(String, String, bool)>> {
        let source = self.loader.load(vm).await?;
        Ok(migratable_disks(&self.ctx, &source)
            .iter()
            .map(|d| {
                (
                    d.disk.id.clone(),
                    disk_image_name(&self.ctx, &source, d.disk),
                    d.disk.storage.id == GLANCE_SOURCE,
                )
            })
            .collect())
    }
}

#[async_trait]
impl SourceClient for OpenstackClient {
    async fn power_state(&self, vm: &Ref) -> Result<PowerState> {
        let id = self.server_id(vm).await?;
        self.api.server_status(&id).await
    }

    async fn power_on(&self, vm: &Ref) -> Result<()> {
        let id = self.server_id(vm).await?;
        if self.api.server_status(&id).await? != PowerState::Off {
            return Ok(());
        }
        info!(vm = %vm, "starting source server");
        self.api.start(&id).await
    }

    async fn power_off(&self, vm: &Ref) -> Result<()> {
        let id = self.server_id(vm).await?;
        if self.api.server_status(&id).await? == PowerState::Off {
            return Ok(());
        }
        info!(vm = %vm, "stopping source server");
        self.api.stop(&id).await
    }

    /// Upload every disk to Glance; ready once all images are active
    async fn pre_transfer_actions(&self, vm: &Ref) -> Result<bool> {
        let server = self.server_id(vm).await?;
        let mut ready = true;
        for (disk, image_name, from_server) in self.image_names(vm).await? {
            match self.api.find_image(&image_name).await? {
                None => {
                    ready = false;
                    if from_server {
                        info!(vm = %vm, image = %image_name, "snapshotting server to image");
                        self.api.create_server_image(&server, &image_name).await?;
                    } else {
                        info!(vm = %vm, volume = %disk, image = %image_name, "uploading volume to image");
                        self.api.upload_volume_image(&disk, &image_name).await?;
                    }
                }
                Some(image) if image.status == IMAGE_ACTIVE => {}
                Some(image) if IMAGE_FAILED.contains(&image.status.as_str()) => {
                    return Err(Error::provider_permanent(
                        vm.to_string(),
                        "openstack",
                        format!("image {} is {}", image_name, image.status),
                    ));
                }
                Some(_) => ready = false,
            }
        }
        Ok(ready)
    }

    /// Delete the transfer images; failures are logged, not returned
    async fn finalize(&self, vms: &[VmStatus], plan_name: &str) {
        for status in vms {
            let names = match self.image_names(&status.vm_ref).await {
                Ok(names) => names,
                Err(e) => {
                    warn!(plan = %plan_name, vm = %status.vm_ref, error = %e, "cannot list transfer images");
                    continue;
                }
            };
            for (_, image_name, _) in names {
                match self.api.find_image(&image_name).await {
                    Ok(Some(image)) => {
                        if let Err(e) = self.api.delete_image(&image.id).await {
                            warn!(plan = %plan_name, image = %image_name, error = %e, "failed to delete image");
                        } else {
                            info!(plan = %plan_name, image = %image_name, "deleted transfer image");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(plan = %plan_name, image = %image_name, error = %e, "failed to look up image")
                    }
                }
            }
        }
    }
}
