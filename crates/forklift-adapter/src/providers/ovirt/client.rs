use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use forklift_common::crd::{DataVolume, PowerState, Precopy, Ref};
use forklift_common::labels::disk_source;
use forklift_common::{Error, Result};

use super::api::OvirtApi;
use super::model::OvirtLoader;
use crate::client::{apply_checkpoints, SnapshotRef, SourceClient};
use crate::context::PlanContext;

const SNAPSHOT_OK: &str = "ok";

/// Drives oVirt VMs through the engine API
pub(crate) struct OvirtClient {
    ctx: Arc<PlanContext>,
    loader: OvirtLoader,
    api: Arc<dyn OvirtApi>,
}

impl OvirtClient {
    pub fn new(ctx: Arc<PlanContext>, loader: OvirtLoader, api: Arc<dyn OvirtApi>) -> Self {
        Self { ctx, loader, api }
    }

    async fn vm_id(&self, vm: &Ref) -> Result<String> {
        if !vm.id.is_empty() {
            return Ok(vm.id.clone());
        }
        Ok(self.loader.vm(vm).await?.id)
    }
}

#[async_trait]
impl SourceClient for OvirtClient {
    async fn power_state(&self, vm: &Ref) -> Result<PowerState> {
        let id = self.vm_id(vm).await?;
        self.api.vm_status(&id).await
    }

    async fn power_on(&self, vm: &Ref) -> Result<()> {
        let id = self.vm_id(vm).await?;
        info!(vm = %vm, "starting source VM");
        self.api.start(&id).await
    }

    async fn power_off(&self, vm: &Ref) -> Result<()> {
        let id = self.vm_id(vm).await?;
        info!(vm = %vm, "stopping source VM");
        self.api.stop(&id).await
    }

    async fn create_snapshot(&self, vm: &Ref) -> Result<SnapshotRef> {
        let id = self.vm_id(vm).await?;
        let snapshot = self.api.create_snapshot(&id).await?;
        info!(vm = %vm, snapshot = %snapshot, "creating precopy snapshot");
        Ok(SnapshotRef {
            id: snapshot,
            task_id: None,
        })
    }

    async fn check_snapshot_ready(&self, vm: &Ref, precopy: &Precopy) -> Result<(bool, String)> {
        let id = self.vm_id(vm).await?;
        match self.api.snapshot_status(&id, &precopy.snapshot).await? {
            Some(status) if status.eq_ignore_ascii_case(SNAPSHOT_OK) => {
                Ok((true, precopy.snapshot.clone()))
            }
            Some(status) => {
                debug!(vm = %vm, snapshot = %precopy.snapshot, status = %status, "snapshot not ready");
                Ok((false, precopy.snapshot.clone()))
            }
            None => Err(Error::provider_for(
                vm.to_string(),
                "ovirt",
                format!("snapshot {} disappeared", precopy.snapshot),
            )),
        }
    }

    async fn remove_snapshot(&self, vm: &Ref, snapshot: &str) -> Result<Option<String>> {
        let id = self.vm_id(vm).await?;
        debug!(vm = %vm, snapshot = %snapshot, "removing snapshot");
        self.api.remove_snapshot(&id, snapshot).await?;
        Ok(None)
    }

    async fn check_snapshot_remove(&self, vm: &Ref, precopy: &Precopy) -> Result<bool> {
        let id = self.vm_id(vm).await?;
        Ok(self
            .api
            .snapshot_status(&id, &precopy.snapshot)
            .await?
            .is_none())
    }

    async fn get_snapshot_deltas(
        &self,
        vm: &Ref,
        snapshot: &str,
    ) -> Result<BTreeMap<String, String>> {
        let id = self.vm_id(vm).await?;
        self.api.snapshot_disks(&id, snapshot).await
    }

    async fn set_checkpoints(
        &self,
        _vm: &Ref,
        precopies: &[Precopy],
        data_volumes: &[DataVolume],
        final_checkpoint: bool,
    ) -> Result<()> {
        apply_checkpoints(
            self.ctx.destination.cluster.as_ref(),
            data_volumes,
            precopies,
            final_checkpoint,
            |dv| {
                disk_source(dv.metadata.annotations.as_ref())
                    .unwrap_or_default()
                    .to_string()
            },
        )
        .await
    }
}
