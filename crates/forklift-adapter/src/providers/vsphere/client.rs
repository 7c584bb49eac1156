use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use forklift_common::crd::{DataVolume, PowerState, Precopy, Ref};
use forklift_common::labels::disk_source;
use forklift_common::{Error, Result};

use super::api::{TaskState, VsphereApi};
use super::model::{base_volume, VsphereLoader};
use crate::client::{apply_checkpoints, SnapshotRef, SourceClient};
use crate::context::PlanContext;

/// Drives vSphere VMs through the VI/JSON API
pub(crate) struct VsphereClient {
    ctx: Arc<PlanContext>,
    loader: VsphereLoader,
    api: Arc<dyn VsphereApi>,
}

impl VsphereClient {
    pub fn new(ctx: Arc<PlanContext>, loader: VsphereLoader, api: Arc<dyn VsphereApi>) -> Self {
        Self { ctx, loader, api }
    }

    async fn moref(&self, vm: &Ref) -> Result<String> {
        let raw = self.loader.vm(vm).await?;
        self.api.find_vm(&raw.uuid).await
    }

    fn task_failed(vm: &Ref, message: String) -> Error {
        Error::provider_for(vm.to_string(), "vsphere", message)
    }
}

#[async_trait]
impl SourceClient for VsphereClient {
    async fn power_state(&self, vm: &Ref) -> Result<PowerState> {
        let moref = self.moref(vm).await?;
        self.api.power_state(&moref).await
    }

    async fn power_on(&self, vm: &Ref) -> Result<()> {
        let moref = self.moref(vm).await?;
        let task = self.api.power_on(&moref).await?;
        info!(vm = %vm, task = %task, "powering on source VM");
        Ok(())
    }

    async fn power_off(&self, vm: &Ref) -> Result<()> {
        let moref = self.moref(vm).await?;
        let task = self.api.power_off(&moref).await?;
        info!(vm = %vm, task = %task, "powering off source VM");
        Ok(())
    }

    async fn create_snapshot(&self, vm: &Ref) -> Result<SnapshotRef> {
        let moref = self.moref(vm).await?;
        let task = self.api.create_snapshot(&moref).await?;
        info!(vm = %vm, task = %task, "creating precopy snapshot");
        Ok(SnapshotRef {
            id: String::new(),
            task_id: Some(task),
        })
    }

    async fn check_snapshot_ready(&self, vm: &Ref, precopy: &Precopy) -> Result<(bool, String)> {
        let Some(task) = precopy.create_task_id.as_deref() else {
            return Ok((!precopy.snapshot.is_empty(), precopy.snapshot.clone()));
        };
        match self.api.task_state(task).await? {
            TaskState::Running => Ok((false, String::new())),
            TaskState::Success(Some(snapshot)) => Ok((true, snapshot)),
            TaskState::Success(None) => Err(Self::task_failed(
                vm,
                format!("snapshot task {} returned no snapshot", task),
            )),
            TaskState::Error(message) => Err(Self::task_failed(vm, message)),
        }
    }

    async fn remove_snapshot(&self, vm: &Ref, snapshot: &str) -> Result<Option<String>> {
        let task = self.api.remove_snapshot(snapshot).await?;
        debug!(vm = %vm, snapshot = %snapshot, task = %task, "removing snapshot");
        Ok(Some(task))
    }

    async fn check_snapshot_remove(&self, vm: &Ref, precopy: &Precopy) -> Result<bool> {
        let Some(task) = precopy.remove_task_id.as_deref() else {
            return Ok(true);
        };
        match self.api.task_state(task).await? {
            TaskState::Running => Ok(false),
            TaskState::Success(_) => Ok(true),
            TaskState::Error(message) => Err(Self::task_failed(vm, message)),
        }
    }

    async fn get_snapshot_deltas(
        &self,
        _vm: &Ref,
        snapshot: &str,
    ) -> Result<BTreeMap<String, String>> {
        Ok(self
            .api
            .change_ids(snapshot)
            .await?
            .into_iter()
            .map(|(file, change_id)| (base_volume(&file, true), change_id))
            .collect())
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
            |dv| base_volume(disk_source(dv.metadata.annotations.as_ref()).unwrap_or_default(), true),
        )
        .await
    }

    async fn close(&self) {
        self.api.logout().await;
    }
}
