//! The SourceClient collaborator
//!
//! A SourceClient drives the source VM: power, warm-migration snapshots and
//! the checkpoints handed to the DataVolume importers. Cold-only providers
//! implement power and pre-transfer; the snapshot operations default to
//! benign zero values.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::{
    DataVolume, DataVolumeCheckpoint, PowerState, Precopy, Ref, VmStatus,
};
use forklift_common::Result;

use crate::cluster::ClusterClient;

/// A snapshot requested on the source
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotRef {
    /// Snapshot identifier, if known immediately
    pub id: String,
    /// Provider task tracking creation
    pub task_id: Option<String>,
}

/// Drives a source VM
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Current power state
    async fn power_state(&self, vm: &Ref) -> Result<PowerState>;

    /// Power the VM on
    async fn power_on(&self, vm: &Ref) -> Result<()>;

    /// Power the VM off
    async fn power_off(&self, vm: &Ref) -> Result<()>;

    /// Whether the VM is off
    async fn powered_off(&self, vm: &Ref) -> Result<bool> {
        Ok(self.power_state(vm).await? == PowerState::Off)
    }

    /// Request a snapshot for a precopy
    async fn create_snapshot(&self, _vm: &Ref) -> Result<SnapshotRef> {
        Ok(SnapshotRef::default())
    }

    /// Whether the precopy's snapshot is ready; returns its identifier
    async fn check_snapshot_ready(&self, _vm: &Ref, precopy: &Precopy) -> Result<(bool, String)> {
        Ok((true, precopy.snapshot.clone()))
    }

    /// Request removal of a snapshot; returns the tracking task, if any
    async fn remove_snapshot(&self, _vm: &Ref, _snapshot: &str) -> Result<Option<String>> {
        Ok(None)
    }

    /// Whether the precopy's snapshot has been removed
    async fn check_snapshot_remove(&self, _vm: &Ref, _precopy: &Precopy) -> Result<bool> {
        Ok(true)
    }

    /// Per-disk change identifiers at a snapshot
    async fn get_snapshot_deltas(
        &self,
        _vm: &Ref,
        _snapshot: &str,
    ) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    /// Tell in-progress importers which delta to fetch next
    async fn set_checkpoints(
        &self,
        _vm: &Ref,
        _precopies: &[Precopy],
        _data_volumes: &[DataVolume],
        _final_checkpoint: bool,
    ) -> Result<()> {
        Ok(())
    }

    /// Provider-specific preparation; called until it reports ready
    async fn pre_transfer_actions(&self, _vm: &Ref) -> Result<bool> {
        Ok(true)
    }

    /// Detach disks from the source VM after migration
    async fn detach_disks(&self, _vm: &Ref) -> Result<()> {
        Ok(())
    }

    /// Post-run cleanup once every VM has finished
    async fn finalize(&self, _vms: &[VmStatus], _plan_name: &str) {}

    /// Drop long-lived transport state
    async fn close(&self) {}
}

/// Checkpoints for one disk across the precopies so far
///
/// `previous` is the prior precopy's change ID for the disk (its snapshot
/// when the provider reports no per-disk IDs); the first is "".
pub fn disk_checkpoints(precopies: &[Precopy], disk_id: &str) -> Vec<DataVolumeCheckpoint> {
    let mut checkpoints = Vec::with_capacity(precopies.len());
    let mut previous = String::new();
    for precopy in precopies {
        checkpoints.push(DataVolumeCheckpoint {
            previous: previous.clone(),
            current: precopy.snapshot.clone(),
        });
        previous = precopy
            .deltas
            .get(disk_id)
            .cloned()
            .unwrap_or_else(|| precopy.snapshot.clone());
    }
    checkpoints
}

/// Write checkpoints onto each DataVolume
///
/// `identify` maps a DataVolume to the disk identifier its deltas are keyed by.
pub async fn apply_checkpoints(
    cluster: &dyn ClusterClient,
    data_volumes: &[DataVolume],
    precopies: &[Precopy],
    final_checkpoint: bool,
    identify: impl Fn(&DataVolume) -> String + Send + Sync,
) -> Result<()> {
    for dv in data_volumes {
        let (Some(namespace), Some(name)) =
            (dv.metadata.namespace.as_deref(), dv.metadata.name.as_deref())
        else {
            continue;
        };
        let checkpoints = disk_checkpoints(precopies, &identify(dv));
        debug!(
            dv = %name,
            checkpoints = checkpoints.len(),
            final_checkpoint,
            "setting DataVolume checkpoints"
        );
        let patch = json!({
            "spec": {
                "checkpoints": checkpoints,
                "finalCheckpoint": final_checkpoint,
            }
        });
        cluster.patch_data_volume(namespace, name, patch).await?;
    }
    Ok(())
}
