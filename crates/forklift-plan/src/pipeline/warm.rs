//! Warm precopy loop
//!
//! While the source keeps running, each precopy snapshots it, hands the
//! importers a checkpoint, waits for them to pause on it, and removes the previous
//! snapshot. After `max_precopies` successes or the migration's cutover time
//! the source is powered off and one final checkpoint is taken.
//!
//! One stage transition per tick; the state lives in [`WarmStatus`].

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use forklift_common::crd::{
    dv_phase, Checkpoint, DataVolume, Precopy, VmStatus, WarmStage, WarmStatus, STEP_CUTOVER,
};
use forklift_common::labels::ANNOTATION_CURRENT_CHECKPOINT;
use forklift_common::{Error, Result};

use super::{start_step, Pipeline};

/// Failed precopy attempts tolerated before the VM fails
pub const MAX_PRECOPY_FAILURES: u32 = 10;

/// Whether every importer is done with `checkpoint`
///
/// A DataVolume still paused on an earlier checkpoint has not picked up the
/// new one yet.
fn paused_or_done(dvs: &[DataVolume], checkpoint: &str) -> bool {
    dvs.iter().all(|dv| match dv.phase() {
        dv_phase::SUCCEEDED => true,
        dv_phase::PAUSED => dv
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_CURRENT_CHECKPOINT))
            .is_some_and(|current| current == checkpoint),
        _ => false,
    })
}

impl Pipeline {
    /// Advance the precopy loop one stage
    ///
    /// Returns `true` once the final checkpoint has been handed over.
    pub(super) async fn precopy(
        &self,
        vm: &mut VmStatus,
        data_volumes: &[DataVolume],
        history: &mut Vec<Checkpoint>,
    ) -> Result<bool> {
        let mut warm = vm.warm.take().unwrap_or_default();
        let result = self
            .precopy_stage(vm, &mut warm, data_volumes, history, Utc::now())
            .await;
        let cutover = warm.cutover;
        let result = match result {
            Err(e) if e.is_retryable() => {
                warm.failures += 1;
                if warm.failures >= MAX_PRECOPY_FAILURES {
                    Err(Error::provider_permanent(
                        vm.vm_ref.to_string(),
                        self.ctx.source_type().to_string(),
                        format!("precopy failed {} times: {}", warm.failures, e),
                    ))
                } else {
                    warn!(failures = warm.failures, error = %e, "precopy failed");
                    Err(e)
                }
            }
            other => other,
        };
        vm.warm = Some(warm);
        if cutover {
            start_step(vm, STEP_CUTOVER);
        }
        result
    }

    async fn precopy_stage(
        &self,
        vm: &VmStatus,
        warm: &mut WarmStatus,
        data_volumes: &[DataVolume],
        history: &mut Vec<Checkpoint>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let vm_ref = &vm.vm_ref;
        match warm.stage {
            WarmStage::Idle => {
                if !warm.cutover {
                    let final_ = warm.successes >= self.ctx.settings.max_precopies
                        || self.ctx.migration.spec.cutover_requested(now);
                    if !final_ {
                        if warm.next_precopy_at.is_some_and(|at| at > now) {
                            return Ok(false);
                        }
                    } else {
                        info!(precopies = warm.successes, "starting cutover");
                        warm.cutover = true;
                    }
                }
                if warm.cutover && !self.source_off(vm_ref).await? {
                    return Ok(false);
                }
                let snapshot = self.client.create_snapshot(vm_ref).await?;
                debug!(snapshot = %snapshot.id, "snapshot requested");
                warm.precopies.push(Precopy {
                    snapshot: snapshot.id,
                    create_task_id: snapshot.task_id,
                    start: now,
                    ..Default::default()
                });
                warm.stage = WarmStage::WaitSnapshot;
                Ok(false)
            }
            WarmStage::WaitSnapshot => {
                let Some(current) = warm.current() else {
                    warm.stage = WarmStage::Idle;
                    return Ok(false);
                };
                let (ready, snapshot) = self.client.check_snapshot_ready(vm_ref, current).await?;
                if !ready {
                    return Ok(false);
                }
                let deltas = self.client.get_snapshot_deltas(vm_ref, &snapshot).await?;
                if let Some(current) = warm.current_mut() {
                    current.snapshot = snapshot.clone();
                    current.deltas = deltas;
                }
                self.client
                    .set_checkpoints(vm_ref, &warm.precopies, data_volumes, warm.cutover)
                    .await?;
                history.push(Checkpoint {
                    vm_id: vm_ref.id.clone(),
                    snapshot,
                    recorded: now,
                    final_: warm.cutover,
                });
                warm.stage = if warm.cutover {
                    WarmStage::WaitFinal
                } else {
                    WarmStage::WaitDataVolumes
                };
                Ok(warm.cutover)
            }
            WarmStage::WaitDataVolumes => {
                let checkpoint = warm.current().map(|p| p.snapshot.as_str()).unwrap_or_default();
                if !paused_or_done(data_volumes, checkpoint) {
                    return Ok(false);
                }
                let previous = warm.previous().map(|p| p.snapshot.clone());
                match previous {
                    Some(previous) => {
                        let task = self.client.remove_snapshot(vm_ref, &previous).await?;
                        let n = warm.precopies.len();
                        warm.precopies[n - 2].remove_task_id = task;
                        warm.stage = WarmStage::WaitSnapshotRemove;
                    }
                    None => self.finish_precopy(warm, now),
                }
                Ok(false)
            }
            WarmStage::WaitSnapshotRemove => {
                let removed = match warm.previous() {
                    Some(previous) => self.client.check_snapshot_remove(vm_ref, previous).await?,
                    None => true,
                };
                if removed {
                    self.finish_precopy(warm, now);
                }
                Ok(false)
            }
            WarmStage::WaitFinal => Ok(true),
        }
    }

    fn finish_precopy(&self, warm: &mut WarmStatus, now: DateTime<Utc>) {
        if let Some(current) = warm.current_mut() {
            current.end = Some(now);
        }
        warm.successes += 1;
        let interval = chrono::Duration::from_std(self.ctx.settings.precopy_interval)
            .unwrap_or_else(|_| chrono::Duration::zero());
        warm.next_precopy_at = Some(now + interval);
        warm.stage = WarmStage::Idle;
        info!(precopies = warm.successes, "precopy complete");
    }
}
