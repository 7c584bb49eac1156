//! Disk image format conversion
//!
//! Some providers land disk contents in a format KubeVirt should not mount
//! directly (qcow2 on a block volume). For each such PVC the converter
//! allocates a blank scratch DataVolume, runs a convert Job from the PVC
//! into it, and reports ready once every Job has completed.
//!
//! Each call polls; nothing blocks. Per PVC:
//! - Job complete: scratch deleted, PVC counts as ready
//! - Job failed `CONVERT_BACKOFF_LIMIT` times: scratch deleted, fatal
//! - otherwise: scratch DV ensured, Job ensured once the scratch is ready

pub mod job;

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tracing::{debug, info, warn};

use forklift_adapter::ClusterClient;
use forklift_common::crd::{dv_phase, DataVolume};
use forklift_common::kube_utils::{has_condition, CONDITION_COMPLETE, CONDITION_FAILED};
use forklift_common::labels::LABEL_CONVERSION_SOURCE_PVC;
use forklift_common::{Error, Result};

pub use job::{build_convert_job, build_scratch_data_volume, CONVERT_BACKOFF_LIMIT};

/// Outcome of one convert Job poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobState {
    Running,
    Complete,
    Exhausted,
}

fn job_state(job: &Job) -> JobState {
    let status = job.status.as_ref();
    let conditions = status.and_then(|s| s.conditions.as_deref());
    if has_condition(conditions, CONDITION_COMPLETE) {
        return JobState::Complete;
    }
    let failures = status.and_then(|s| s.failed).unwrap_or(0);
    if has_condition(conditions, CONDITION_FAILED) && failures >= CONVERT_BACKOFF_LIMIT {
        return JobState::Exhausted;
    }
    JobState::Running
}

/// Drives convert Jobs on the destination cluster
pub struct Converter {
    cluster: Arc<dyn ClusterClient>,
    image: String,
}

impl Converter {
    /// Converter running `image` on `cluster`
    pub fn new(cluster: Arc<dyn ClusterClient>, image: impl Into<String>) -> Self {
        Self {
            cluster,
            image: image.into(),
        }
    }

    /// Convert every PVC from its source format to `dst_format`
    ///
    /// Returns `Ok(true)` once every PVC is converted, `Ok(false)` while any
    /// is still in progress, and [`Error::ConvertJobFailed`] when a Job has
    /// exhausted its retries.
    pub async fn convert_pvcs<F>(
        &self,
        pvcs: &[PersistentVolumeClaim],
        src_format: F,
        dst_format: &str,
    ) -> Result<bool>
    where
        F: Fn(&PersistentVolumeClaim) -> String + Send + Sync,
    {
        let mut ready = 0;
        for pvc in pvcs {
            if self.convert_one(pvc, &src_format(pvc), dst_format).await? {
                ready += 1;
            }
        }
        Ok(ready == pvcs.len())
    }

    async fn convert_one(
        &self,
        pvc: &PersistentVolumeClaim,
        src_format: &str,
        dst_format: &str,
    ) -> Result<bool> {
        let name = pvc.metadata.name.as_deref().unwrap_or_default();
        let namespace = pvc.metadata.namespace.as_deref().unwrap_or_default();

        if let Some(existing) = self.cluster.get_job(namespace, &job::job_name(name)).await? {
            match job_state(&existing) {
                JobState::Complete => {
                    info!(pvc = %name, "convert job completed");
                    self.delete_scratch(namespace, name).await;
                    return Ok(true);
                }
                JobState::Exhausted => {
                    warn!(pvc = %name, "convert job exhausted its retries");
                    self.delete_scratch(namespace, name).await;
                    return Err(Error::ConvertJobFailed {
                        pvc: name.to_string(),
                    });
                }
                JobState::Running => {
                    debug!(pvc = %name, "convert job running");
                    return Ok(false);
                }
            }
        }

        let scratch = self.ensure_scratch(pvc, namespace, name).await?;
        let phase = scratch.phase();
        if phase != dv_phase::SUCCEEDED {
            debug!(pvc = %name, phase = %phase, "scratch DataVolume not ready");
            return Ok(false);
        }

        let scratch_name = scratch.metadata.name.as_deref().unwrap_or_default();
        let draft = build_convert_job(pvc, scratch_name, src_format, dst_format, &self.image);
        info!(
            pvc = %name,
            src_format = %src_format,
            dst_format = %dst_format,
            "creating convert job"
        );
        match self.cluster.create_job(&draft).await {
            Ok(_) => Ok(false),
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn scratch_volumes(&self, namespace: &str, pvc: &str) -> Result<Vec<DataVolume>> {
        self.cluster
            .list_data_volumes(namespace, format!("{}={}", LABEL_CONVERSION_SOURCE_PVC, pvc))
            .await
    }

    async fn ensure_scratch(
        &self,
        pvc: &PersistentVolumeClaim,
        namespace: &str,
        name: &str,
    ) -> Result<DataVolume> {
        let mut found = self.scratch_volumes(namespace, name).await?;
        match found.len() {
            0 => {
                info!(pvc = %name, "creating scratch DataVolume");
                self.cluster
                    .create_data_volume(&build_scratch_data_volume(pvc))
                    .await
            }
            1 => Ok(found.remove(0)),
            n => Err(Error::internal_with_context(
                "converter",
                format!("found {} scratch DataVolumes for pvc {}", n, name),
            )),
        }
    }

    /// Failures are logged; a leftover scratch volume does not fail the VM
    async fn delete_scratch(&self, namespace: &str, pvc: &str) {
        let scratch = match self.scratch_volumes(namespace, pvc).await {
            Ok(found) => found,
            Err(e) => {
                warn!(pvc = %pvc, error = %e, "failed to list scratch DataVolumes");
                return;
            }
        };
        for dv in scratch {
            let dv_name = dv.metadata.name.unwrap_or_default();
            if let Err(e) = self.cluster.delete_data_volume(namespace, &dv_name).await {
                warn!(pvc = %pvc, dv = %dv_name, error = %e, "failed to delete scratch DataVolume");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::job::fixtures::source_pvc;
    use super::*;
    use crate::testing::FakeCluster;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn converter(cluster: &FakeCluster) -> Converter {
        Converter::new(Arc::new(cluster.clone()), "quay.io/kubev2v/virt-v2v:test")
    }

    fn qcow2(_: &PersistentVolumeClaim) -> String {
        "qcow2".to_string()
    }

    fn job_status(type_: &str, failed: i32) -> JobStatus {
        JobStatus {
            conditions: Some(vec![JobCondition {
                type_: type_.to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            failed: Some(failed),
            ..Default::default()
        }
    }

    // =========================================================================
    // Story Tests: Converting a qcow2 PVC to raw
    // =========================================================================

    /// Story: scratch volume first, then the Job, then cleanup on completion
    #[tokio::test]
    async fn story_convert_success() {
        let cluster = FakeCluster::default();
        let c = converter(&cluster);
        let pvcs = vec![source_pvc("p", None)];

        // first pass allocates the scratch volume and waits for it
        assert!(!c.convert_pvcs(&pvcs, qcow2, "raw").await.unwrap());
        assert_eq!(cluster.data_volumes().len(), 1);
        assert!(cluster.job("convert-p").is_none());

        // scratch ready: the Job is created
        cluster.set_data_volume_phase("scratch-p", dv_phase::SUCCEEDED);
        assert!(!c.convert_pvcs(&pvcs, qcow2, "raw").await.unwrap());
        let job = cluster.job("convert-p").unwrap();
        let args = job.spec.unwrap().template.spec.unwrap().containers[0]
            .args
            .clone()
            .unwrap();
        assert!(args.contains(&"qcow2".to_string()));
        assert!(args.contains(&"raw".to_string()));

        // still running
        assert!(!c.convert_pvcs(&pvcs, qcow2, "raw").await.unwrap());

        // complete: scratch deleted, ready
        cluster.set_job_status("convert-p", job_status(CONDITION_COMPLETE, 0));
        assert!(c.convert_pvcs(&pvcs, qcow2, "raw").await.unwrap());
        assert!(cluster.data_volumes().is_empty());
    }

    /// Story: three failed attempts fail the VM and clean up
    #[tokio::test]
    async fn story_convert_exhaustion() {
        let cluster = FakeCluster::default();
        let c = converter(&cluster);
        let pvcs = vec![source_pvc("p", None)];

        c.convert_pvcs(&pvcs, qcow2, "raw").await.unwrap();
        cluster.set_data_volume_phase("scratch-p", dv_phase::SUCCEEDED);
        c.convert_pvcs(&pvcs, qcow2, "raw").await.unwrap();

        // failed but within the backoff limit: keep waiting
        cluster.set_job_status("convert-p", job_status(CONDITION_FAILED, 2));
        assert!(!c.convert_pvcs(&pvcs, qcow2, "raw").await.unwrap());
        assert_eq!(cluster.data_volumes().len(), 1);

        cluster.set_job_status("convert-p", job_status(CONDITION_FAILED, 3));
        let err = c.convert_pvcs(&pvcs, qcow2, "raw").await.unwrap_err();
        assert!(matches!(err, Error::ConvertJobFailed { ref pvc } if pvc == "p"));
        assert!(err.is_fatal());
        assert!(cluster.data_volumes().is_empty());
    }

    #[tokio::test]
    async fn empty_list_is_ready() {
        let cluster = FakeCluster::default();
        assert!(converter(&cluster)
            .convert_pvcs(&[], qcow2, "raw")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn two_scratch_volumes_is_an_error() {
        let cluster = FakeCluster::default();
        let pvc = source_pvc("p", None);
        for name in ["scratch-p", "scratch-p-dup"] {
            let mut dv = build_scratch_data_volume(&pvc);
            dv.metadata.name = Some(name.to_string());
            cluster.insert_data_volume(dv);
        }
        let err = converter(&cluster)
            .convert_pvcs(&[pvc], qcow2, "raw")
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn job_state_reads_conditions_and_failures() {
        let job = |status| Job {
            status: Some(status),
            ..Default::default()
        };
        assert_eq!(job_state(&Job::default()), JobState::Running);
        assert_eq!(
            job_state(&job(job_status(CONDITION_COMPLETE, 0))),
            JobState::Complete
        );
        assert_eq!(
            job_state(&job(job_status(CONDITION_FAILED, 1))),
            JobState::Running
        );
        assert_eq!(
            job_state(&job(job_status(CONDITION_FAILED, 3))),
            JobState::Exhausted
        );
    }
}
