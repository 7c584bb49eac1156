//! Convert Job and scratch DataVolume construction
//!
//! A convert Job rewrites the image on a source PVC into a scratch
//! DataVolume of the same size and storage class. Both objects are named
//! after the source PVC so a later reconcile finds them again.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource,
    PodSecurityContext, PodSpec, PodTemplateSpec, SeccompProfile, SecurityContext, Volume,
    VolumeDevice, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use forklift_common::crd::{
    DataVolume, DataVolumeSource, DataVolumeSpec, StorageSpec, VOLUME_MODE_BLOCK,
    VOLUME_MODE_FILESYSTEM,
};
use forklift_common::kube_utils::merge_into;
use forklift_common::labels::{ANNOTATION_BIND_IMMEDIATE, LABEL_CONVERSION_SOURCE_PVC};

use crate::labeler::propagate_owner;

/// Retries before a convert Job counts as failed
pub const CONVERT_BACKOFF_LIMIT: i32 = 3;

const CONVERTER_COMMAND: &str = "/usr/local/bin/image-converter";
const SOURCE_VOLUME: &str = "source";
const TARGET_VOLUME: &str = "target";

/// Name of the scratch DataVolume for a source PVC
pub fn scratch_name(pvc: &str) -> String {
    format!("scratch-{}", pvc)
}

/// Name of the convert Job for a source PVC
pub fn job_name(pvc: &str) -> String {
    format!("convert-{}", pvc)
}

/// Volume mode of a PVC, filesystem when unset
pub fn volume_mode(pvc: &PersistentVolumeClaim) -> &str {
    pvc.spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        .unwrap_or(VOLUME_MODE_FILESYSTEM)
}

fn is_block(pvc: &PersistentVolumeClaim) -> bool {
    volume_mode(pvc) == VOLUME_MODE_BLOCK
}

/// Metadata shared by the scratch DV and the Job: namespace, the link back
/// to the source PVC and the owner triple copied from it
fn derived_meta(pvc: &PersistentVolumeClaim, name: String) -> ObjectMeta {
    let mut meta = ObjectMeta {
        name: Some(name),
        namespace: pvc.metadata.namespace.clone(),
        labels: Some(BTreeMap::from([(
            LABEL_CONVERSION_SOURCE_PVC.to_string(),
            pvc.metadata.name.clone().unwrap_or_default(),
        )])),
        ..Default::default()
    };
    propagate_owner(&pvc.metadata, &mut meta);
    meta
}

/// Blank DataVolume matching the source PVC's size, class and modes
pub fn build_scratch_data_volume(pvc: &PersistentVolumeClaim) -> DataVolume {
    let pvc_name = pvc.metadata.name.clone().unwrap_or_default();
    let spec = pvc.spec.clone().unwrap_or_default();

    let mut meta = derived_meta(pvc, scratch_name(&pvc_name));
    merge_into(
        &mut meta.annotations,
        [(ANNOTATION_BIND_IMMEDIATE.to_string(), "true".to_string())],
    );

    DataVolume {
        metadata: meta,
        spec: DataVolumeSpec {
            source: Some(DataVolumeSource::blank()),
            storage: Some(StorageSpec {
                access_modes: spec.access_modes,
                volume_mode: spec.volume_mode,
                storage_class_name: spec.storage_class_name,
                resources: spec.resources,
            }),
            ..Default::default()
        },
        status: None,
    }
}

/// Job converting `pvc` from `src_format` to `dst_format` into `scratch`
pub fn build_convert_job(
    pvc: &PersistentVolumeClaim,
    scratch: &str,
    src_format: &str,
    dst_format: &str,
    image: &str,
) -> Job {
    let pvc_name = pvc.metadata.name.clone().unwrap_or_default();
    let meta = derived_meta(pvc, job_name(&pvc_name));

    let claim = |name: &str, claim_name: &str| Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim_name.to_string(),
            read_only: None,
        }),
        ..Default::default()
    };

    Job {
        metadata: meta.clone(),
        spec: Some(JobSpec {
            backoff_limit: Some(CONVERT_BACKOFF_LIMIT),
            completions: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: meta.labels,
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    // no RunAsUser/FSGroup is assigned, so insist on non-root
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        seccomp_profile: Some(SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            localhost_profile: None,
                        }),
                        ..Default::default()
                    }),
                    restart_policy: Some("Never".to_string()),
                    containers: vec![convert_container(pvc, src_format, dst_format, image)],
                    volumes: Some(vec![
                        claim(SOURCE_VOLUME, &pvc_name),
                        claim(TARGET_VOLUME, scratch),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn convert_container(
    pvc: &PersistentVolumeClaim,
    src_format: &str,
    dst_format: &str,
    image: &str,
) -> Container {
    let (src_path, dst_path) = if is_block(pvc) {
        ("/dev/block", "/dev/target")
    } else {
        ("/mnt/disk.img", "/output/disk.img")
    };

    let mut container = Container {
        name: "convert".to_string(),
        image: Some(image.to_string()),
        command: Some(vec![CONVERTER_COMMAND.to_string()]),
        args: Some(
            [
                "-src-path",
                src_path,
                "-dst-path",
                dst_path,
                "-src-format",
                src_format,
                "-dst-format",
                dst_format,
                "-volume-mode",
                volume_mode(pvc),
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        ),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                add: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    if is_block(pvc) {
        container.volume_devices = Some(vec![
            VolumeDevice {
                name: SOURCE_VOLUME.to_string(),
                device_path: "/dev/block".to_string(),
            },
            VolumeDevice {
                name: TARGET_VOLUME.to_string(),
                device_path: "/dev/target".to_string(),
            },
        ]);
    } else {
        container.volume_mounts = Some(vec![
            VolumeMount {
                name: SOURCE_VOLUME.to_string(),
                mount_path: "/mnt/".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: TARGET_VOLUME.to_string(),
                mount_path: "/output/".to_string(),
                ..Default::default()
            },
        ]);
    }
    container
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use forklift_common::labels::{LABEL_MIGRATION, LABEL_PLAN, LABEL_VM_ID};
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    /// A 10Gi qcow2 PVC owned by vm-1
    pub fn source_pvc(name: &str, mode: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(BTreeMap::from([
                    (LABEL_PLAN.to_string(), "plan-1-uid".to_string()),
                    (LABEL_MIGRATION.to_string(), "migration-1-uid".to_string()),
                    (LABEL_VM_ID.to_string(), "vm-1".to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                volume_mode: mode.map(str::to_string),
                storage_class_name: Some("ceph-rbd".to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity("10Gi".to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::source_pvc;
    use super::*;
    use forklift_common::labels::LABEL_VM_ID;

    fn pod_spec(job: &Job) -> &PodSpec {
        job.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
    }

    #[test]
    fn names_derive_from_the_source_pvc() {
        assert_eq!(scratch_name("p"), "scratch-p");
        assert_eq!(job_name("p"), "convert-p");
    }

    #[test]
    fn scratch_matches_source_storage() {
        let dv = build_scratch_data_volume(&source_pvc("p", None));
        assert_eq!(dv.metadata.name.as_deref(), Some("scratch-p"));
        assert_eq!(dv.metadata.namespace.as_deref(), Some("ns"));
        let labels = dv.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_CONVERSION_SOURCE_PVC], "p");
        assert_eq!(labels[LABEL_VM_ID], "vm-1");
        assert_eq!(
            dv.metadata.annotations.as_ref().unwrap()[ANNOTATION_BIND_IMMEDIATE],
            "true"
        );

        let storage = dv.spec.storage.as_ref().unwrap();
        assert_eq!(storage.storage_class_name.as_deref(), Some("ceph-rbd"));
        assert_eq!(storage.size().unwrap().0, "10Gi");
        assert!(dv.spec.source.as_ref().unwrap().blank.is_some());
    }

    #[test]
    fn filesystem_job_mounts_both_volumes() {
        let job = build_convert_job(&source_pvc("p", None), "scratch-p", "qcow2", "raw", "v2v:1");
        assert_eq!(job.metadata.name.as_deref(), Some("convert-p"));
        let spec = job.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(3));
        assert_eq!(spec.completions, Some(1));

        let pod = pod_spec(&job);
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let security = pod.security_context.as_ref().unwrap();
        assert_eq!(security.run_as_non_root, Some(true));

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("v2v:1"));
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec![
                "-src-path",
                "/mnt/disk.img",
                "-dst-path",
                "/output/disk.img",
                "-src-format",
                "qcow2",
                "-dst-format",
                "raw",
                "-volume-mode",
                "Filesystem",
            ]
        );
        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/mnt/");
        assert_eq!(mounts[1].mount_path, "/output/");
        assert!(container.volume_devices.is_none());

        let volumes = pod.volumes.as_ref().unwrap();
        let claim = |i: usize| {
            volumes[i]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name
                .clone()
        };
        assert_eq!(claim(0), "p");
        assert_eq!(claim(1), "scratch-p");
    }

    #[test]
    fn block_job_uses_devices() {
        let job = build_convert_job(
            &source_pvc("p", Some("Block")),
            "scratch-p",
            "qcow2",
            "raw",
            "v2v:1",
        );
        let container = &pod_spec(&job).containers[0];
        let devices = container.volume_devices.as_ref().unwrap();
        assert_eq!(devices[0].device_path, "/dev/block");
        assert_eq!(devices[1].device_path, "/dev/target");
        assert!(container.volume_mounts.is_none());
        let args = container.args.as_ref().unwrap();
        assert_eq!(args[1], "/dev/block");
        assert_eq!(args.last().map(String::as_str), Some("Block"));

        let caps = container
            .security_context
            .as_ref()
            .unwrap()
            .capabilities
            .as_ref()
            .unwrap();
        assert_eq!(caps.drop.as_ref().unwrap(), &vec!["ALL".to_string()]);
    }
}
