//! DataVolume and Task drafting shared by the builders
//!
//! Every provider decides which disks migrate the same way and stamps the
//! same identity annotations on the drafts; only the DataVolume source
//! differs. Providers pick the disks with [`migratable_disks`] and wrap their
//! source with [`draft_data_volume`].

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedObjectReference,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

use forklift_common::crd::{
    DataVolume, DataVolumeSource, DestinationStorage, StorageSpec, Task, GLANCE_SOURCE,
    POPULATOR_API_GROUP,
};
use forklift_common::kube_utils::merge_into;
use forklift_common::labels::{ANNOTATION_DISK_INDEX, ANNOTATION_DISK_SOURCE};
use forklift_common::template::{render_pvc_name, PvcName, PvcNameTemplateData};
use forklift_common::Result;

use crate::checks::file_name;
use crate::context::PlanContext;
use crate::model::{SourceDisk, SourceVm};

/// A disk selected for migration with its resolved storage mapping
#[derive(Clone, Debug)]
pub struct MigratableDisk<'a> {
    /// Ordinal of the disk on the source VM
    pub index: usize,
    /// The source disk
    pub disk: &'a SourceDisk,
    /// Destination storage for the disk
    pub storage: &'a DestinationStorage,
}

impl MigratableDisk<'_> {
    /// Storage request for `size`
    pub fn storage_spec(&self, size: Quantity) -> StorageSpec {
        StorageSpec::sized(
            size,
            &self.storage.storage_class,
            self.storage.access_mode.as_deref(),
            self.storage.volume_mode.as_deref(),
        )
    }
}

/// Storage mapping for a disk; Glance-backed disks use the glance entry
pub fn storage_for<'a>(ctx: &'a PlanContext, disk: &SourceDisk) -> Option<&'a DestinationStorage> {
    ctx.storage_map.spec.find(&disk.storage).or_else(|| {
        (disk.storage.id == GLANCE_SOURCE)
            .then(|| ctx.storage_map.spec.glance())
            .flatten()
    })
}

/// Disks that get a DataVolume, in source order
///
/// LUNs are attached directly, shared disks are skipped unless the plan
/// migrates them, and disks on unmapped storage are skipped.
pub fn migratable_disks<'a>(ctx: &'a PlanContext, vm: &'a SourceVm) -> Vec<MigratableDisk<'a>> {
    vm.disks
        .iter()
        .enumerate()
        .filter(|(_, d)| d.lun.is_none())
        .filter(|(_, d)| !d.shared || ctx.plan.spec.migrate_shared_disks)
        .filter_map(|(index, disk)| match storage_for(ctx, disk) {
            Some(storage) => Some(MigratableDisk {
                index,
                disk,
                storage,
            }),
            None => {
                debug!(vm = %vm.id, disk = %disk.id, "skipping disk on unmapped storage");
                None
            }
        })
        .collect()
}

/// Wrap a provider's source into a DataVolume draft
///
/// The draft starts from `template`, gains the `disk-source` and
/// `disk-index` annotations, and is named by the PVC name template when the
/// plan or VM defines one.
pub fn draft_data_volume(
    ctx: &PlanContext,
    template: &DataVolume,
    vm: &SourceVm,
    disk: &MigratableDisk<'_>,
    source: DataVolumeSource,
    size: Quantity,
    identifier: &str,
) -> Result<DataVolume> {
    let mut dv = template.clone();
    merge_into(
        &mut dv.metadata.annotations,
        [
            (ANNOTATION_DISK_SOURCE.to_string(), identifier.to_string()),
            (ANNOTATION_DISK_INDEX.to_string(), disk.index.to_string()),
        ],
    );
    dv.spec.source = Some(source);
    dv.spec.storage = Some(disk.storage_spec(size));

    let vm_ref = vm.reference();
    if let Some(name_template) = ctx.plan.spec.pvc_name_template_for(&vm_ref) {
        let data = PvcNameTemplateData {
            vm_name: vm.name.clone(),
            target_vm_name: ctx.target_vm_name(&vm_ref, &vm.name),
            plan_name: ctx.plan_name().to_string(),
            disk_index: disk.index,
            root_disk_index: 0,
            shared: disk.disk.shared,
            file_name: file_name(&disk.disk.file),
        };
        match render_pvc_name(
            name_template,
            &data,
            ctx.plan.spec.pvc_name_template_use_generate_name,
        )? {
            PvcName::Name(name) => {
                dv.metadata.name = Some(name);
                dv.metadata.generate_name = None;
            }
            PvcName::GenerateName(prefix) => {
                dv.metadata.name = None;
                dv.metadata.generate_name = Some(prefix);
            }
        }
    }
    Ok(dv)
}

/// A PVC filled by the populator CR `populator` of `kind`
///
/// Carries the owner labels and the same identity annotations a DataVolume
/// draft would, on top of the caller's `annotations`.
pub fn populator_claim(
    ctx: &PlanContext,
    vm: &SourceVm,
    disk: &MigratableDisk<'_>,
    size: Quantity,
    annotations: &BTreeMap<String, String>,
    kind: &str,
    populator: &str,
) -> PersistentVolumeClaim {
    let vm_ref = vm.reference();
    let mut claim_annotations = annotations.clone();
    claim_annotations.insert(ANNOTATION_DISK_SOURCE.to_string(), disk.disk.id.clone());
    claim_annotations.insert(ANNOTATION_DISK_INDEX.to_string(), disk.index.to_string());

    let mut pvc = PersistentVolumeClaim::default();
    pvc.metadata.generate_name = Some(format!("{}-", ctx.target_vm_name(&vm_ref, &vm.name)));
    pvc.metadata.namespace = Some(ctx.target_namespace().to_string());
    pvc.metadata.labels = Some(ctx.owner_labels(&vm_ref).to_map());
    pvc.metadata.annotations = Some(claim_annotations);
    pvc.spec = Some(PersistentVolumeClaimSpec {
        access_modes: Some(vec![disk
            .storage
            .access_mode
            .clone()
            .unwrap_or_else(|| "ReadWriteOnce".to_string())]),
        volume_mode: disk.storage.volume_mode.clone(),
        storage_class_name: (!disk.storage.storage_class.is_empty())
            .then(|| disk.storage.storage_class.clone()),
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([("storage".to_string(), size)])),
            ..Default::default()
        }),
        data_source_ref: Some(TypedObjectReference {
            api_group: Some(POPULATOR_API_GROUP.to_string()),
            kind: kind.to_string(),
            name: populator.to_string(),
            namespace: None,
        }),
        ..Default::default()
    });
    pvc
}

/// One task per migrated disk, named by the disk identifier
pub fn disk_tasks(disks: &[MigratableDisk<'_>]) -> Vec<Task> {
    disks
        .iter()
        .map(|d| Task::from_bytes(d.disk.id.clone(), d.disk.capacity_bytes))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::context::testing::context;
    use crate::inventory::StaticInventory;
    use crate::model::Lun;
    use forklift_common::crd::{DataVolumeSpec, ProviderType, Ref, MIB};
    use forklift_common::kube_utils::bytes_quantity;

    fn ctx() -> PlanContext {
        context(
            ProviderType::Vsphere,
            None,
            StaticInventory::default(),
            MockClusterClient::new(),
        )
    }

    fn disk(id: &str, storage: &str) -> SourceDisk {
        SourceDisk {
            id: id.to_string(),
            name: id.to_string(),
            file: format!("[ds] web/{}.vmdk", id),
            capacity_bytes: 2048 * MIB,
            storage: Ref::with_id(storage),
            ..Default::default()
        }
    }

    fn vm() -> SourceVm {
        SourceVm {
            id: "vm-1".to_string(),
            name: "web-01".to_string(),
            disks: vec![
                disk("disk-0", "ds-1"),
                SourceDisk {
                    shared: true,
                    ..disk("disk-1", "ds-1")
                },
                SourceDisk {
                    lun: Some(Lun::default()),
                    ..disk("lun-0", "ds-1")
                },
                disk("disk-3", "unmapped"),
            ],
            ..Default::default()
        }
    }

    fn template() -> DataVolume {
        let mut dv = DataVolume::new("", DataVolumeSpec::default());
        dv.metadata.name = None;
        dv.metadata.generate_name = Some("web-01-".to_string());
        dv
    }

    #[test]
    fn selection_skips_luns_and_unmapped_storage() {
        let ctx = ctx();
        let vm = vm();
        let disks = migratable_disks(&ctx, &vm);
        let picked: Vec<(usize, &str)> = disks.iter().map(|d| (d.index, d.disk.id.as_str())).collect();
        assert_eq!(picked, vec![(0, "disk-0"), (1, "disk-1")]);
        assert_eq!(disks[0].storage.storage_class, "ceph-rbd");
    }

    #[test]
    fn shared_disks_follow_plan_policy() {
        let mut ctx = ctx();
        ctx.plan.spec.migrate_shared_disks = false;
        let vm = vm();
        let ids: Vec<String> = migratable_disks(&ctx, &vm)
            .iter()
            .map(|d| d.disk.id.clone())
            .collect();
        assert_eq!(ids, vec!["disk-0".to_string()]);
    }

    #[test]
    fn draft_carries_identity_and_storage() {
        let ctx = ctx();
        let vm = vm();
        let disks = migratable_disks(&ctx, &vm);
        let dv = draft_data_volume(
            &ctx,
            &template(),
            &vm,
            &disks[1],
            DataVolumeSource::blank(),
            bytes_quantity(disks[1].disk.capacity_bytes),
            "disk-1",
        )
        .unwrap();

        let annotations = dv.metadata.annotations.unwrap();
        assert_eq!(annotations[ANNOTATION_DISK_SOURCE], "disk-1");
        assert_eq!(annotations[ANNOTATION_DISK_INDEX], "1");
        let storage = dv.spec.storage.unwrap();
        assert_eq!(storage.storage_class_name.as_deref(), Some("ceph-rbd"));
        assert_eq!(storage.size(), Some(&Quantity((2048 * MIB).to_string())));
        assert_eq!(dv.metadata.generate_name.as_deref(), Some("web-01-"));
    }

    #[test]
    fn name_template_overrides_generate_name() {
        let mut ctx = ctx();
        ctx.plan.spec.pvc_name_template = Some("{{.TargetVmName}}-disk-{{.DiskIndex}}".to_string());
        let vm = vm();
        let disks = migratable_disks(&ctx, &vm);
        let dv = draft_data_volume(
            &ctx,
            &template(),
            &vm,
            &disks[0],
            DataVolumeSource::blank(),
            Quantity("2Gi".to_string()),
            "disk-0",
        )
        .unwrap();
        assert_eq!(dv.metadata.name.as_deref(), Some("web-01-disk-0"));
        assert!(dv.metadata.generate_name.is_none());
    }

    #[test]
    fn populator_claim_points_at_its_cr() {
        let ctx = ctx();
        let vm = vm();
        let disks = migratable_disks(&ctx, &vm);
        let pvc = populator_claim(
            &ctx,
            &vm,
            &disks[0],
            Quantity("2Gi".to_string()),
            &BTreeMap::from([("extra".to_string(), "1".to_string())]),
            "OvirtVolumePopulator",
            "disk-0",
        );
        assert_eq!(pvc.metadata.generate_name.as_deref(), Some("web-01-"));
        assert_eq!(pvc.metadata.labels.as_ref().unwrap()["vmID"], "vm-1");
        let annotations = pvc.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["extra"], "1");
        assert_eq!(annotations[ANNOTATION_DISK_SOURCE], "disk-0");
        let spec = pvc.spec.unwrap();
        let source = spec.data_source_ref.unwrap();
        assert_eq!(source.kind, "OvirtVolumePopulator");
        assert_eq!(source.name, "disk-0");
        assert_eq!(spec.storage_class_name.as_deref(), Some("ceph-rbd"));
    }

    #[test]
    fn tasks_are_sized_in_mib() {
        let ctx = ctx();
        let vm = vm();
        let tasks = disk_tasks(&migratable_disks(&ctx, &vm));
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name, "disk-0");
        assert_eq!(tasks[0].total, 2048);
    }
}
