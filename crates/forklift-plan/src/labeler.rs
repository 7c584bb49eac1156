//! Labels and annotations for the objects a migration creates
//!
//! Every owned object carries the `{plan, migration, vmID}` triple so the
//! ensurer can find it again on the next reconcile. The VM additionally gets
//! the plan's target labels.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use forklift_adapter::PlanContext;
use forklift_common::crd::{DataVolume, DataVolumeSpec, Ref};
use forklift_common::kube_utils::merge_into;
use forklift_common::labels::{
    OwnerLabels, ANNOTATION_BIND_IMMEDIATE, LABEL_MIGRATION, LABEL_PLAN, LABEL_PLAN_NAME,
    LABEL_VM_ID,
};

/// Labels for one VM of a plan
#[derive(Clone, Debug)]
pub struct Labeler {
    owner: OwnerLabels,
    namespace: String,
    plan_name: String,
    target_labels: BTreeMap<String, String>,
}

impl Labeler {
    /// Labeler for `vm` in the plan of `ctx`
    pub fn new(ctx: &PlanContext, vm: &Ref) -> Self {
        Self {
            owner: ctx.owner_labels(vm),
            namespace: ctx.target_namespace().to_string(),
            plan_name: ctx.plan_name().to_string(),
            target_labels: ctx.plan.spec.target_labels.clone(),
        }
    }

    /// The owner triple
    pub fn owner(&self) -> &OwnerLabels {
        &self.owner
    }

    /// Label selector matching every object owned by the VM
    pub fn selector(&self) -> String {
        self.owner.selector()
    }

    /// Namespace receiving the objects
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Stamp the owner triple and namespace onto an object
    pub fn stamp(&self, meta: &mut ObjectMeta) {
        self.owner.stamp(meta.labels.get_or_insert_with(BTreeMap::new));
        meta.namespace = Some(self.namespace.clone());
    }

    /// Labels for the destination VM: target labels, then the owner triple
    pub fn vm_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.target_labels.clone();
        labels.insert(LABEL_PLAN_NAME.to_string(), self.plan_name.clone());
        self.owner.stamp(&mut labels);
        labels
    }

    /// DataVolume template handed to the builder
    ///
    /// Named `{vm}-` so generated names group by VM; binds immediately so
    /// imports start without a consumer pod.
    pub fn data_volume_template(&self, vm_name: &str) -> DataVolume {
        let mut dv = DataVolume::new("", DataVolumeSpec::default());
        dv.metadata.name = None;
        dv.metadata.generate_name = Some(format!("{}-", vm_name));
        self.stamp(&mut dv.metadata);
        merge_into(
            &mut dv.metadata.annotations,
            [(ANNOTATION_BIND_IMMEDIATE.to_string(), "true".to_string())],
        );
        dv
    }
}

/// Copy the owner triple from one object to another, if present
pub fn propagate_owner(from: &ObjectMeta, to: &mut ObjectMeta) {
    let Some(labels) = from.labels.as_ref() else {
        return;
    };
    merge_into(
        &mut to.labels,
        [LABEL_PLAN, LABEL_MIGRATION, LABEL_VM_ID]
            .iter()
            .filter_map(|k| labels.get(*k).map(|v| (k.to_string(), v.clone()))),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;

    #[test]
    fn template_is_owned_and_binds_immediately() {
        let ctx = context();
        let labeler = Labeler::new(&ctx, &Ref::new("vm-1", "web-01"));
        let dv = labeler.data_volume_template("web-01");

        assert_eq!(dv.metadata.generate_name.as_deref(), Some("web-01-"));
        assert_eq!(dv.metadata.namespace.as_deref(), Some("ns"));
        let labels = dv.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_PLAN], "plan-1-uid");
        assert_eq!(labels[LABEL_MIGRATION], "migration-1-uid");
        assert_eq!(labels[LABEL_VM_ID], "vm-1");
        assert_eq!(
            dv.metadata.annotations.as_ref().unwrap()[ANNOTATION_BIND_IMMEDIATE],
            "true"
        );
    }

    #[test]
    fn owner_triple_wins_over_target_labels() {
        let mut ctx = context();
        ctx.plan.spec.target_labels = BTreeMap::from([
            ("app".to_string(), "shop".to_string()),
            (LABEL_VM_ID.to_string(), "spoofed".to_string()),
        ]);
        let labels = Labeler::new(&ctx, &Ref::with_id("vm-1")).vm_labels();
        assert_eq!(labels["app"], "shop");
        assert_eq!(labels[LABEL_VM_ID], "vm-1");
        assert_eq!(labels[LABEL_PLAN_NAME], "plan");
    }

    #[test]
    fn propagate_copies_only_the_triple() {
        let from = ObjectMeta {
            labels: Some(BTreeMap::from([
                (LABEL_PLAN.to_string(), "p".to_string()),
                (LABEL_VM_ID.to_string(), "v".to_string()),
                ("app".to_string(), "db".to_string()),
            ])),
            ..Default::default()
        };
        let mut to = ObjectMeta::default();
        propagate_owner(&from, &mut to);
        let labels = to.labels.unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels[LABEL_PLAN], "p");
    }
}
