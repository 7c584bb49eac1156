//! The DestinationClient collaborator
//!
//! Provider-specific cleanup on the destination. Only providers that fill
//! disks with volume populators have anything to do here: their populator
//! CRs outlive the PVCs unless removed or owned.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::VmStatus;
use forklift_common::labels::{LABEL_MIGRATION, LABEL_VM_ID};
use forklift_common::Result;

use crate::cluster::PopulatorKind;
use crate::context::PlanContext;

/// Provider-specific destination cleanup
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DestinationClient: Send + Sync {
    /// Remove the populator CRs created for a VM
    async fn delete_populator_data_source(&self, vm: &VmStatus) -> Result<()>;

    /// Make each populator CR owned by the PVC it fills
    async fn set_populator_cr_ownership(&self) -> Result<()>;
}

/// Destination client for providers without populators
pub struct NoopDestinationClient;

#[async_trait]
impl DestinationClient for NoopDestinationClient {
    async fn delete_populator_data_source(&self, _vm: &VmStatus) -> Result<()> {
        Ok(())
    }

    async fn set_populator_cr_ownership(&self) -> Result<()> {
        Ok(())
    }
}

/// Destination client that manages populator CRs of one kind
pub struct PopulatorDestinationClient {
    ctx: Arc<PlanContext>,
    kind: PopulatorKind,
}

impl PopulatorDestinationClient {
    /// Manage CRs of `kind` for the plan in `ctx`
    pub fn new(ctx: Arc<PlanContext>, kind: PopulatorKind) -> Self {
        Self { ctx, kind }
    }

    fn migration_selector(&self) -> String {
        format!("{}={}", LABEL_MIGRATION, self.ctx.migration_uid())
    }
}

#[async_trait]
impl DestinationClient for PopulatorDestinationClient {
    async fn delete_populator_data_source(&self, vm: &VmStatus) -> Result<()> {
        let namespace = self.ctx.target_namespace();
        let selector = format!(
            "{},{}={}",
            self.migration_selector(),
            LABEL_VM_ID,
            vm.vm_ref.id
        );
        let cluster = &self.ctx.destination.cluster;
        for populator in cluster
            .list_populators(self.kind, namespace, selector)
            .await?
        {
            info!(
                kind = self.kind.kind(),
                name = %populator.name,
                vm = %vm.vm_ref,
                "deleting populator"
            );
            cluster
                .delete_populator(self.kind, namespace, &populator.name)
                .await?;
        }
        Ok(())
    }

    async fn set_populator_cr_ownership(&self) -> Result<()> {
        let namespace = self.ctx.target_namespace();
        let cluster = &self.ctx.destination.cluster;
        let selector = self.migration_selector();

        let pvcs = cluster
            .list_persistent_volume_claims(namespace, selector.clone())
            .await?;
        let populators = cluster.list_populators(self.kind, namespace, selector).await?;

        for pvc in &pvcs {
            let Some(source) = pvc.spec.as_ref().and_then(|s| s.data_source_ref.as_ref()) else {
                continue;
            };
            if source.kind != self.kind.kind() {
                continue;
            }
            let (Some(pvc_name), Some(pvc_uid)) =
                (pvc.metadata.name.as_deref(), pvc.metadata.uid.as_deref())
            else {
                continue;
            };
            if !populators.iter().any(|p| p.name == source.name) {
                continue;
            }
            debug!(populator = %source.name, pvc = %pvc_name, "setting populator owner");
            let patch = json!({
                "metadata": {
                    "ownerReferences": [{
                        "apiVersion": "v1",
                        "kind": "PersistentVolumeClaim",
                        "name": pvc_name,
                        "uid": pvc_uid,
                    }]
                }
            });
            cluster
                .patch_populator(self.kind, namespace, &source.name, patch)
                .await?;
        }
        Ok(())
    }
}
