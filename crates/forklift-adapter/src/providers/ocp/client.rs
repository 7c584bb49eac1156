use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use forklift_common::crd::{PowerState, Ref, VmStatus};
use forklift_common::Result;

use super::model::{vm_power_state, OcpLoader};
use crate::client::SourceClient;

/// Drives KubeVirt VMs on the source cluster
pub(crate) struct OcpClient {
    loader: OcpLoader,
}

impl OcpClient {
    pub fn new(loader: OcpLoader) -> Self {
        Self { loader }
    }

    async fn set_run_strategy(&self, vm: &Ref, strategy: &str) -> Result<()> {
        // runStrategy and running are mutually exclusive
        let patch = json!({"spec": {"running": null, "runStrategy": strategy}});
        self.loader
            .cluster()
            .patch_virtual_machine(&vm.namespace, &vm.name, patch)
            .await
    }
}

#[async_trait]
impl SourceClient for OcpClient {
    async fn power_state(&self, vm: &Ref) -> Result<PowerState> {
        Ok(vm_power_state(&self.loader.virtual_machine(vm).await?))
    }

    async fn power_on(&self, vm: &Ref) -> Result<()> {
        info!(vm = %vm, "starting source VM");
        self.set_run_strategy(vm, "Always").await
    }

    async fn power_off(&self, vm: &Ref) -> Result<()> {
        info!(vm = %vm, "halting source VM");
        self.set_run_strategy(vm, "Halted").await
    }

    /// Export the VM; ready once the export reports `Ready`
    async fn pre_transfer_actions(&self, vm: &Ref) -> Result<bool> {
        if let Some(export) = self.loader.export(vm).await? {
            return Ok(export.is_ready());
        }
        info!(vm = %vm, "creating VirtualMachineExport");
        match self
            .loader
            .cluster()
            .create_vm_export(&vm.namespace, &vm.name, &vm.name)
            .await
        {
            Ok(()) => Ok(false),
            Err(e) if e.is_already_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete the exports; failures are logged, not returned
    async fn finalize(&self, vms: &[VmStatus], plan_name: &str) {
        for status in vms {
            let vm = &status.vm_ref;
            match self
                .loader
                .cluster()
                .delete_vm_export(&vm.namespace, &vm.name)
                .await
            {
                Ok(()) => info!(plan = %plan_name, vm = %vm, "deleted VirtualMachineExport"),
                Err(e) => {
                    warn!(plan = %plan_name, vm = %vm, error = %e, "failed to delete VirtualMachineExport")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::providers::ocp::model::fixtures::{self, vm_ref};
    use forklift_common::Error;
    use mockall::predicate::eq;

    fn client(cluster: MockClusterClient) -> OcpClient {
        OcpClient::new(OcpLoader::new(Arc::new(cluster)))
    }

    // ==========================================================================
    // Story Tests: Exporting the Source VM
    // ==========================================================================

    /// Story: the first pass creates the export, later passes wait for it
    #[tokio::test]
    async fn story_export_created_then_awaited() {
        let mut cluster = MockClusterClient::new();
        let mut passes = 0;
        cluster.expect_get_vm_export().times(3).returning(move |_, _| {
            passes += 1;
            Ok(match passes {
                1 => None,
                2 => Some(json!({"status": {"phase": "Pending"}})),
                _ => Some(fixtures::export()),
            })
        });
        cluster
            .expect_create_vm_export()
            .with(eq("apps"), eq("db-01"), eq("db-01"))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let client = client(cluster);
        assert!(!client.pre_transfer_actions(&vm_ref()).await.unwrap());
        assert!(!client.pre_transfer_actions(&vm_ref()).await.unwrap());
        assert!(client.pre_transfer_actions(&vm_ref()).await.unwrap());
    }

    #[tokio::test]
    async fn power_off_halts_through_run_strategy() {
        let mut cluster = fixtures::source_cluster(MockClusterClient::new());
        cluster
            .expect_patch_virtual_machine()
            .withf(|ns, name, patch| {
                ns == "apps"
                    && name == "db-01"
                    && patch["spec"]["runStrategy"] == "Halted"
                    && patch["spec"]["running"].is_null()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let client = client(cluster);
        assert_eq!(client.power_state(&vm_ref()).await.unwrap(), PowerState::On);
        client.power_off(&vm_ref()).await.unwrap();
    }

    #[tokio::test]
    async fn finalize_keeps_going_after_a_failed_delete() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_delete_vm_export()
            .with(eq("apps"), eq("db-01"))
            .times(1)
            .returning(|_, _| Err(Error::internal("forbidden")));
        cluster
            .expect_delete_vm_export()
            .with(eq("apps"), eq("db-02"))
            .times(1)
            .returning(|_, _| Ok(()));
        let statuses: Vec<VmStatus> = ["db-01", "db-02"]
            .iter()
            .map(|name| VmStatus {
                vm_ref: Ref {
                    name: name.to_string(),
                    namespace: "apps".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect();
        client(cluster).finalize(&statuses, "plan").await;
    }
}
