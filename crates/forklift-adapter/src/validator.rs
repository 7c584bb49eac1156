//! The Validator collaborator
//!
//! Each check answers `(ok, err)`: an error means the check could not be
//! evaluated (requeue), `ok == false` means the VM gets a concern. Most
//! providers share [`StandardValidator`], which evaluates the pure checks in
//! [`crate::checks`] against the provider's [`VmLoader`].

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use forklift_common::crd::{MigrationType, Ref};
use forklift_common::Result;

use crate::checks;
use crate::context::PlanContext;
use crate::mac::{self, MacConflict};
use crate::model::VmLoader;

/// Policy questions about a VM
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Validator: Send + Sync {
    /// Every disk's storage is mapped
    async fn storage_mapped(&self, vm: &Ref) -> Result<bool>;

    /// Every NIC's network is mapped
    async fn networks_mapped(&self, vm: &Ref) -> Result<bool>;

    /// At most one NIC maps to the pod network
    async fn pod_network(&self, vm: &Ref) -> Result<bool>;

    /// The VM's host is not in maintenance
    async fn maintenance_mode(&self, vm: &Ref) -> Result<bool>;

    /// The provider supports warm migration, when requested
    fn warm_migration(&self) -> bool;

    /// The provider supports the plan's migration type
    fn migration_type(&self) -> bool;

    /// Static IP information is available when the plan preserves IPs
    async fn static_ips(&self, vm: &Ref) -> Result<bool>;

    /// A VM on a user-defined network has an IP inside the subnet
    async fn udn_subnet(&self, _vm: &Ref) -> Result<bool> {
        Ok(true)
    }

    /// Shared-disk policy; the message explains a failure
    async fn shared_disks(&self, vm: &Ref) -> Result<(bool, String)>;

    /// Changed block tracking is enabled (warm only)
    async fn change_tracking_enabled(&self, vm: &Ref) -> Result<bool>;

    /// The VM has no pre-existing snapshot (warm only)
    async fn has_snapshot(&self, vm: &Ref) -> Result<(bool, String)>;

    /// The power state fits the migration type
    async fn power_state(&self, vm: &Ref) -> Result<bool>;

    /// The VM can be migrated at all
    async fn compatible(&self, _vm: &Ref) -> Result<bool> {
        Ok(true)
    }

    /// Disks that cannot be migrated
    async fn unsupported_disks(&self, vm: &Ref) -> Result<Vec<String>>;

    /// Disks with invalid sizes
    async fn invalid_disk_sizes(&self, vm: &Ref) -> Result<Vec<String>>;

    /// Source MACs already used by destination VMs (skipped for cold)
    async fn mac_conflicts(&self, vm: &Ref) -> Result<Vec<MacConflict>>;

    /// The PVC name template renders a valid name
    async fn pvc_name_template(&self, vm: &Ref, template: &str) -> Result<bool>;

    /// Direct-storage information is present
    async fn direct_storage(&self, _vm: &Ref) -> Result<bool> {
        Ok(true)
    }

    /// The per-VM migration type is allowed
    async fn vm_migration_type(&self, _vm: &Ref) -> Result<bool> {
        Ok(true)
    }
}

/// What a provider supports
#[derive(Clone, Debug)]
pub struct ValidatorPolicy {
    /// Migration types the provider can perform
    pub migration_types: Vec<MigrationType>,
    /// Disk formats the provider can import; empty accepts any
    pub disk_formats: Vec<&'static str>,
}

impl ValidatorPolicy {
    /// Cold only
    pub fn cold_only() -> Self {
        Self {
            migration_types: vec![MigrationType::Cold],
            disk_formats: Vec::new(),
        }
    }

    /// Cold and warm
    pub fn cold_and_warm() -> Self {
        Self {
            migration_types: vec![MigrationType::Cold, MigrationType::Warm],
            disk_formats: Vec::new(),
        }
    }

    /// Restrict the accepted disk formats
    pub fn with_disk_formats(mut self, formats: &[&'static str]) -> Self {
        self.disk_formats = formats.to_vec();
        self
    }
}

/// Validator over a provider's [`VmLoader`]
pub struct StandardValidator {
    ctx: Arc<PlanContext>,
    loader: Arc<dyn VmLoader>,
    policy: ValidatorPolicy,
}

impl StandardValidator {
    /// Validate VMs loaded by `loader` under `policy`
    pub fn new(ctx: Arc<PlanContext>, loader: Arc<dyn VmLoader>, policy: ValidatorPolicy) -> Self {
        Self {
            ctx,
            loader,
            policy,
        }
    }
}

#[async_trait]
impl Validator for StandardValidator {
    async fn storage_mapped(&self, vm: &Ref) -> Result<bool> {
        let vm = self.loader.load(vm).await?;
        Ok(checks::storage_mapped(&vm, &self.ctx.storage_map))
    }

    async fn networks_mapped(&self, vm: &Ref) -> Result<bool> {
        let vm = self.loader.load(vm).await?;
        Ok(checks::networks_mapped(&vm, &self.ctx.network_map))
    }

    async fn pod_network(&self, vm: &Ref) -> Result<bool> {
        let vm = self.loader.load(vm).await?;
        Ok(checks::pod_network(&vm, &self.ctx.network_map))
    }

    async fn maintenance_mode(&self, vm: &Ref) -> Result<bool> {
        let vm = self.loader.load(vm).await?;
        self.loader.host_ready(&vm).await
    }

    fn warm_migration(&self) -> bool {
        !self.ctx.is_warm() || self.policy.migration_types.contains(&MigrationType::Warm)
    }

    fn migration_type(&self) -> bool {
        self.policy
            .migration_types
            .contains(&self.ctx.migration_type())
    }

    async fn static_ips(&self, vm: &Ref) -> Result<bool> {
        let vm = self.loader.load(vm).await?;
        Ok(checks::static_ips(&vm, &self.ctx.plan.spec))
    }

    async fn shared_disks(&self, vm: &Ref) -> Result<(bool, String)> {
        let vm = self.loader.load(vm).await?;
        Ok(match checks::shared_disks(&vm, &self.ctx.plan.spec) {
            Ok(()) => (true, String::new()),
            Err(msg) => (false, msg),
        })
    }

    async fn change_tracking_enabled(&self, vm: &Ref) -> Result<bool> {
        let vm = self.loader.load(vm).await?;
        Ok(checks::change_tracking(&vm, self.ctx.migration_type()))
    }

    async fn has_snapshot(&self, vm: &Ref) -> Result<(bool, String)> {
        let vm = self.loader.load(vm).await?;
        Ok(match checks::snapshots(&vm, self.ctx.migration_type()) {
            Ok(()) => (true, String::new()),
            Err(msg) => (false, msg),
        })
    }

    async fn power_state(&self, vm: &Ref) -> Result<bool> {
        let vm = self.loader.load(vm).await?;
        Ok(checks::power_state(&vm, self.ctx.migration_type()))
    }

    async fn unsupported_disks(&self, vm: &Ref) -> Result<Vec<String>> {
        if self.policy.disk_formats.is_empty() {
            return Ok(Vec::new());
        }
        let vm = self.loader.load(vm).await?;
        Ok(checks::unsupported_disks(&vm, &self.policy.disk_formats))
    }

    async fn invalid_disk_sizes(&self, vm: &Ref) -> Result<Vec<String>> {
        let vm = self.loader.load(vm).await?;
        Ok(checks::invalid_disk_sizes(&vm))
    }

    async fn mac_conflicts(&self, vm: &Ref) -> Result<Vec<MacConflict>> {
        if self.ctx.is_cold() {
            return Ok(Vec::new());
        }
        let vm = self.loader.load(vm).await?;
        mac::check_conflicts(&self.ctx, &vm.macs()).await
    }

    async fn pvc_name_template(&self, vm: &Ref, template: &str) -> Result<bool> {
        let source = self.loader.load(vm).await?;
        let target = self.ctx.target_vm_name(vm, &source.name);
        Ok(checks::pvc_name_template(
            &source,
            self.ctx.plan_name(),
            &target,
            template,
            self.ctx.plan.spec.pvc_name_template_use_generate_name,
        )
        .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::context::testing::context;
    use crate::inventory::StaticInventory;
    use crate::model::{MockVmLoader, SourceDisk, SourceNic, SourceVm};
    use forklift_common::crd::ProviderType;

    fn loader() -> MockVmLoader {
        let mut loader = MockVmLoader::new();
        loader.expect_load().returning(|r| {
            Ok(SourceVm {
                id: r.id.clone(),
                name: "web".to_string(),
                disks: vec![SourceDisk {
                    id: "disk-0".to_string(),
                    capacity_bytes: 1 << 30,
                    storage: Ref::with_id("ds-1"),
                    ..Default::default()
                }],
                nics: vec![SourceNic {
                    mac: "00:11:22:33:44:55".to_string(),
                    network: Ref::with_id("net-1"),
                    ..Default::default()
                }],
                ..Default::default()
            })
        });
        loader.expect_host_ready().returning(|_| Ok(false));
        loader
    }

    fn validator(
        migration_type: MigrationType,
        cluster: MockClusterClient,
        policy: ValidatorPolicy,
    ) -> StandardValidator {
        let ctx = Arc::new(context(
            ProviderType::Vsphere,
            Some(migration_type),
            StaticInventory::default(),
            cluster,
        ));
        StandardValidator::new(ctx, Arc::new(loader()), policy)
    }

    // ==========================================================================
    // Story Tests: Validating a Warm vSphere VM
    // ==========================================================================

    /// Story: a mapped VM passes mapping checks but a warm migration without
    /// CBT and with a host in maintenance raises concerns
    #[tokio::test]
    async fn story_warm_vm_without_cbt() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_list_virtual_machines()
            .returning(|_, _| Ok(vec![]));
        let v = validator(
            MigrationType::Warm,
            cluster,
            ValidatorPolicy::cold_and_warm(),
        );
        let vm = Ref::with_id("vm-1");

        assert!(v.storage_mapped(&vm).await.unwrap());
        assert!(v.networks_mapped(&vm).await.unwrap());
        assert!(v.pod_network(&vm).await.unwrap());
        assert!(v.warm_migration());
        assert!(v.migration_type());
        assert!(!v.change_tracking_enabled(&vm).await.unwrap());
        assert!(!v.maintenance_mode(&vm).await.unwrap());
        assert!(v.mac_conflicts(&vm).await.unwrap().is_empty());
        assert!(v.invalid_disk_sizes(&vm).await.unwrap().is_empty());
        assert_eq!(v.has_snapshot(&vm).await.unwrap(), (true, String::new()));
    }

    /// Story: a cold-only provider rejects a warm plan
    #[tokio::test]
    async fn story_cold_only_provider_rejects_warm() {
        let v = validator(
            MigrationType::Warm,
            MockClusterClient::new(),
            ValidatorPolicy::cold_only(),
        );
        assert!(!v.warm_migration());
        assert!(!v.migration_type());
    }

    #[tokio::test]
    async fn cold_migration_never_lists_destination() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_virtual_machines().never();
        let v = validator(MigrationType::Cold, cluster, ValidatorPolicy::cold_only());
        assert!(v.mac_conflicts(&Ref::with_id("vm-1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disk_formats_checked_only_when_restricted() {
        let v = validator(
            MigrationType::Cold,
            MockClusterClient::new(),
            ValidatorPolicy::cold_only().with_disk_formats(&["qcow2"]),
        );
        // format unknown on the sample disk: accepted
        assert!(v
            .unsupported_disks(&Ref::with_id("vm-1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn pvc_template_check_uses_target_name() {
        let v = validator(
            MigrationType::Cold,
            MockClusterClient::new(),
            ValidatorPolicy::cold_only(),
        );
        let vm = Ref::with_id("vm-1");
        assert!(v
            .pvc_name_template(&vm, "{{.TargetVmName}}-{{.DiskIndex}}")
            .await
            .unwrap());
        assert!(!v.pvc_name_template(&vm, "{{.PlanName}}_bad").await.unwrap());
    }
}
