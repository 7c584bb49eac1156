//! Plan execution context
//!
//! A [`PlanContext`] is the resolved snapshot of everything a migration needs:
//! the Plan and Migration, both providers, the two maps, the source
//! credentials and the seams used to reach inventory and the clusters. It is
//! built once per reconcile and shared by every collaborator.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;

use forklift_common::crd::{
    MigrationType, Migration, NetworkMap, Plan, PlanVm, Provider, ProviderType, Ref, StorageMap,
};
use forklift_common::labels::OwnerLabels;
use forklift_common::template::vm_safe_name;

use crate::cluster::ClusterClient;
use crate::inventory::Inventory;
use crate::providers::secret_value;

/// Default interval between warm precopies
pub const DEFAULT_PRECOPY_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Default number of warm precopies before cutover
pub const DEFAULT_MAX_PRECOPIES: u32 = 5;
/// Hard timeout for dynamic provider calls
pub const DEFAULT_DYNAMIC_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Controller settings the adapters consume
#[derive(Clone, Debug)]
pub struct AdapterSettings {
    /// Image running virt-v2v and the convert Job
    pub virt_v2v_image: String,
    /// Interval between warm precopies
    pub precopy_interval: Duration,
    /// Warm precopies before cutover
    pub max_precopies: u32,
    /// Timeout for dynamic provider HTTP calls
    pub dynamic_provider_timeout: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            virt_v2v_image: "quay.io/kubev2v/forklift-virt-v2v:latest".to_string(),
            precopy_interval: DEFAULT_PRECOPY_INTERVAL,
            max_precopies: DEFAULT_MAX_PRECOPIES,
            dynamic_provider_timeout: DEFAULT_DYNAMIC_TIMEOUT,
        }
    }
}

/// The source side of a plan
#[derive(Clone)]
pub struct SourceContext {
    /// Source provider
    pub provider: Provider,
    /// Provider credentials
    pub secret: Option<Secret>,
    /// Inventory of the source provider
    pub inventory: Arc<dyn Inventory>,
    /// Source cluster, for KubeVirt sources
    pub cluster: Option<Arc<dyn ClusterClient>>,
}

impl SourceContext {
    /// A credential value from the provider secret
    pub fn credential(&self, key: &str) -> Option<String> {
        self.secret
            .as_ref()
            .and_then(|s| secret_value(s, key))
    }

    /// Whether TLS verification is disabled for the provider
    pub fn insecure(&self) -> bool {
        self.credential("insecureSkipVerify")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Name of the provider secret
    pub fn secret_name(&self) -> String {
        self.secret
            .as_ref()
            .and_then(|s| s.metadata.name.clone())
            .unwrap_or_default()
    }
}

/// The destination side of a plan
#[derive(Clone)]
pub struct DestinationContext {
    /// Destination provider
    pub provider: Provider,
    /// Destination cluster
    pub cluster: Arc<dyn ClusterClient>,
}

/// Everything a migration needs, resolved once per reconcile
#[derive(Clone)]
pub struct PlanContext {
    /// The plan being executed
    pub plan: Plan,
    /// The migration running it
    pub migration: Migration,
    /// Source side
    pub source: SourceContext,
    /// Destination side
    pub destination: DestinationContext,
    /// Resolved network map
    pub network_map: NetworkMap,
    /// Resolved storage map
    pub storage_map: StorageMap,
    /// Controller settings
    pub settings: AdapterSettings,
}

impl PlanContext {
    /// Plan UID
    pub fn plan_uid(&self) -> &str {
        self.plan.metadata.uid.as_deref().unwrap_or_default()
    }

    /// Plan name
    pub fn plan_name(&self) -> &str {
        self.plan.metadata.name.as_deref().unwrap_or_default()
    }

    /// Plan namespace
    pub fn plan_namespace(&self) -> &str {
        self.plan.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// Migration UID
    pub fn migration_uid(&self) -> &str {
        self.migration.metadata.uid.as_deref().unwrap_or_default()
    }

    /// Namespace receiving the migrated VMs
    pub fn target_namespace(&self) -> &str {
        &self.plan.spec.target_namespace
    }

    /// Effective migration type
    pub fn migration_type(&self) -> MigrationType {
        self.plan.spec.migration_type()
    }

    /// Whether this is a cold migration
    pub fn is_cold(&self) -> bool {
        self.migration_type() == MigrationType::Cold
    }

    /// Whether this is a warm migration
    pub fn is_warm(&self) -> bool {
        self.plan.spec.is_warm()
    }

    /// Source provider kind
    pub fn source_type(&self) -> ProviderType {
        self.source.provider.provider_type()
    }

    /// Owner label triple for a VM
    pub fn owner_labels(&self, vm: &Ref) -> OwnerLabels {
        OwnerLabels::new(self.plan_uid(), self.migration_uid(), vm.id.clone())
    }

    /// Transfer network as `namespace/name`, if the plan sets one
    pub fn transfer_network(&self) -> Option<String> {
        self.plan.spec.transfer_network.as_ref().map(|r| {
            format!("{}/{}", r.namespace_or(self.plan_namespace()), r.name)
        })
    }

    /// The plan entry for a VM
    pub fn plan_vm(&self, vm: &Ref) -> Option<&PlanVm> {
        self.plan.spec.find_vm(vm)
    }

    /// Destination name for a VM: the plan's target name, else a safe
    /// rendition of the source name
    pub fn target_vm_name(&self, vm: &Ref, source_name: &str) -> String {
        self.plan_vm(vm)
            .and_then(|v| v.target_name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| vm_safe_name(&source_name.to_lowercase()))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::inventory::StaticInventory;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    #[test]
    fn owner_labels_use_plan_and_migration_uids() {
        let ctx = context(
            ProviderType::Vsphere,
            None,
            StaticInventory::default(),
            MockClusterClient::new(),
        );
        let labels = ctx.owner_labels(&Ref::with_id("vm-1"));
        assert_eq!(labels.plan, "plan-1-uid");
        assert_eq!(labels.migration, "migration-1-uid");
        assert_eq!(labels.vm_id, "vm-1");
        assert!(ctx.is_cold());
    }

    #[test]
    fn target_name_prefers_plan_entry() {
        let mut ctx = context(
            ProviderType::Vsphere,
            None,
            StaticInventory::default(),
            MockClusterClient::new(),
        );
        let vm = Ref::new("vm-1", "web-01");
        assert_eq!(ctx.target_vm_name(&vm, "Web.01"), "web-01");

        ctx.plan.spec.vms[0].target_name = Some("frontend".to_string());
        assert_eq!(ctx.target_vm_name(&vm, "Web.01"), "frontend");
    }

    #[test]
    fn credentials_read_from_data_then_string_data() {
        let mut ctx = context(
            ProviderType::Ovirt,
            None,
            StaticInventory::default(),
            MockClusterClient::new(),
        );
        ctx.source.secret = Some(Secret {
            data: Some(BTreeMap::from([(
                "user".to_string(),
                ByteString(b"admin@internal".to_vec()),
            )])),
            string_data: Some(BTreeMap::from([(
                "insecureSkipVerify".to_string(),
                "TRUE".to_string(),
            )])),
            ..Default::default()
        });
        assert_eq!(
            ctx.source.credential("user").as_deref(),
            Some("admin@internal")
        );
        assert!(ctx.source.insecure());
        assert!(ctx.source.credential("password").is_none());
    }
}
