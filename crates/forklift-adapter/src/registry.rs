//! Adapter registry
//!
//! [`create_adapter`] is the only place that branches on provider kind. The
//! returned [`Adapter`] hands out the four collaborators for a plan context;
//! the factory calls do no I/O.

use std::sync::Arc;

use forklift_common::crd::{Provider, ProviderType};
use forklift_common::Result;

use crate::builder::Builder;
use crate::client::SourceClient;
use crate::context::PlanContext;
use crate::destination::DestinationClient;
use crate::providers::{
    DynamicAdapter, HypervAdapter, OcpAdapter, OpenstackAdapter, OvaAdapter, OvirtAdapter,
    VsphereAdapter,
};
use crate::validator::Validator;

/// Factory of provider-specific collaborators
pub trait Adapter: Send + Sync {
    /// Builder of destination drafts
    fn builder(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Builder>>;

    /// Driver of the source VM
    fn client(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn SourceClient>>;

    /// Policy checks for source VMs
    fn validator(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Validator>>;

    /// Provider-specific destination cleanup
    fn destination_client(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn DestinationClient>>;
}

/// Create the adapter for a source provider
///
/// Dynamic providers are rejected here when their schema misses a field of
/// the minimum contract, so a broken schema fails the plan once instead of
/// every VM.
pub fn create_adapter(provider: &Provider) -> Result<Box<dyn Adapter>> {
    match provider.provider_type() {
        ProviderType::Vsphere => Ok(Box::new(VsphereAdapter)),
        ProviderType::Ovirt => Ok(Box::new(OvirtAdapter)),
        ProviderType::OpenStack => Ok(Box::new(OpenstackAdapter)),
        ProviderType::Ova => Ok(Box::new(OvaAdapter)),
        ProviderType::Openshift => Ok(Box::new(OcpAdapter)),
        ProviderType::HyperV => Ok(Box::new(HypervAdapter)),
        ProviderType::Dynamic => {
            let schema = provider.schema();
            schema.validate()?;
            Ok(Box::new(DynamicAdapter::new(schema)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::context::testing::{context, provider};
    use crate::inventory::StaticInventory;
    use forklift_common::crd::ProviderSchema;

    fn ctx(type_: ProviderType) -> Arc<PlanContext> {
        Arc::new(context(
            type_,
            None,
            StaticInventory::default(),
            MockClusterClient::new(),
        ))
    }

    #[test]
    fn every_provider_kind_has_an_adapter() {
        for type_ in [
            ProviderType::Vsphere,
            ProviderType::Ovirt,
            ProviderType::OpenStack,
            ProviderType::Ova,
            ProviderType::Openshift,
            ProviderType::HyperV,
            ProviderType::Dynamic,
        ] {
            let adapter = create_adapter(&provider(type_, "https://source.example.com"))
                .unwrap_or_else(|e| panic!("{}: {}", type_, e));
            let ctx = ctx(type_);
            assert!(adapter.builder(ctx.clone()).is_ok(), "{} builder", type_);
            assert!(adapter.client(ctx.clone()).is_ok(), "{} client", type_);
            assert!(adapter.validator(ctx.clone()).is_ok(), "{} validator", type_);
            assert!(adapter.destination_client(ctx).is_ok(), "{} destination", type_);
        }
    }

    #[test]
    fn dynamic_schema_is_validated_up_front() {
        let mut schema = ProviderSchema::generic();
        schema.vm.required.remove("id");
        let mut p = provider(ProviderType::Dynamic, "http://xen-provider:8080");
        p.spec.schema = Some(schema);
        let err = create_adapter(&p).err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("VM.id"), "{}", err);
    }

    #[test]
    fn only_populator_providers_report_populators() {
        let ovirt = create_adapter(&provider(ProviderType::Ovirt, "https://engine/ovirt-engine/api"))
            .unwrap();
        let vsphere = create_adapter(&provider(ProviderType::Vsphere, "https://vcenter/sdk"))
            .unwrap();
        assert!(ovirt.builder(ctx(ProviderType::Ovirt)).unwrap().supports_volume_populators());
        assert!(!vsphere
            .builder(ctx(ProviderType::Vsphere))
            .unwrap()
            .supports_volume_populators());
    }
}
