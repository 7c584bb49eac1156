//! Dynamic providers
//!
//! A dynamic provider has no compiled-in model. Its inventory is read through
//! a [`ProviderSchema`] and the provider server answers the questions a
//! static adapter would answer in-process.

mod accessor;
mod builder;
mod loader;
mod service;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use forklift_common::crd::{MigrationType, PowerState, ProviderSchema, Ref};
use forklift_common::{Error, Result};

pub use accessor::Accessor;
pub use builder::DynamicBuilder;
pub use loader::{resource_capacity, SchemaLoader};
pub use service::{
    BuildSpecMetadata, BuildSpecRequest, BuildSpecResponse, DataVolumeSourceRequest,
    DataVolumeSourceResponse, DynamicService, HttpDynamicService, PlanIdentity,
    RemoteVirtualMachine,
};

use crate::builder::Builder;
use crate::client::SourceClient;
use crate::context::PlanContext;
use crate::destination::{DestinationClient, NoopDestinationClient};
use crate::model::VmLoader;
use crate::registry::Adapter;
use crate::validator::{StandardValidator, Validator, ValidatorPolicy};

/// Adapter for providers described by a schema
pub struct DynamicAdapter {
    schema: ProviderSchema,
}

impl DynamicAdapter {
    /// Adapter reading inventory through `schema`
    pub fn new(schema: ProviderSchema) -> Self {
        Self { schema }
    }

    fn loader(&self, ctx: &PlanContext) -> SchemaLoader {
        SchemaLoader::new(self.schema.clone(), ctx.source.inventory.clone())
    }
}

impl Adapter for DynamicAdapter {
    fn builder(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Builder>> {
        let provider = &ctx.source.provider;
        let base_url = provider.service_url().ok_or_else(|| {
            Error::validation_for_field(
                provider.metadata.name.clone().unwrap_or_default(),
                "status.service",
                "dynamic provider has no service and no URL",
            )
        })?;
        let service = HttpDynamicService::new(&base_url, ctx.settings.dynamic_provider_timeout)?;
        let loader = self.loader(&ctx);
        Ok(Box::new(DynamicBuilder::new(ctx, loader, Arc::new(service))))
    }

    fn client(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn SourceClient>> {
        Ok(Box::new(DynamicClient {
            loader: self.loader(&ctx),
        }))
    }

    fn validator(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Validator>> {
        let mut policy = ValidatorPolicy::cold_only();
        for type_ in ctx.source.provider.features().supported_migration_types {
            if !policy.migration_types.contains(&type_) {
                policy.migration_types.push(type_);
            }
        }
        let loader: Arc<dyn VmLoader> = Arc::new(self.loader(&ctx));
        Ok(Box::new(StandardValidator::new(ctx, loader, policy)))
    }

    fn destination_client(&self, _ctx: Arc<PlanContext>) -> Result<Box<dyn DestinationClient>> {
        Ok(Box::new(NoopDestinationClient))
    }
}

/// Source client for dynamic providers
///
/// The provider server owns the VM; the controller only observes power state.
struct DynamicClient {
    loader: SchemaLoader,
}

#[async_trait]
impl SourceClient for DynamicClient {
    async fn power_state(&self, vm: &Ref) -> Result<PowerState> {
        Ok(self.loader.load(vm).await?.power_state)
    }

    async fn power_on(&self, vm: &Ref) -> Result<()> {
        debug!(vm = %vm, "power on left to the dynamic provider");
        Ok(())
    }

    async fn power_off(&self, vm: &Ref) -> Result<()> {
        debug!(vm = %vm, "power off left to the dynamic provider");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterClient;
    use crate::context::testing::context;
    use crate::inventory::{StaticInventory, VMS};
    use forklift_common::crd::{ProviderFeatures, ProviderStatus, ProviderType};
    use serde_json::json;

    fn ctx(features: ProviderFeatures) -> Arc<PlanContext> {
        let inventory = StaticInventory::default().with(
            VMS,
            json!({"id": "vm-1", "name": "web-01", "powerState": "poweredOff"}),
        );
        let mut ctx = context(
            ProviderType::Dynamic,
            Some(MigrationType::Warm),
            inventory,
            MockClusterClient::new(),
        );
        ctx.source.provider.status = Some(ProviderStatus {
            features: Some(features),
            ..Default::default()
        });
        Arc::new(ctx)
    }

    #[tokio::test]
    async fn power_state_comes_from_inventory() {
        let adapter = DynamicAdapter::new(ProviderSchema::generic());
        let client = adapter.client(ctx(ProviderFeatures::default())).unwrap();
        let vm = Ref::with_id("vm-1");
        assert_eq!(client.power_state(&vm).await.unwrap(), PowerState::Off);
        assert!(client.powered_off(&vm).await.unwrap());
        client.power_on(&vm).await.unwrap();
    }

    #[test]
    fn warm_follows_advertised_features() {
        let adapter = DynamicAdapter::new(ProviderSchema::generic());
        let cold = adapter.validator(ctx(ProviderFeatures::default())).unwrap();
        assert!(!cold.warm_migration());

        let warm = adapter
            .validator(ctx(ProviderFeatures {
                supported_migration_types: vec![MigrationType::Warm],
                ..Default::default()
            }))
            .unwrap();
        assert!(warm.warm_migration());
        assert!(warm.migration_type());
    }

    #[test]
    fn builder_needs_an_endpoint() {
        let adapter = DynamicAdapter::new(ProviderSchema::generic());
        let ctx = ctx(ProviderFeatures::default());
        let mut bare = (*ctx).clone();
        bare.source.provider.spec.url = String::new();
        assert!(adapter.builder(ctx).is_ok());
        assert!(adapter.builder(Arc::new(bare)).is_err());
    }
}
