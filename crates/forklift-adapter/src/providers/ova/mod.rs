//! OVA
//!
//! Appliances sit on an NFS share served by the OVA provider server, which
//! publishes their inventory in a fixed layout and serves each disk over
//! HTTP. An appliance has no running instance, so it is always off and power
//! operations do nothing. Cold only.

mod builder;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use forklift_common::crd::{PowerState, ProviderSchema, Ref};
use forklift_common::{Error, Result};

use super::dynamic::SchemaLoader;
use crate::builder::Builder;
use crate::client::SourceClient;
use crate::context::PlanContext;
use crate::destination::{DestinationClient, NoopDestinationClient};
use crate::inventory::Inventory;
use crate::model::{SourceVm, VmLoader};
use crate::registry::Adapter;
use crate::validator::{StandardValidator, Validator, ValidatorPolicy};

use builder::OvaBuilder;

/// Adapter for OVA providers
pub struct OvaAdapter;

/// Loads appliances through the OVA schema; they are always powered off
#[derive(Clone)]
pub(crate) struct OvaLoader {
    inner: SchemaLoader,
}

impl OvaLoader {
    pub fn new(inventory: Arc<dyn Inventory>) -> Self {
        Self {
            inner: SchemaLoader::new(ProviderSchema::ova(), inventory),
        }
    }

    /// The appliance and the path of its `.ova` file on the share
    pub async fn load_with_path(&self, vm: &Ref) -> Result<(SourceVm, String)> {
        let object = self.inner.object(vm).await?;
        let mut source = self.inner.source_vm(&object)?;
        source.power_state = PowerState::Off;
        let path = self.inner.string_field(&object, "ovaPath").unwrap_or_default();
        Ok((source, path))
    }
}

#[async_trait]
impl VmLoader for OvaLoader {
    async fn load(&self, vm: &Ref) -> Result<SourceVm> {
        Ok(self.load_with_path(vm).await?.0)
    }
}

struct OvaClient;

#[async_trait]
impl SourceClient for OvaClient {
    async fn power_state(&self, _vm: &Ref) -> Result<PowerState> {
        Ok(PowerState::Off)
    }

    async fn power_on(&self, vm: &Ref) -> Result<()> {
        debug!(vm = %vm, "appliances cannot be powered on");
        Ok(())
    }

    async fn power_off(&self, vm: &Ref) -> Result<()> {
        debug!(vm = %vm, "appliance is already off");
        Ok(())
    }
}

impl Adapter for OvaAdapter {
    fn builder(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Builder>> {
        let provider = &ctx.source.provider;
        let server = provider.service_url().ok_or_else(|| {
            Error::validation_for_field(
                provider.metadata.name.clone().unwrap_or_default(),
                "status.service",
                "OVA provider server has no service and no URL",
            )
        })?;
        let loader = OvaLoader::new(ctx.source.inventory.clone());
        Ok(Box::new(OvaBuilder::new(ctx, loader, server)))
    }

    fn client(&self, _ctx: Arc<PlanContext>) -> Result<Box<dyn SourceClient>> {
        Ok(Box::new(OvaClient))
    }

    fn validator(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Validator>> {
        let loader: Arc<dyn VmLoader> = Arc::new(OvaLoader::new(ctx.source.inventory.clone()));
        Ok(Box::new(StandardValidator::new(
            ctx,
            loader,
            ValidatorPolicy::cold_only(),
        )))
    }

    fn destination_client(&self, _ctx: Arc<PlanContext>) -> Result<Box<dyn DestinationClient>> {
        Ok(Box::new(NoopDestinationClient))
    }
}
