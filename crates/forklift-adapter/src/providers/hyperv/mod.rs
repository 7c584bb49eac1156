//! Hyper-V
//!
//! Inventory comes from the Hyper-V provider server in the generic layout,
//! with each disk's SMB path as its file. Power state is read from
//! inventory; power-off is requested from the provider server. Cold only, so
//! every snapshot operation keeps its benign default.

mod builder;
mod server;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use forklift_common::crd::{PowerState, ProviderSchema, Ref};
use forklift_common::{Error, Result};

use super::dynamic::SchemaLoader;
use crate::builder::Builder;
use crate::client::SourceClient;
use crate::context::PlanContext;
use crate::destination::{DestinationClient, NoopDestinationClient};
use crate::model::VmLoader;
use crate::registry::Adapter;
use crate::validator::{StandardValidator, Validator, ValidatorPolicy};

use builder::HypervBuilder;
use server::{HttpHypervServer, HypervServer};

/// Adapter for Hyper-V providers
pub struct HypervAdapter;

/// The generic schema with disk files read from `smbPath`
pub(crate) fn hyperv_schema() -> ProviderSchema {
    let mut schema = ProviderSchema::generic();
    schema
        .disk
        .fields
        .insert("filePath".to_string(), "smbPath".to_string());
    schema
}

fn loader(ctx: &PlanContext) -> SchemaLoader {
    SchemaLoader::new(hyperv_schema(), ctx.source.inventory.clone())
}

struct HypervClient {
    loader: SchemaLoader,
    server: Arc<dyn HypervServer>,
}

#[async_trait]
impl SourceClient for HypervClient {
    async fn power_state(&self, vm: &Ref) -> Result<PowerState> {
        Ok(self.loader.load(vm).await?.power_state)
    }

    async fn power_on(&self, vm: &Ref) -> Result<()> {
        debug!(vm = %vm, "power on is not needed for Hyper-V");
        Ok(())
    }

    async fn power_off(&self, vm: &Ref) -> Result<()> {
        let source = self.loader.load(vm).await?;
        if source.power_state == PowerState::Off {
            info!(vm = %source.name, "VM already powered off");
            return Ok(());
        }
        self.server.stop_vm(&source.id, &source.name).await?;
        info!(vm = %source.name, "powered off VM");
        Ok(())
    }
}

impl Adapter for HypervAdapter {
    fn builder(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Builder>> {
        let loader = loader(&ctx);
        Ok(Box::new(HypervBuilder::new(ctx, loader)))
    }

    fn client(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn SourceClient>> {
        let provider = &ctx.source.provider;
        let base_url = provider.service_url().ok_or_else(|| {
            Error::validation_for_field(
                provider.metadata.name.clone().unwrap_or_default(),
                "status.service",
                "Hyper-V provider server has no service and no URL",
            )
        })?;
        let server = HttpHypervServer::new(&base_url, ctx.settings.dynamic_provider_timeout)?;
        Ok(Box::new(HypervClient {
            loader: loader(&ctx),
            server: Arc::new(server),
        }))
    }

    fn validator(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Validator>> {
        let loader: Arc<dyn VmLoader> = Arc::new(loader(&ctx));
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


#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::hyperv::server::MockHypervServer;
    use mockall::predicate::eq;

    fn client(server: MockHypervServer) -> HypervClient {
        HypervClient {
            loader: SchemaLoader::new(hyperv_schema(), Arc::new(fixtures::inventory())),
            server: Arc::new(server),
        }
    }

    #[tokio::test]
    async fn power_off_asks_the_provider_server() {
        let mut server = MockHypervServer::new();
        server
            .expect_stop_vm()
            .with(eq("vm-1"), eq("dc-01"))
            .times(1)
            .returning(|_, _| Ok(()));
        let client = client(server);
        let vm = Ref::with_id("vm-1");
        assert_eq!(client.power_state(&vm).await.unwrap(), PowerState::On);
        client.power_off(&vm).await.unwrap();
    }

    #[tokio::test]
    async fn stopped_vm_is_left_alone() {
        let mut server = MockHypervServer::new();
        server.expect_stop_vm().never();
        let client = client(server);
        let vm = Ref::with_id("vm-2");
        client.power_off(&vm).await.unwrap();
        assert!(client.powered_off(&vm).await.unwrap());
    }

    #[tokio::test]
    async fn warm_operations_are_benign() {
        let client = client(MockHypervServer::new());
        let vm = Ref::with_id("vm-1");
        assert!(client.pre_transfer_actions(&vm).await.unwrap());
        client.detach_disks(&vm).await.unwrap();
    }
}
