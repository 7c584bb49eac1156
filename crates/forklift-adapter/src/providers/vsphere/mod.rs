//! VMware vSphere
//!
//! Disks are copied by CDI's VDDK importer; warm migrations take a snapshot
//! per precopy and hand the change IDs to the importers as checkpoints.

mod api;
mod builder;
mod client;
mod model;

use std::sync::Arc;

use forklift_common::Result;

use crate::builder::Builder;
use crate::client::SourceClient;
use crate::context::PlanContext;
use crate::destination::{DestinationClient, NoopDestinationClient};
use crate::model::VmLoader;
use crate::registry::Adapter;
use crate::validator::{StandardValidator, Validator, ValidatorPolicy};

use api::HttpVsphereApi;
use builder::VsphereBuilder;
use client::VsphereClient;
use model::VsphereLoader;

/// Adapter for vSphere providers
pub struct VsphereAdapter;

fn loader(ctx: &PlanContext) -> VsphereLoader {
    VsphereLoader::new(ctx.source.inventory.clone(), ctx.is_warm())
}

impl Adapter for VsphereAdapter {
    fn builder(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Builder>> {
        let loader = loader(&ctx);
        Ok(Box::new(VsphereBuilder::new(ctx, loader)))
    }

    fn client(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn SourceClient>> {
        let source = &ctx.source;
        let api = HttpVsphereApi::new(
            &source.provider.spec.url,
            source.credential("user").unwrap_or_default(),
            source.credential("password").unwrap_or_default(),
            source.insecure(),
        )?;
        let loader = loader(&ctx);
        Ok(Box::new(VsphereClient::new(ctx, loader, Arc::new(api))))
    }

    fn validator(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Validator>> {
        let loader: Arc<dyn VmLoader> = Arc::new(loader(&ctx));
        Ok(Box::new(StandardValidator::new(
            ctx,
            loader,
            ValidatorPolicy::cold_and_warm(),
        )))
    }

    fn destination_client(&self, _ctx: Arc<PlanContext>) -> Result<Box<dyn DestinationClient>> {
        Ok(Box::new(NoopDestinationClient))
    }
}
