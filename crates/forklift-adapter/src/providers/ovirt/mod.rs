//! oVirt / Red Hat Virtualization
//!
//! Cold migrations to the local cluster fill disks with volume populators;
//! other plans import through CDI's imageio source. Warm precopies are
//! engine snapshots whose disk image IDs serve as checkpoints.

mod api;
mod builder;
mod client;
mod model;

use std::sync::Arc;

use forklift_common::Result;

use crate::builder::Builder;
use crate::client::SourceClient;
use crate::cluster::PopulatorKind;
use crate::context::PlanContext;
use crate::destination::{DestinationClient, PopulatorDestinationClient};
use crate::model::VmLoader;
use crate::registry::Adapter;
use crate::validator::{StandardValidator, Validator, ValidatorPolicy};

use api::HttpOvirtApi;
use builder::OvirtBuilder;
use client::OvirtClient;
use model::OvirtLoader;

/// Adapter for oVirt providers
pub struct OvirtAdapter;

impl Adapter for OvirtAdapter {
    fn builder(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Builder>> {
        let loader = OvirtLoader::new(ctx.source.inventory.clone());
        Ok(Box::new(OvirtBuilder::new(ctx, loader)))
    }

    fn client(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn SourceClient>> {
        let source = &ctx.source;
        let api = HttpOvirtApi::new(
            &source.provider.spec.url,
            source.credential("user").unwrap_or_default(),
            source.credential("password").unwrap_or_default(),
            source.insecure(),
        )?;
        let loader = OvirtLoader::new(source.inventory.clone());
        Ok(Box::new(OvirtClient::new(ctx, loader, Arc::new(api))))
    }

    fn validator(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Validator>> {
        let loader: Arc<dyn VmLoader> = Arc::new(OvirtLoader::new(ctx.source.inventory.clone()));
        Ok(Box::new(StandardValidator::new(
            ctx,
            loader,
            ValidatorPolicy::cold_and_warm(),
        )))
    }

    fn destination_client(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn DestinationClient>> {
        Ok(Box::new(PopulatorDestinationClient::new(
            ctx,
            PopulatorKind::Ovirt,
        )))
    }
}
