//! OpenStack
//!
//! Disks are staged as Glance images before transfer (volumes are uploaded
//! through Cinder, image-booted root disks are snapshotted through Nova) and
//! then pulled into PVCs by `OpenstackVolumePopulator`s. Cold only.

mod api;
mod builder;
mod client;
mod model;

use std::sync::Arc;

use forklift_common::Result;

use crate::builder::Builder;
use crate::client::SourceClient;
use crate::cluster::PopulatorKind;
use crate::context::{PlanContext, SourceContext};
use crate::destination::{DestinationClient, PopulatorDestinationClient};
use crate::model::VmLoader;
use crate::registry::Adapter;
use crate::validator::{StandardValidator, Validator, ValidatorPolicy};

use api::{Credentials, HttpOpenstackApi};
use builder::OpenstackBuilder;
use client::OpenstackClient;
use model::OpenstackLoader;

/// Adapter for OpenStack providers
pub struct OpenstackAdapter;

fn credentials(source: &SourceContext) -> Credentials {
    let value = |key: &str| source.credential(key).unwrap_or_default();
    let domain = value("domainName");
    match value("authType").to_ascii_lowercase().as_str() {
        "applicationcredential" => Credentials::ApplicationCredential {
            id: value("applicationCredentialID"),
            secret: value("applicationCredentialSecret"),
        },
        "token" => Credentials::Token {
            token: value("token"),
            project: value("projectName"),
            project_domain: domain,
        },
        _ => Credentials::Password {
            user: value("username"),
            password: value("password"),
            domain: domain.clone(),
            project: value("projectName"),
            project_domain: domain,
        },
    }
}

impl Adapter for OpenstackAdapter {
    fn builder(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Builder>> {
        let loader = OpenstackLoader::new(ctx.source.inventory.clone());
        Ok(Box::new(OpenstackBuilder::new(ctx, loader)))
    }

    fn client(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn SourceClient>> {
        let source = &ctx.source;
        let api = HttpOpenstackApi::new(
            &source.provider.spec.url,
            credentials(source),
            source.credential("regionName").filter(|r| !r.is_empty()),
            source.insecure(),
        )?;
        let loader = OpenstackLoader::new(source.inventory.clone());
        Ok(Box::new(OpenstackClient::new(ctx, loader, Arc::new(api))))
    }

    fn validator(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Validator>> {
        let loader: Arc<dyn VmLoader> = Arc::new(OpenstackLoader::new(ctx.source.inventory.clone()));
        Ok(Box::new(StandardValidator::new(
            ctx,
            loader,
            ValidatorPolicy::cold_only(),
        )))
    }

    fn destination_client(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn DestinationClient>> {
        Ok(Box::new(PopulatorDestinationClient::new(
            ctx,
            PopulatorKind::Openstack,
        )))
    }
}
