//! OpenShift Virtualization
//!
//! Source VMs are KubeVirt VMs on another (or the same) cluster, addressed
//! by `namespace/name`. Each is exported through a `VirtualMachineExport`
//! whose links CDI downloads with the export token. Cold only.

mod builder;
mod client;
mod model;

use std::sync::Arc;

use forklift_common::Result;

use crate::builder::Builder;
use crate::client::SourceClient;
use crate::cluster::ClusterClient;
use crate::context::PlanContext;
use crate::destination::{DestinationClient, NoopDestinationClient};
use crate::model::VmLoader;
use crate::registry::Adapter;
use crate::validator::{StandardValidator, Validator, ValidatorPolicy};

use builder::OcpBuilder;
use client::OcpClient;
use model::OcpLoader;

/// Adapter for OpenShift providers
pub struct OcpAdapter;

/// The source cluster; a host provider is the destination cluster itself
fn source_cluster(ctx: &PlanContext) -> Arc<dyn ClusterClient> {
    ctx.source
        .cluster
        .clone()
        .unwrap_or_else(|| ctx.destination.cluster.clone())
}

impl Adapter for OcpAdapter {
    fn builder(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Builder>> {
        let loader = OcpLoader::new(source_cluster(&ctx));
        Ok(Box::new(OcpBuilder::new(ctx, loader)))
    }

    fn client(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn SourceClient>> {
        Ok(Box::new(OcpClient::new(OcpLoader::new(source_cluster(&ctx)))))
    }

    fn validator(&self, ctx: Arc<PlanContext>) -> Result<Box<dyn Validator>> {
        let loader: Arc<dyn VmLoader> = Arc::new(OcpLoader::new(source_cluster(&ctx)));
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
