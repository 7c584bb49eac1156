//! Provider adapters for the Forklift migration controller
//!
//! An [`Adapter`] manufactures the four provider-specific collaborators the
//! migration pipeline drives: a [`Builder`] that turns source inventory into
//! destination drafts, a [`SourceClient`] that drives the source VM, a
//! [`Validator`] that answers policy questions, and a [`DestinationClient`]
//! for provider-specific cleanup on the destination.
//!
//! The pipeline never branches on provider kind; it asks the registry for an
//! adapter and talks to the collaborators through these traits.

#![deny(missing_docs)]

pub mod builder;
pub mod checks;
pub mod client;
pub mod cluster;
pub mod context;
pub mod destination;
pub mod drafts;
pub mod inventory;
pub mod mac;
pub mod model;
pub mod providers;
pub mod registry;
pub mod validator;
pub mod vmspec;

pub use builder::Builder;
pub use client::SourceClient;
pub use cluster::{ClusterClient, KubeClusterClient, PopulatorCr, PopulatorKind};
pub use context::{AdapterSettings, DestinationContext, PlanContext, SourceContext};
pub use destination::DestinationClient;
pub use inventory::{HttpInventory, Inventory, StaticInventory};
pub use mac::MacConflict;
pub use registry::{create_adapter, Adapter};
pub use validator::Validator;

pub use forklift_common::{Error, Result};
