//! Plan execution for the Forklift migration controller
//!
//! A Migration is driven by [`controller::reconcile`]: the referenced Plan is
//! resolved into a [`PlanContext`](forklift_adapter::PlanContext), and every
//! VM advances through its [`Pipeline`] one tick at a time. The pipeline leans
//! on a few helpers:
//!
//! - [`ensurer`] creates destination objects idempotently, keyed by labels
//! - [`converter`] runs the disk format conversion jobs
//! - [`namespace`] keeps the kubemacpool exclusion on the target namespace
//! - [`concerns`] turns validator answers into VM concerns
//!
//! Warm migrations repeat the transfer as precopies until cutover.

#![deny(missing_docs)]

pub mod concerns;
pub mod controller;
pub mod converter;
pub mod ensurer;
pub mod labeler;
pub mod namespace;
pub mod pipeline;
pub mod settings;

#[cfg(test)]
mod testing;

pub use controller::{error_policy, reconcile, Context, KubePlanStore, PlanStore};
pub use pipeline::Pipeline;
pub use settings::Settings;

pub use forklift_common::{Error, Result};
