//! Common types for Forklift: CRDs, errors, labels and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod labels;
pub mod telemetry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the controller runs in when not overridden
pub const FORKLIFT_SYSTEM_NAMESPACE: &str = "openshift-mtv";

/// Name of the controller, used as field manager and service name
pub const CONTROLLER_NAME: &str = "forklift-controller";
