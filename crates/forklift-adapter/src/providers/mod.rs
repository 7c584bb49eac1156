//! Provider adapters
//!
//! One module per source provider kind. Each exposes a unit adapter that
//! [`crate::registry::create_adapter`] returns for its kind.
//!
//! - [`VsphereAdapter`] - VMware vSphere through VDDK importers
//! - [`OvirtAdapter`] - oVirt/RHV through imageio or volume populators
//! - [`OpenstackAdapter`] - OpenStack through Glance image populators
//! - [`OvaAdapter`] - OVA appliances served by the OVA provider server
//! - [`OcpAdapter`] - KubeVirt VMs on another cluster via VirtualMachineExport
//! - [`HypervAdapter`] - Hyper-V, cold only
//! - [`DynamicAdapter`] - out-of-process providers described by a schema

pub mod dynamic;
mod hyperv;
mod ocp;
mod openstack;
mod ova;
mod ovirt;
mod vsphere;

pub use dynamic::{DynamicAdapter, DynamicService, HttpDynamicService};
pub use hyperv::HypervAdapter;
pub use ocp::OcpAdapter;
pub use openstack::OpenstackAdapter;
pub use ova::OvaAdapter;
pub use ovirt::OvirtAdapter;
pub use vsphere::VsphereAdapter;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, Secret};
use k8s_openapi::ByteString;

use tracing::info;

use forklift_common::crd::PowerState;
use forklift_common::Result;

use crate::cluster::{ClusterClient, PopulatorCr};

/// A literal environment variable for the conversion pod
pub(crate) fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// A value from a Secret's `data`, falling back to `stringData`
pub(crate) fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key).cloned()))
}

/// Set `data` entries on an importer Secret, skipping absent values
pub(crate) fn put_secret_data<'a>(
    secret: &mut Secret,
    entries: impl IntoIterator<Item = (&'a str, Option<String>)>,
) {
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    for (key, value) in entries {
        if let Some(value) = value {
            data.insert(key.to_string(), ByteString(value.into_bytes()));
        }
    }
}

/// Create a populator CR; one left by an earlier reconcile is reused
pub(crate) async fn ensure_populator(cluster: &dyn ClusterClient, cr: &PopulatorCr) -> Result<()> {
    match cluster.create_populator(cr).await {
        Ok(()) => {
            info!(populator = cr.name().unwrap_or_default(), "created volume populator");
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            info!(populator = cr.name().unwrap_or_default(), "volume populator already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Map a provider power string onto [`PowerState`]
///
/// Every provider spells "running" differently; anything unrecognised is
/// unknown rather than off so that power-off is never skipped by mistake.
pub(crate) fn parse_power_state(s: &str) -> PowerState {
    match s.to_ascii_lowercase().as_str() {
        "on" | "poweredon" | "up" | "running" | "active" => PowerState::On,
        "off" | "poweredoff" | "down" | "stopped" | "shutoff" | "halted" => PowerState::Off,
        _ => PowerState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_strings_from_every_provider() {
        assert_eq!(parse_power_state("poweredOn"), PowerState::On);
        assert_eq!(parse_power_state("up"), PowerState::On);
        assert_eq!(parse_power_state("ACTIVE"), PowerState::On);
        assert_eq!(parse_power_state("poweredOff"), PowerState::Off);
        assert_eq!(parse_power_state("SHUTOFF"), PowerState::Off);
        assert_eq!(parse_power_state("Stopped"), PowerState::Off);
        assert_eq!(parse_power_state("suspended"), PowerState::Unknown);
        assert_eq!(parse_power_state(""), PowerState::Unknown);
    }
}
