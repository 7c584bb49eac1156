//! Controller settings

use std::time::Duration;

use forklift_adapter::AdapterSettings;

/// Poll interval used while VMs are in flight
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(10);

/// Settings handed to the Migration controller
#[derive(Clone, Debug)]
pub struct Settings {
    /// Requeue delay while any VM is still running
    pub requeue_interval: Duration,
    /// Base URL of the inventory service; empty disables inventory lookups
    pub inventory_url: String,
    /// Bearer token for the inventory service
    pub inventory_token: Option<String>,
    /// Settings passed through to the provider adapters
    pub adapter: AdapterSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            inventory_url: String::new(),
            inventory_token: None,
            adapter: AdapterSettings::default(),
        }
    }
}
