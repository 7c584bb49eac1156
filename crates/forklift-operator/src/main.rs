//! Forklift controller - executes VM migration plans

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, CustomResourceExt};

use forklift_adapter::AdapterSettings;
use forklift_common::crd::{Migration, NetworkMap, Plan, Provider, StorageMap};
use forklift_common::kube_utils::create_client;
use forklift_common::telemetry::{init_telemetry, TelemetryConfig};
use forklift_plan::{error_policy, reconcile, Context, Settings};

/// Watch timeout for the Migration informer
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Service account token mounted into the controller pod
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Forklift - runs VM migrations from vSphere, oVirt, OpenStack, OVA and
/// OpenShift into KubeVirt
#[derive(Parser, Debug)]
#[command(name = "forklift-controller", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Kubeconfig to use instead of in-cluster configuration
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Base URL of the inventory service
    #[arg(long, env = "INVENTORY_URL", default_value = "")]
    inventory_url: String,

    /// File holding the bearer token for the inventory service
    #[arg(long, env = "INVENTORY_TOKEN_FILE", default_value = SERVICE_ACCOUNT_TOKEN)]
    inventory_token_file: PathBuf,

    /// Image running virt-v2v and the disk convert Job
    #[arg(long, env = "VIRT_V2V_IMAGE")]
    virt_v2v_image: Option<String>,

    /// Minutes between warm precopies
    #[arg(long, env = "PRECOPY_INTERVAL", default_value_t = 60)]
    precopy_interval_minutes: u64,

    /// Warm precopies before cutover is forced
    #[arg(long, env = "MAX_PRECOPIES", default_value_t = 5)]
    max_precopies: u32,

    /// Seconds between reconciles while VMs are in flight
    #[arg(long, env = "REQUEUE_SECONDS", default_value_t = 10)]
    requeue_seconds: u64,

    /// Timeout for dynamic provider calls, in seconds
    #[arg(long, env = "DYNAMIC_PROVIDER_TIMEOUT_SECONDS", default_value_t = 300)]
    dynamic_provider_timeout_seconds: u64,
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut adapter = AdapterSettings {
            precopy_interval: Duration::from_secs(self.precopy_interval_minutes * 60),
            max_precopies: self.max_precopies,
            dynamic_provider_timeout: Duration::from_secs(self.dynamic_provider_timeout_seconds),
            ..Default::default()
        };
        if let Some(image) = &self.virt_v2v_image {
            adapter.virt_v2v_image = image.clone();
        }
        let inventory_token = std::fs::read_to_string(&self.inventory_token_file)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        Settings {
            requeue_interval: Duration::from_secs(self.requeue_seconds),
            inventory_url: self.inventory_url.clone(),
            inventory_token,
            adapter,
        }
    }
}

fn print_crds() -> anyhow::Result<()> {
    let crds = [
        Provider::crd(),
        Plan::crd(),
        Migration::crd(),
        NetworkMap::crd(),
        StorageMap::crd(),
    ];
    for crd in crds {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("---\n{yaml}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        return print_crds();
    }

    init_telemetry(TelemetryConfig::default())?;

    let settings = cli.settings();
    tracing::info!(
        inventory = %settings.inventory_url,
        requeue = ?settings.requeue_interval,
        max_precopies = settings.adapter.max_precopies,
        "Starting Forklift controller"
    );

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let ctx = Arc::new(Context::new(client.clone(), settings));
    let migrations: Api<Migration> = Api::all(client);

    Controller::new(
        migrations,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| {
        match result {
            Ok((migration, action)) => {
                tracing::debug!(migration = %migration.name, ?action, "Migration reconciled")
            }
            Err(e) => tracing::error!(error = ?e, "Migration reconciliation error"),
        }
        futures::future::ready(())
    })
    .await;

    tracing::info!("Forklift controller stopped");
    Ok(())
}
