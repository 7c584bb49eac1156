use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde::Deserialize;
use serde_json::Value;

use forklift_common::crd::{PowerState, Ref, VirtualMachine, MIB};
use forklift_common::kube_utils::quantity_to_bytes;
use forklift_common::{Error, Result};

use crate::cluster::ClusterClient;
use crate::model::{FirmwareKind, SourceDisk, SourceNic, SourceVm, VmLoader};
use crate::vmspec::DEFAULT_MEMORY_MB;

pub(crate) const PROVIDER: &str = "openshift";
pub(crate) const EXPORT_READY: &str = "Ready";
pub(crate) const TOKEN_HEADER: &str = "x-kubevirt-export-token";

/// Formats CDI can import over HTTP, in preference order
const IMPORTABLE_FORMATS: &[&str] = &["kubevirt-gz", "tar.gz"];

/// The parts of a `VirtualMachineExport` the controller reads
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct VmExport {
    pub status: Option<ExportStatus>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct ExportStatus {
    pub phase: String,
    pub token_secret_ref: Option<String>,
    pub links: Option<ExportLinks>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ExportLinks {
    pub external: Option<ExportLink>,
    pub internal: Option<ExportLink>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ExportLink {
    pub cert: String,
    pub volumes: Vec<ExportVolume>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ExportVolume {
    pub name: String,
    pub formats: Vec<ExportFormat>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ExportFormat {
    pub format: String,
    pub url: String,
}

impl VmExport {
    pub fn parse(object: Value) -> Result<Self> {
        serde_json::from_value(object)
            .map_err(|e| Error::serialization_for_kind("VirtualMachineExport", e.to_string()))
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.phase == EXPORT_READY)
    }

    pub fn token_secret(&self) -> Option<&str> {
        self.status.as_ref()?.token_secret_ref.as_deref()
    }

    /// The external link set; the internal one when the export has no route
    pub fn link(&self) -> Option<&ExportLink> {
        let links = self.status.as_ref()?.links.as_ref()?;
        links.external.as_ref().or(links.internal.as_ref())
    }
}

impl ExportLink {
    /// Download URL of the volume backed by `claim`
    pub fn volume_url(&self, claim: &str) -> Option<&str> {
        let volume = self.volumes.iter().find(|v| v.name == claim)?;
        IMPORTABLE_FORMATS.iter().find_map(|wanted| {
            volume
                .formats
                .iter()
                .find(|f| f.format == *wanted)
                .map(|f| f.url.as_str())
        })
    }
}

/// Disk identifier for a source PVC
pub(crate) fn claim_id(namespace: &str, claim: &str) -> String {
    format!("{}/{}", namespace, claim)
}

/// Power state from `runStrategy`, the legacy `running` flag, then status
pub(crate) fn vm_power_state(vm: &VirtualMachine) -> PowerState {
    match vm.spec.run_strategy.as_deref() {
        Some("Halted") => return PowerState::Off,
        Some("Always") | Some("RerunOnFailure") => return PowerState::On,
        _ => {}
    }
    if let Some(running) = vm.spec.running {
        return if running { PowerState::On } else { PowerState::Off };
    }
    match vm.status.as_ref().and_then(|s| s.printable_status.as_deref()) {
        Some("Running") => PowerState::On,
        Some("Stopped") => PowerState::Off,
        _ => PowerState::Unknown,
    }
}

/// Reads KubeVirt VMs and their PVCs from the source cluster
#[derive(Clone)]
pub(crate) struct OcpLoader {
    cluster: Arc<dyn ClusterClient>,
}

impl OcpLoader {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &dyn ClusterClient {
        self.cluster.as_ref()
    }

    pub async fn virtual_machine(&self, vm: &Ref) -> Result<VirtualMachine> {
        self.cluster
            .get_virtual_machine(&vm.namespace, &vm.name)
            .await?
            .ok_or_else(|| {
                Error::provider_permanent(vm.to_string(), PROVIDER, "virtual machine not found")
            })
    }

    pub async fn export(&self, vm: &Ref) -> Result<Option<VmExport>> {
        self.cluster
            .get_vm_export(&vm.namespace, &vm.name)
            .await?
            .map(VmExport::parse)
            .transpose()
    }

    /// The export, failing while it is absent or not yet ready
    pub async fn ready_export(&self, vm: &Ref) -> Result<VmExport> {
        match self.export(vm).await? {
            Some(export) if export.is_ready() => Ok(export),
            _ => Err(Error::provider_for(
                vm.to_string(),
                PROVIDER,
                "virtual machine export is not ready",
            )),
        }
    }

    async fn claim(&self, namespace: &str, name: &str, vm: &str) -> Result<PersistentVolumeClaim> {
        self.cluster
            .get_persistent_volume_claim(namespace, name)
            .await?
            .ok_or_else(|| {
                Error::provider_permanent(vm, PROVIDER, format!("PVC {}/{} not found", namespace, name))
            })
    }

    async fn disks(&self, vm: &VirtualMachine, namespace: &str, name: &str) -> Result<Vec<SourceDisk>> {
        let mut disks = Vec::new();
        for volume in &vm.spec.template.spec.volumes {
            let Some(claim_name) = volume.claim_name() else {
                continue;
            };
            let pvc = self.claim(namespace, claim_name, name).await?;
            let spec = pvc.spec.unwrap_or_default();
            let capacity_bytes = match spec
                .resources
                .and_then(|r| r.requests)
                .and_then(|r| r.get("storage").cloned())
            {
                Some(q) => quantity_to_bytes(&q)?,
                None => 0,
            };
            let storage_class = spec.storage_class_name.unwrap_or_default();
            disks.push(SourceDisk {
                id: claim_id(namespace, claim_name),
                name: volume.name.clone(),
                capacity_bytes,
                storage: Ref::new(storage_class.clone(), storage_class),
                ..Default::default()
            });
        }
        Ok(disks)
    }
}

fn nics(vm: &VirtualMachine, namespace: &str) -> Vec<SourceNic> {
    let vmi = &vm.spec.template.spec;
    vmi.domain
        .devices
        .interfaces
        .iter()
        .filter_map(|interface| {
            let network = vmi.networks.iter().find(|n| n.name == interface.name)?;
            let source = if network.pod.is_some() {
                Ref {
                    type_: "pod".to_string(),
                    ..Default::default()
                }
            } else {
                let multus = network.multus.as_ref()?;
                let (ns, name) = multus
                    .network_name
                    .split_once('/')
                    .unwrap_or((namespace, multus.network_name.as_str()));
                Ref {
                    name: name.to_string(),
                    namespace: ns.to_string(),
                    type_: "multus".to_string(),
                    ..Default::default()
                }
            };
            Some(SourceNic {
                name: interface.name.clone(),
                mac: interface.mac_address.clone().unwrap_or_default(),
                network: source,
                ip_addresses: Vec::new(),
            })
        })
        .collect()
}

#[async_trait]
impl VmLoader for OcpLoader {
    async fn load(&self, vm: &Ref) -> Result<SourceVm> {
        let object = self.virtual_machine(vm).await?;
        let namespace = object
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| vm.namespace.clone());
        let name = object.metadata.name.clone().unwrap_or_else(|| vm.name.clone());
        let domain = &object.spec.template.spec.domain;

        let memory_mb = match domain.memory.as_ref().and_then(|m| m.guest.as_ref()) {
            Some(q) => quantity_to_bytes(q)? / MIB,
            None => DEFAULT_MEMORY_MB,
        };
        let cpu = domain.cpu.clone().unwrap_or_default();
        let cores = cpu.cores.unwrap_or(1).max(1);
        let sockets = cpu.sockets.unwrap_or(1).max(1);
        let threads = cpu.threads.unwrap_or(1).max(1);
        let efi = domain
            .firmware
            .as_ref()
            .and_then(|f| f.bootloader.as_ref())
            .and_then(|b| b.efi.as_ref());

        Ok(SourceVm {
            id: claim_id(&namespace, &name),
            uuid: domain
                .firmware
                .as_ref()
                .and_then(|f| f.serial.clone())
                .unwrap_or_default(),
            power_state: vm_power_state(&object),
            firmware: if efi.is_some() {
                FirmwareKind::Efi
            } else {
                FirmwareKind::Bios
            },
            secure_boot: efi.and_then(|e| e.secure_boot).unwrap_or(false),
            cpu_count: cores * sockets * threads,
            cores_per_socket: cores,
            memory_mb,
            disks: self.disks(&object, &namespace, &name).await?,
            nics: nics(&object, &namespace),
            name,
            ..Default::default()
        })
    }
}
