//! Custom Resource Definitions consumed and produced by the controller
//!
//! Plan, Migration, Provider and the two maps are Forklift's own API. The
//! KubeVirt, CDI and populator types are typed views of resources this
//! controller creates on the destination.

mod cdi;
mod kubevirt;
mod mapping;
mod migration;
mod plan;
mod populator;
mod provider;
mod schema;
mod types;

pub use cdi::{
    phase as dv_phase, DataVolume, DataVolumeCheckpoint, DataVolumeSource, DataVolumeSpec,
    DataVolumeStatus, HttpSource, ImageioSource, PvcSource, RegistrySource, StorageSpec,
    VddkSource,
};
pub use kubevirt::{
    Bootloader, Cpu, DataVolumeVolumeSource, Devices, Disk, DiskTarget, DomainSpec, Efi, EmptyObject, FeatureState,
    Features, Firmware, Input, Interface, Machine, Matcher, Memory, MultusNetwork, Network,
    PluginBinding, PvcVolumeSource, VirtualMachine, VirtualMachineSpec, VirtualMachineStatus,
    VmiSpec, VmiTemplate, Volume,
};
pub use mapping::{
    DestinationNetwork, DestinationStorage, MapStatus, NetworkMap, NetworkMapSpec, NetworkPair,
    NetworkType, StorageMap, StorageMapSpec, StoragePair, GLANCE_SOURCE, VOLUME_MODE_BLOCK,
    VOLUME_MODE_FILESYSTEM,
};
pub use migration::{
    Checkpoint, ExclusionOwner, Migration, MigrationPhase, MigrationSpec, MigrationStatus,
    PowerState, Precopy, Progress, Step, StepPhase, Task, VmError, VmPhase, VmStatus, WarmStage,
    WarmStatus, MIB, STEP_CUTOVER, STEP_DISK_ALLOCATION, STEP_DISK_TRANSFER,
    STEP_IMAGE_CONVERSION, STEP_INITIALIZE, STEP_VM_CREATION,
};
pub use plan::{MigrationType, Plan, PlanMap, PlanSpec, PlanStatus, PlanVm};
pub use populator::{
    OpenstackVolumePopulator, OpenstackVolumePopulatorSpec, OvirtVolumePopulator,
    OvirtVolumePopulatorSpec, PopulatorStatus, POPULATOR_API_GROUP,
};
pub use provider::{
    Provider, ProviderFeatures, ProviderService, ProviderSpec, ProviderStatus,
    SETTING_SDK_ENDPOINT, SETTING_USE_V2V_COPY, SETTING_VDDK_INIT_IMAGE,
};
pub use schema::{ProviderSchema, Schema, SchemaKind};
pub use types::{
    set_condition, Category, Concern, Condition, ConditionStatus, ProviderPair, ProviderType, Ref,
    ResourceRef,
};
