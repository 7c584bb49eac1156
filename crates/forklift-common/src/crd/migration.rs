//! Migration CRD
//!
//! A Migration is one invocation of a Plan. Its UID labels every object the
//! controller creates, and its status carries the per-VM pipeline records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Concern, Condition, Ref, ResourceRef};
use crate::labels::{TASK_ANNOTATION_UNIT, TASK_UNIT_MB};

// =============================================================================
// Migration CRD
// =============================================================================

/// Migration runs a Plan
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "forklift.konveyor.io",
    version = "v1beta1",
    kind = "Migration",
    plural = "migrations",
    namespaced,
    status = "MigrationStatus",
    printcolumn = r#"{"name":"Plan","type":"string","jsonPath":".spec.plan.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// Plan being executed
    pub plan: ResourceRef,

    /// VMs to cancel
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel: Vec<Ref>,

    /// Cancel every VM that has not finished
    #[serde(default)]
    pub cancel_all: bool,

    /// Warm migrations stop precopying and cut over after this time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutover: Option<DateTime<Utc>>,
}

impl MigrationSpec {
    /// Whether the VM has been canceled
    pub fn is_canceled(&self, vm: &Ref) -> bool {
        self.cancel_all || self.cancel.iter().any(|r| r.matches(vm))
    }

    /// Whether cutover has been requested as of `now`
    pub fn cutover_requested(&self, now: DateTime<Utc>) -> bool {
        self.cutover.is_some_and(|t| t <= now)
    }
}

/// Status of a Migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    /// Aggregate phase
    #[serde(default)]
    pub phase: MigrationPhase,

    /// When the first VM started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// When the last VM finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Per-VM records
    #[serde(default)]
    pub vms: Vec<VmStatus>,

    /// Append-only record of warm checkpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Checkpoint>,

    /// kubemacpool exclusion held for the plan, released on completion or deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusion: Option<ExclusionOwner>,
}

/// A plan's entry in a namespace's kubemacpool owners annotation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExclusionOwner {
    /// Target namespace carrying the exclusion
    pub namespace: String,
    /// UID recorded in the owners annotation
    pub plan_uid: String,
}

impl MigrationStatus {
    /// The record for a VM
    pub fn find_vm(&self, vm: &Ref) -> Option<&VmStatus> {
        self.vms.iter().find(|s| s.vm_ref.matches(vm))
    }

    /// Whether every VM reached a terminal phase
    pub fn all_terminal(&self) -> bool {
        self.vms.iter().all(|vm| vm.phase.is_terminal())
    }
}

/// Aggregate phase of a Migration
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Not started
    #[default]
    Pending,
    /// At least one VM is in flight
    Running,
    /// Every VM succeeded
    Succeeded,
    /// At least one VM failed
    Failed,
    /// Canceled before every VM finished
    Canceled,
}

impl MigrationPhase {
    /// Whether the migration has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A warm checkpoint recorded on the Migration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Source VM ID
    pub vm_id: String,
    /// Snapshot identifier
    pub snapshot: String,
    /// When the checkpoint was handed to the importers
    pub recorded: DateTime<Utc>,
    /// Whether this was the final (cutover) checkpoint
    #[serde(default, rename = "final")]
    pub final_: bool,
}

// =============================================================================
// Per-VM status
// =============================================================================

/// Pipeline phase of a single VM
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VmPhase {
    /// Waiting to start
    #[default]
    Pending,
    /// Running validator checks
    Validating,
    /// Building drafts, preparing the source, creating volumes
    Building,
    /// Disk contents are being copied
    Transferring,
    /// Disk images are being converted
    Converting,
    /// Creating the VM and cleaning up
    Finalizing,
    /// Migrated
    Succeeded,
    /// Failed; see the error and conditions
    Failed,
    /// Canceled by the user
    Canceled,
}

impl VmPhase {
    /// Whether the VM has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for VmPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Power state of a source VM
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    /// Running
    On,
    /// Powered off
    Off,
    /// Unknown or transitional
    #[default]
    Unknown,
}

/// Migration record for one VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmStatus {
    /// Source VM reference
    #[serde(flatten)]
    pub vm_ref: Ref,

    /// Current phase
    #[serde(default)]
    pub phase: VmPhase,

    /// Ordered pipeline steps with aggregate progress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline: Vec<Step>,

    /// Per-disk progress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Task>,

    /// Firmware detected on the source ("bios" or "efi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,

    /// Guest operating system detected on the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<String>,

    /// Destination VM name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,

    /// Source power state before migration, restored on the destination
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_power_state: Option<PowerState>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Validator findings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concerns: Vec<Concern>,

    /// Warm migration state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm: Option<WarmStatus>,

    /// Failure details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VmError>,

    /// When the pipeline started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// When the pipeline finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
}

impl VmStatus {
    /// A pending record for a VM
    pub fn new(vm_ref: Ref) -> Self {
        Self {
            vm_ref,
            ..Default::default()
        }
    }

    /// The task for a disk
    pub fn find_task_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.name == name)
    }

    /// The step with the given name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.pipeline.iter().find(|s| s.name == name)
    }

    /// The step with the given name, mutably
    pub fn step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.pipeline.iter_mut().find(|s| s.name == name)
    }

    /// Whether any concern blocks the VM
    pub fn has_critical_concern(&self) -> bool {
        self.concerns.iter().any(Concern::is_critical)
    }

    /// Record a failure and move to `Failed`
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        let phase = self.phase.to_string();
        match &mut self.error {
            Some(err) => {
                err.phase = phase;
                err.reasons.push(reason);
            }
            None => {
                self.error = Some(VmError {
                    phase,
                    reasons: vec![reason],
                })
            }
        }
        if let Some(step) = self.pipeline.iter_mut().find(|s| s.phase == StepPhase::Running) {
            step.phase = StepPhase::Failed;
            step.completed = Some(Utc::now());
        }
        self.phase = VmPhase::Failed;
        self.completed = Some(Utc::now());
    }

    /// Fold per-disk progress into the named step
    pub fn sync_step_progress(&mut self, step_name: &str) {
        let total: i64 = self.tasks.iter().map(|t| t.total).sum();
        let completed: i64 = self.tasks.iter().map(|t| t.completed).sum();
        if let Some(step) = self.step_mut(step_name) {
            step.progress.total = total;
            step.progress.advance_to(completed);
        }
    }
}

/// Failure details for a VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VmError {
    /// Phase the VM was in when it failed
    pub phase: String,
    /// Accumulated reasons
    #[serde(default)]
    pub reasons: Vec<String>,
}

// =============================================================================
// Steps and tasks
// =============================================================================

/// Step: initialize the source and namespace
pub const STEP_INITIALIZE: &str = "Initialize";
/// Step: create destination volumes
pub const STEP_DISK_ALLOCATION: &str = "DiskAllocation";
/// Step: copy disk contents
pub const STEP_DISK_TRANSFER: &str = "DiskTransfer";
/// Step: final warm precopy
pub const STEP_CUTOVER: &str = "Cutover";
/// Step: convert disk images
pub const STEP_IMAGE_CONVERSION: &str = "ImageConversion";
/// Step: create the destination VM
pub const STEP_VM_CREATION: &str = "VMCreation";

/// Phase of a pipeline step
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum StepPhase {
    /// Not reached
    #[default]
    Pending,
    /// In progress
    Running,
    /// Done
    Completed,
    /// Failed
    Failed,
    /// Not run (canceled)
    Skipped,
}

/// Monotone progress counter
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Progress {
    /// Total units
    pub total: i64,
    /// Completed units; never decreases and never exceeds `total`
    pub completed: i64,
}

impl Progress {
    /// Raise `completed` toward `value`, clamped to `total`
    pub fn advance_to(&mut self, value: i64) {
        let value = value.min(self.total);
        if value > self.completed {
            self.completed = value;
        }
    }
}

/// A pipeline step
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Step name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Current phase
    #[serde(default)]
    pub phase: StepPhase,
    /// Aggregate progress
    #[serde(default)]
    pub progress: Progress,
    /// Progress unit and other metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// When the step started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// When the step finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
}

impl Step {
    /// A pending step
    pub fn new(name: impl Into<String>, description: impl Into<String>, total: i64) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            progress: Progress {
                total,
                completed: 0,
            },
            annotations: BTreeMap::from([(
                TASK_ANNOTATION_UNIT.to_string(),
                TASK_UNIT_MB.to_string(),
            )]),
            ..Default::default()
        }
    }

    /// Mark running; no-op if already started
    pub fn start(&mut self) {
        if self.phase == StepPhase::Pending {
            self.phase = StepPhase::Running;
            self.started = Some(Utc::now());
        }
    }

    /// Mark completed with full progress
    pub fn complete(&mut self) {
        if self.started.is_none() {
            self.started = Some(Utc::now());
        }
        self.progress.completed = self.progress.total;
        self.phase = StepPhase::Completed;
        self.completed = Some(Utc::now());
    }
}

/// Per-disk progress unit
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable disk identifier
    pub name: String,
    /// Total MiB
    pub total: i64,
    /// Transferred MiB; never decreases and never exceeds `total`
    #[serde(default)]
    pub completed: i64,
    /// Progress unit and other metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Importer phase, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// Bytes per MiB
pub const MIB: i64 = 0x100000;

impl Task {
    /// A task measured in MiB
    pub fn new(name: impl Into<String>, total_mib: i64) -> Self {
        Self {
            name: name.into(),
            total: total_mib,
            completed: 0,
            annotations: BTreeMap::from([(
                TASK_ANNOTATION_UNIT.to_string(),
                TASK_UNIT_MB.to_string(),
            )]),
            phase: None,
        }
    }

    /// A task sized from a byte capacity
    pub fn from_bytes(name: impl Into<String>, capacity_bytes: i64) -> Self {
        Self::new(name, capacity_bytes / MIB)
    }

    /// Raise `completed` toward `value`, clamped to `total`
    pub fn advance_to(&mut self, value: i64) {
        let value = value.min(self.total);
        if value > self.completed {
            self.completed = value;
        }
    }

    /// Raise progress from a percentage (0-100)
    pub fn advance_percent(&mut self, percent: f64) {
        let value = (self.total as f64 * percent.clamp(0.0, 100.0) / 100.0) as i64;
        self.advance_to(value);
    }

    /// Mark fully transferred
    pub fn mark_complete(&mut self) {
        self.completed = self.total;
    }

    /// Whether the task is fully transferred
    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }
}

// =============================================================================
// Warm migration
// =============================================================================

/// Stage within one warm precopy iteration
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WarmStage {
    /// Waiting for the next precopy time
    #[default]
    Idle,
    /// Snapshot requested; waiting until ready
    WaitSnapshot,
    /// Checkpoints set; waiting for importers to pause
    WaitDataVolumes,
    /// Previous snapshot removal requested; waiting until removed
    WaitSnapshotRemove,
    /// Final checkpoint set; waiting for importers to finish
    WaitFinal,
}

/// A warm precopy iteration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Precopy {
    /// Snapshot identifier
    pub snapshot: String,
    /// Provider task tracking snapshot creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_task_id: Option<String>,
    /// Provider task tracking snapshot removal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_task_id: Option<String>,
    /// Per-disk change IDs captured at this snapshot
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deltas: BTreeMap<String, String>,
    /// When the precopy started
    pub start: DateTime<Utc>,
    /// When the precopy finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Warm migration state for a VM
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WarmStatus {
    /// Current stage
    #[serde(default)]
    pub stage: WarmStage,
    /// Completed and in-flight precopies
    #[serde(default)]
    pub precopies: Vec<Precopy>,
    /// Successful precopies
    #[serde(default)]
    pub successes: u32,
    /// Failed precopy attempts
    #[serde(default)]
    pub failures: u32,
    /// When the next precopy may start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_precopy_at: Option<DateTime<Utc>>,
    /// Whether the final precopy (cutover) is in progress
    #[serde(default)]
    pub cutover: bool,
}

impl WarmStatus {
    /// The in-flight or most recent precopy
    pub fn current(&self) -> Option<&Precopy> {
        self.precopies.last()
    }

    /// The in-flight or most recent precopy, mutably
    pub fn current_mut(&mut self) -> Option<&mut Precopy> {
        self.precopies.last_mut()
    }

    /// The precopy before the current one
    pub fn previous(&self) -> Option<&Precopy> {
        self.precopies.iter().rev().nth(1)
    }
}
