//! Per-VM migration pipeline
//!
//! A VM moves through `Pending → Validating → Building → Transferring →
//! Converting → Finalizing → Succeeded`. Each [`Pipeline::tick`] advances it
//! as far as it can without waiting: anything long-running (power-off, disk
//! import, conversion, warm precopies) is polled and picked up again on the
//! next reconcile.
//!
//! Errors are wrapped with the VM and the phase they came from. Fatal errors
//! fail the VM and leave the others running; transient errors set a
//! `Retrying` condition and are returned so the reconciler requeues.
//! Cancellation is checked at every phase boundary.

mod warm;

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, instrument, warn};

use forklift_adapter::builder::VolumeInputs;
use forklift_adapter::vmspec::{run_strategy, PREFERENCE_KIND};
use forklift_adapter::{
    Adapter, Builder, ClusterClient, DestinationClient, PlanContext, SourceClient, Validator,
};
use forklift_common::crd::{
    dv_phase, set_condition, Checkpoint, Condition, ConditionStatus, DataVolume, Matcher,
    PowerState, ProviderType, Ref, Step, StepPhase, Task, VirtualMachine, VirtualMachineSpec,
    VmPhase, VmStatus, WarmStatus, MIB, STEP_CUTOVER, STEP_DISK_ALLOCATION, STEP_DISK_TRANSFER,
    STEP_IMAGE_CONVERSION, STEP_INITIALIZE, STEP_VM_CREATION,
};
use forklift_common::labels::{
    ANNOTATION_REQUIRES_CONVERSION, ANNOTATION_SOURCE_FORMAT, LABEL_CONVERSION_SOURCE_PVC,
};
use forklift_common::template::vm_safe_name;
use forklift_common::{Error, Result};

use crate::concerns;
use crate::converter::Converter;
use crate::ensurer::Ensurer;
use crate::labeler::Labeler;
use crate::namespace::NamespaceCoordinator;

/// VM condition: migrated
pub const CONDITION_SUCCEEDED: &str = "Succeeded";
/// VM condition: failed
pub const CONDITION_FAILED: &str = "Failed";
/// VM condition: canceled by the user
pub const CONDITION_CANCELED: &str = "Canceled";
/// VM condition: the last tick hit a transient error
pub const CONDITION_RETRYING: &str = "Retrying";

/// Format every converted image ends up in
pub const TARGET_FORMAT: &str = "raw";
/// Assumed source format when a PVC asks for conversion without naming one
pub const DEFAULT_SOURCE_FORMAT: &str = "qcow2";

fn start_step(vm: &mut VmStatus, name: &str) {
    if let Some(step) = vm.step_mut(name) {
        step.start();
    }
}

fn complete_step(vm: &mut VmStatus, name: &str) {
    if let Some(step) = vm.step_mut(name) {
        step.complete();
    }
}

fn set_vm_condition(vm: &mut VmStatus, type_: &str, reason: &str, message: impl Into<String>) {
    set_condition(
        &mut vm.conditions,
        Condition::new(type_, ConditionStatus::True, reason, message),
    );
}

fn cancel(vm: &mut VmStatus) {
    for step in vm
        .pipeline
        .iter_mut()
        .filter(|s| matches!(s.phase, StepPhase::Pending | StepPhase::Running))
    {
        step.phase = StepPhase::Skipped;
    }
    let phase = vm.phase.to_string();
    vm.phase = VmPhase::Canceled;
    vm.completed = Some(Utc::now());
    set_vm_condition(vm, CONDITION_CANCELED, &phase, "Canceled by user.");
    info!(vm = %vm.vm_ref, "VM canceled");
}

fn requires_conversion(pvc: &PersistentVolumeClaim) -> bool {
    pvc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_REQUIRES_CONVERSION))
        .is_some_and(|v| v == "true")
}

fn is_scratch(pvc: &PersistentVolumeClaim) -> bool {
    pvc.metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(LABEL_CONVERSION_SOURCE_PVC))
}

fn source_format(pvc: &PersistentVolumeClaim) -> String {
    pvc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_SOURCE_FORMAT))
        .cloned()
        .unwrap_or_else(|| DEFAULT_SOURCE_FORMAT.to_string())
}

/// Name of the importer Secret and ConfigMap shared by a VM's disks
pub fn shared_name(ctx: &PlanContext, vm: &Ref) -> String {
    vm_safe_name(&format!("{}-{}", ctx.plan_name(), vm.id).to_lowercase().replace('/', "-"))
}

/// Drives the VMs of one migration
pub struct Pipeline {
    ctx: Arc<PlanContext>,
    cluster: Arc<dyn ClusterClient>,
    builder: Box<dyn Builder>,
    client: Box<dyn SourceClient>,
    validator: Box<dyn Validator>,
    destination: Box<dyn DestinationClient>,
    converter: Converter,
    coordinator: NamespaceCoordinator,
}

impl Pipeline {
    /// Pipeline using the provider collaborators from `adapter`
    pub fn new(ctx: Arc<PlanContext>, adapter: &dyn Adapter) -> Result<Self> {
        Ok(Self::with_collaborators(
            ctx.clone(),
            adapter.builder(ctx.clone())?,
            adapter.client(ctx.clone())?,
            adapter.validator(ctx.clone())?,
            adapter.destination_client(ctx)?,
        ))
    }

    /// Pipeline over explicit collaborators
    pub fn with_collaborators(
        ctx: Arc<PlanContext>,
        builder: Box<dyn Builder>,
        client: Box<dyn SourceClient>,
        validator: Box<dyn Validator>,
        destination: Box<dyn DestinationClient>,
    ) -> Self {
        let cluster = ctx.destination.cluster.clone();
        Self {
            converter: Converter::new(cluster.clone(), ctx.settings.virt_v2v_image.clone()),
            coordinator: NamespaceCoordinator::new(&ctx),
            cluster,
            ctx,
            builder,
            client,
            validator,
            destination,
        }
    }

    /// The source client, for migration-level cleanup
    pub fn client(&self) -> &dyn SourceClient {
        self.client.as_ref()
    }

    /// The kubemacpool coordinator for the target namespace
    pub fn coordinator(&self) -> &NamespaceCoordinator {
        &self.coordinator
    }

    /// Advance one VM as far as possible
    ///
    /// Warm checkpoints handed to the importers are appended to `history`.
    #[instrument(skip(self, vm, history), fields(vm = %vm.vm_ref, migration = %self.ctx.migration_uid()))]
    pub async fn tick(&self, vm: &mut VmStatus, history: &mut Vec<Checkpoint>) -> Result<()> {
        loop {
            if vm.phase.is_terminal() {
                return Ok(());
            }
            if self.ctx.migration.spec.is_canceled(&vm.vm_ref) {
                cancel(vm);
                return Ok(());
            }
            let before = vm.phase;
            if let Err(e) = self.advance(vm, history).await {
                return self.handle_error(vm, before, e);
            }
            vm.conditions.retain(|c| c.type_ != CONDITION_RETRYING);
            if vm.phase == before {
                return Ok(());
            }
            debug!(from = %before, to = %vm.phase, "VM phase changed");
        }
    }

    fn handle_error(&self, vm: &mut VmStatus, phase: VmPhase, e: Error) -> Result<()> {
        let err = e.in_step(vm.vm_ref.to_string(), phase.to_string());
        if err.is_fatal() {
            warn!(error = %err, "VM failed");
            vm.fail(err.to_string());
            set_vm_condition(vm, CONDITION_FAILED, &phase.to_string(), err.to_string());
            return Ok(());
        }
        debug!(error = %err, "transient error, will retry");
        set_vm_condition(vm, CONDITION_RETRYING, &phase.to_string(), err.to_string());
        Err(err)
    }

    async fn advance(&self, vm: &mut VmStatus, history: &mut Vec<Checkpoint>) -> Result<()> {
        match vm.phase {
            VmPhase::Pending => {
                self.start(vm);
                Ok(())
            }
            VmPhase::Validating => self.validate(vm).await,
            VmPhase::Building => self.build(vm).await,
            VmPhase::Transferring => self.transfer(vm, history).await,
            VmPhase::Converting => self.convert(vm).await,
            VmPhase::Finalizing => self.finalize(vm).await,
            VmPhase::Succeeded | VmPhase::Failed | VmPhase::Canceled => Ok(()),
        }
    }

    fn transfer_step(&self) -> &'static str {
        if self.builder.supports_volume_populators() {
            STEP_DISK_ALLOCATION
        } else {
            STEP_DISK_TRANSFER
        }
    }

    fn steps(&self) -> Vec<Step> {
        let mut steps = vec![
            Step::new(STEP_INITIALIZE, "Initialize migration.", 1),
            Step::new(self.transfer_step(), "Transfer disks.", 0),
        ];
        if self.ctx.is_warm() {
            steps.push(Step::new(STEP_CUTOVER, "Final precopy after source power-off.", 1));
        }
        steps.push(Step::new(STEP_IMAGE_CONVERSION, "Convert disk images.", 1));
        steps.push(Step::new(STEP_VM_CREATION, "Create VM.", 1));
        steps
    }

    fn ensurer(&self, vm: &Ref) -> Ensurer {
        Ensurer::new(self.cluster.clone(), Labeler::new(&self.ctx, vm))
    }

    fn target_name(&self, vm: &Ref) -> String {
        let source = if vm.name.is_empty() { &vm.id } else { &vm.name };
        self.ctx.target_vm_name(vm, source)
    }

    fn start(&self, vm: &mut VmStatus) {
        vm.started = Some(Utc::now());
        vm.pipeline = self.steps();
        vm.phase = VmPhase::Validating;
        info!(migration_type = %self.ctx.migration_type(), "VM migration started");
    }

    async fn validate(&self, vm: &mut VmStatus) -> Result<()> {
        start_step(vm, STEP_INITIALIZE);
        vm.concerns = concerns::validate(self.validator.as_ref(), &self.ctx, &vm.vm_ref).await?;
        if vm.has_critical_concern() {
            let ids: Vec<&str> = vm
                .concerns
                .iter()
                .filter(|c| c.is_critical())
                .map(|c| c.id.as_str())
                .collect();
            let reason = format!("critical concerns: {}", ids.join(", "));
            warn!(concerns = %ids.join(","), "VM blocked by validation");
            vm.fail(reason.clone());
            set_vm_condition(vm, CONDITION_FAILED, "Validating", reason);
            return Ok(());
        }
        vm.restore_power_state = Some(self.client.power_state(&vm.vm_ref).await?);
        vm.phase = VmPhase::Building;
        Ok(())
    }

    /// Whether the source is off; requests power-off when it is on
    async fn source_off(&self, vm: &Ref) -> Result<bool> {
        match self.client.power_state(vm).await? {
            PowerState::Off => Ok(true),
            PowerState::On => {
                info!("powering off source VM");
                self.client.power_off(vm).await?;
                Ok(false)
            }
            PowerState::Unknown => {
                debug!("source VM power state unknown, waiting");
                Ok(false)
            }
        }
    }

    async fn build(&self, vm: &mut VmStatus) -> Result<()> {
        let vm_ref = vm.vm_ref.clone();
        if vm.tasks.is_empty() {
            vm.tasks = self.builder.tasks(&vm_ref).await?;
        }
        if !self.client.pre_transfer_actions(&vm_ref).await? {
            debug!("pre-transfer actions not ready");
            return Ok(());
        }
        self.coordinator.ensure_exclusion().await?;
        if self.ctx.is_cold() && !self.source_off(&vm_ref).await? {
            return Ok(());
        }
        complete_step(vm, STEP_INITIALIZE);

        let ensurer = self.ensurer(&vm_ref);
        let inputs = self.ensure_inputs(&vm_ref, &ensurer).await?;
        self.ensure_disks(&vm_ref, &ensurer, &inputs).await?;
        ensurer
            .ensure_lun_persistent_volumes(self.builder.lun_persistent_volumes(&vm_ref).await?)
            .await?;
        ensurer
            .ensure_lun_persistent_volume_claims(
                self.builder.lun_persistent_volume_claims(&vm_ref).await?,
            )
            .await?;

        let step = self.transfer_step();
        start_step(vm, step);
        vm.sync_step_progress(step);
        if self.ctx.is_warm() {
            vm.warm.get_or_insert_with(WarmStatus::default);
        }
        vm.phase = VmPhase::Transferring;
        info!(disks = vm.tasks.len(), "disks allocated");
        Ok(())
    }

    /// Importer Secret and ConfigMap; created only when the builder fills them
    async fn ensure_inputs(&self, vm: &Ref, ensurer: &Ensurer) -> Result<VolumeInputs> {
        let name = shared_name(&self.ctx, vm);
        let source = self.ctx.source.secret.clone().unwrap_or_default();
        let meta = || ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        };
        let mut inputs = VolumeInputs::default();

        let mut secret = Secret {
            metadata: meta(),
            ..Default::default()
        };
        self.builder.secret(vm, &source, &mut secret).await?;
        let has_secret = secret.data.as_ref().is_some_and(|d| !d.is_empty())
            || secret.string_data.as_ref().is_some_and(|d| !d.is_empty());
        if has_secret {
            ensurer.ensure_secret(secret).await?;
            inputs.secret = Some(name.clone());
        }

        let mut config_map = ConfigMap {
            metadata: meta(),
            ..Default::default()
        };
        self.builder.config_map(vm, &source, &mut config_map).await?;
        let has_config = config_map.data.as_ref().is_some_and(|d| !d.is_empty())
            || config_map.binary_data.as_ref().is_some_and(|d| !d.is_empty());
        if has_config {
            ensurer.ensure_config_map(config_map).await?;
            inputs.config_map = Some(name.clone());
        }
        Ok(inputs)
    }

    async fn ensure_disks(&self, vm: &Ref, ensurer: &Ensurer, inputs: &VolumeInputs) -> Result<()> {
        let annotations = ensurer.labeler().owner().to_map();
        let secret = inputs
            .secret
            .clone()
            .unwrap_or_else(|| self.ctx.source.secret_name());
        match self.builder.populator_volumes(vm, &annotations, &secret).await {
            Ok(claims) => {
                ensurer.ensure_persistent_volume_claims(claims).await?;
                return Ok(());
            }
            Err(e) if e.is_populator_not_supported() => {}
            Err(e) => return Err(e),
        }
        let template = ensurer
            .labeler()
            .data_volume_template(&self.target_name(vm));
        let drafts = self.builder.data_volumes(vm, inputs, &template).await?;
        ensurer.ensure_data_volumes(drafts).await?;
        Ok(())
    }

    async fn owned_claims(&self, vm: &Ref) -> Result<Vec<PersistentVolumeClaim>> {
        let labeler = Labeler::new(&self.ctx, vm);
        Ok(self
            .cluster
            .list_persistent_volume_claims(labeler.namespace(), labeler.selector())
            .await?
            .into_iter()
            .filter(|pvc| !is_scratch(pvc))
            .collect())
    }

    async fn transfer(&self, vm: &mut VmStatus, history: &mut Vec<Checkpoint>) -> Result<()> {
        let step = self.transfer_step();
        let (copied, data_volumes) = if self.builder.supports_volume_populators() {
            (self.populator_progress(vm).await?, Vec::new())
        } else {
            let labeler = Labeler::new(&self.ctx, &vm.vm_ref);
            let dvs = self
                .cluster
                .list_data_volumes(labeler.namespace(), labeler.selector())
                .await?;
            (self.fold_data_volumes(vm, &dvs)?, dvs)
        };
        vm.sync_step_progress(step);

        let done = if self.ctx.is_warm() {
            self.precopy(vm, &data_volumes, history).await? && copied
        } else {
            copied
        };
        if !done {
            return Ok(());
        }
        complete_step(vm, step);
        complete_step(vm, STEP_CUTOVER);
        vm.phase = VmPhase::Converting;
        info!("disk transfer complete");
        Ok(())
    }

    /// Fold DataVolume phase and progress into the tasks
    ///
    /// Returns whether every DataVolume has succeeded.
    fn fold_data_volumes(&self, vm: &mut VmStatus, dvs: &[DataVolume]) -> Result<bool> {
        for dv in dvs {
            let phase = dv.phase();
            if phase == dv_phase::FAILED {
                let name = dv.metadata.name.as_deref().unwrap_or_default();
                return Err(Error::provider_permanent(
                    vm.vm_ref.to_string(),
                    "cdi",
                    format!("DataVolume {} failed", name),
                ));
            }
            let id = self.builder.resolve_data_volume_identifier(dv);
            let Some(task) = vm.find_task_mut(&id) else {
                continue;
            };
            if !phase.is_empty() {
                task.phase = Some(phase.to_string());
            }
            if phase == dv_phase::SUCCEEDED {
                task.mark_complete();
            } else if let Some(percent) = dv.progress_percent() {
                task.advance_percent(percent);
            }
        }
        Ok(dvs.iter().all(|dv| dv.phase() == dv_phase::SUCCEEDED))
    }

    /// Fold populator byte counts into the tasks
    ///
    /// Returns whether every task is complete.
    async fn populator_progress(&self, vm: &mut VmStatus) -> Result<bool> {
        let claims = self.owned_claims(&vm.vm_ref).await?;
        for pvc in &claims {
            let id = self.builder.resolve_persistent_volume_claim_identifier(pvc);
            let bytes = self.builder.populator_transferred_bytes(pvc).await?;
            if let Some(task) = vm.find_task_mut(&id) {
                task.advance_to(bytes / MIB);
            }
        }
        Ok(!claims.is_empty() && vm.tasks.iter().all(Task::is_complete))
    }

    async fn convert(&self, vm: &mut VmStatus) -> Result<()> {
        start_step(vm, STEP_IMAGE_CONVERSION);
        let claims: Vec<_> = self
            .owned_claims(&vm.vm_ref)
            .await?
            .into_iter()
            .filter(requires_conversion)
            .collect();
        if !claims.is_empty()
            && !self
                .converter
                .convert_pvcs(&claims, source_format, TARGET_FORMAT)
                .await?
        {
            return Ok(());
        }
        complete_step(vm, STEP_IMAGE_CONVERSION);
        vm.phase = VmPhase::Finalizing;
        Ok(())
    }

    async fn finalize(&self, vm: &mut VmStatus) -> Result<()> {
        start_step(vm, STEP_VM_CREATION);
        let vm_ref = vm.vm_ref.clone();
        let ensurer = self.ensurer(&vm_ref);
        let claims = self.owned_claims(&vm_ref).await?;

        let mut spec = VirtualMachineSpec::default();
        self.builder
            .virtual_machine(
                &vm_ref,
                &mut spec,
                &claims,
                true,
                self.ctx.source_type() == ProviderType::Ova,
            )
            .await?;
        spec.run_strategy = Some(run_strategy(
            self.ctx.plan.spec.target_power_state.as_deref(),
            vm.restore_power_state.unwrap_or_default(),
        ));
        if spec.preference.is_none() && spec.instancetype.is_none() {
            match self.builder.preference_name(&vm_ref).await {
                Ok(preference) if !preference.is_empty() => {
                    spec.preference = Some(Matcher {
                        name: preference,
                        kind: Some(PREFERENCE_KIND.to_string()),
                    });
                }
                Ok(_) => {}
                Err(e) => info!(vm = %vm_ref, error = %e, "building the VM without a preference"),
            }
        }

        let name = self.target_name(&vm_ref);
        let mut draft = VirtualMachine::new(&name, spec);
        let mut labels = self.builder.template_labels(&vm_ref).await?;
        labels.extend(ensurer.labeler().vm_labels());
        draft.metadata.labels = Some(labels);
        let created = ensurer.ensure_virtual_machine(draft).await?;
        vm.new_name = created.metadata.name.or(Some(name));

        self.destination.set_populator_cr_ownership().await?;
        self.destination.delete_populator_data_source(vm).await?;
        self.client.detach_disks(&vm_ref).await?;

        complete_step(vm, STEP_VM_CREATION);
        vm.phase = VmPhase::Succeeded;
        vm.completed = Some(Utc::now());
        set_vm_condition(vm, CONDITION_SUCCEEDED, "Completed", "The VM migration has SUCCEEDED.");
        info!(name = ?vm.new_name, "VM migrated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        context_on, FakeCluster, StubBuilder, StubClient, StubDestination, StubValidator,
    };
    use forklift_common::crd::Concern;
    use std::collections::BTreeMap;

    struct Harness {
        cluster: FakeCluster,
        client: StubClient,
        destination: StubDestination,
        pipeline: Pipeline,
    }

    fn harness_with(
        cluster: FakeCluster,
        ctx: PlanContext,
        builder: StubBuilder,
        validator: StubValidator,
    ) -> Harness {
        let client = StubClient::default();
        let destination = StubDestination::default();
        let pipeline = Pipeline::with_collaborators(
            Arc::new(ctx),
            Box::new(builder),
            Box::new(client.clone()),
            Box::new(validator),
            Box::new(destination.clone()),
        );
        Harness {
            cluster,
            client,
            destination,
            pipeline,
        }
    }

    fn harness() -> Harness {
        let cluster = FakeCluster::default();
        let ctx = context_on(&cluster);
        harness_with(cluster, ctx, StubBuilder::default(), StubValidator::default())
    }

    fn vm() -> VmStatus {
        VmStatus::new(Ref::new("vm-1", "web-01"))
    }

    async fn tick(h: &Harness, vm: &mut VmStatus) {
        h.pipeline.tick(vm, &mut Vec::new()).await.unwrap();
    }

    // =========================================================================
    // Story Tests: Cold Migration
    // =========================================================================

    /// Story: a cold VM goes from pending to a running destination VM
    #[tokio::test]
    async fn story_cold_migration() {
        let h = harness();
        let mut vm = vm();

        // power-off requested, nothing allocated yet
        tick(&h, &mut vm).await;
        assert_eq!(vm.phase, VmPhase::Building);
        assert_eq!(h.client.calls.lock().unwrap().power_offs, 1);
        assert_eq!(vm.restore_power_state, Some(PowerState::On));
        assert_eq!(vm.tasks.len(), 2);
        assert!(h.cluster.data_volumes().is_empty());

        // source off: disks allocated, waiting for the importers
        tick(&h, &mut vm).await;
        assert_eq!(vm.phase, VmPhase::Transferring);
        assert_eq!(h.cluster.data_volumes().len(), 2);
        assert_eq!(vm.step(STEP_INITIALIZE).unwrap().phase, StepPhase::Completed);

        let first = h.cluster.data_volumes()[0].metadata.name.clone().unwrap();
        h.cluster.set_data_volume_progress(&first, "50%");
        tick(&h, &mut vm).await;
        assert_eq!(vm.phase, VmPhase::Transferring);
        assert_eq!(vm.tasks[0].completed, 512);
        assert_eq!(vm.step(STEP_DISK_TRANSFER).unwrap().progress.completed, 512);

        h.cluster.set_all_data_volume_phases(dv_phase::SUCCEEDED);
        tick(&h, &mut vm).await;
        assert_eq!(vm.phase, VmPhase::Succeeded);
        assert!(vm.tasks.iter().all(Task::is_complete));
        assert!(vm
            .pipeline
            .iter()
            .all(|s| s.phase == StepPhase::Completed));

        let created = h.cluster.virtual_machines();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].metadata.name.as_deref(), Some("web-01"));
        assert_eq!(created[0].spec.run_strategy.as_deref(), Some("Always"));
        let labels = created[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels["vmID"], "vm-1");
        assert_eq!(labels["os.template.kubevirt.io/fedora"], "true");
        assert_eq!(vm.new_name.as_deref(), Some("web-01"));
        assert_eq!(h.client.calls.lock().unwrap().detached, 1);
        assert_eq!(*h.destination.cleaned.lock().unwrap(), vec!["vm-1".to_string()]);
    }

    /// Story: a source without a matching preference still gets its VM
    #[tokio::test]
    async fn story_vm_without_preference_is_created() {
        let cluster = FakeCluster::default();
        let ctx = context_on(&cluster);
        let h = harness_with(
            cluster,
            ctx,
            StubBuilder {
                no_preference: true,
                ..Default::default()
            },
            StubValidator::default(),
        );
        let mut vm = vm();

        tick(&h, &mut vm).await;
        tick(&h, &mut vm).await;
        h.cluster.set_all_data_volume_phases(dv_phase::SUCCEEDED);
        tick(&h, &mut vm).await;

        assert_eq!(vm.phase, VmPhase::Succeeded);
        assert!(vm.error.is_none());
        let created = h.cluster.virtual_machines();
        assert_eq!(created.len(), 1);
        assert!(created[0].spec.preference.is_none());
        assert_eq!(created[0].spec.run_strategy.as_deref(), Some("Always"));
    }

    /// Story: a critical concern stops the VM before anything is created
    #[tokio::test]
    async fn story_critical_concern_fails_vm() {
        let cluster = FakeCluster::default();
        let ctx = context_on(&cluster);
        let h = harness_with(
            cluster,
            ctx,
            StubBuilder::default(),
            StubValidator {
                storage_mapped: false,
                ..Default::default()
            },
        );
        let mut vm = vm();
        tick(&h, &mut vm).await;

        assert_eq!(vm.phase, VmPhase::Failed);
        assert!(vm.concerns.iter().any(Concern::is_critical));
        assert!(vm.error.as_ref().unwrap().reasons[0].contains("VMStorageNotMapped"));
        assert!(h.cluster.data_volumes().is_empty());
        assert_eq!(h.client.calls.lock().unwrap().power_offs, 0);
    }

    /// Story: cancellation skips the remaining steps
    #[tokio::test]
    async fn story_cancel_stops_at_step_boundary() {
        let cluster = FakeCluster::default();
        let mut ctx = context_on(&cluster);
        ctx.migration.spec.cancel = vec![Ref::with_id("vm-1")];
        let h = harness_with(cluster, ctx, StubBuilder::default(), StubValidator::default());

        let mut vm = vm();
        vm.phase = VmPhase::Transferring;
        vm.pipeline = h.pipeline.steps();
        vm.pipeline[0].complete();
        tick(&h, &mut vm).await;

        assert_eq!(vm.phase, VmPhase::Canceled);
        assert_eq!(vm.pipeline[0].phase, StepPhase::Completed);
        assert!(vm.pipeline[1..].iter().all(|s| s.phase == StepPhase::Skipped));
        assert!(h.cluster.virtual_machines().is_empty());
    }

    // =========================================================================
    // Errors
    // =========================================================================

    #[tokio::test]
    async fn transient_error_requeues_without_failing() {
        let h = harness();
        h.client.calls.lock().unwrap().pre_transfer_error =
            Some(Error::provider_for("vm-1", "vsphere", "session expired"));
        let mut vm = vm();

        let err = h.pipeline.tick(&mut vm, &mut Vec::new()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("session expired"));
        assert_eq!(vm.phase, VmPhase::Building);
        assert!(vm.conditions.iter().any(|c| c.type_ == CONDITION_RETRYING));

        // the next tick recovers and clears the condition
        tick(&h, &mut vm).await;
        assert!(!vm.conditions.iter().any(|c| c.type_ == CONDITION_RETRYING));
    }

    #[tokio::test]
    async fn failed_data_volume_fails_the_vm() {
        let h = harness();
        let mut vm = vm();
        tick(&h, &mut vm).await;
        tick(&h, &mut vm).await;
        h.cluster.set_all_data_volume_phases(dv_phase::FAILED);
        tick(&h, &mut vm).await;

        assert_eq!(vm.phase, VmPhase::Failed);
        assert_eq!(vm.error.as_ref().unwrap().phase, "Transferring");
        assert!(vm.conditions.iter().any(|c| c.type_ == CONDITION_FAILED));
    }

    #[tokio::test]
    async fn pre_transfer_actions_are_polled() {
        let h = harness();
        h.client.calls.lock().unwrap().pre_transfer_pending = 1;
        let mut vm = vm();
        tick(&h, &mut vm).await;
        assert_eq!(vm.phase, VmPhase::Building);
        assert_eq!(h.client.calls.lock().unwrap().power_offs, 0);
        tick(&h, &mut vm).await;
        assert_eq!(h.client.calls.lock().unwrap().power_offs, 1);
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    #[tokio::test]
    async fn importer_secret_is_shared_and_referenced() {
        let cluster = FakeCluster::default();
        let ctx = context_on(&cluster);
        let h = harness_with(
            cluster,
            ctx,
            StubBuilder {
                with_secret: true,
                ..Default::default()
            },
            StubValidator::default(),
        );
        let mut vm = vm();
        tick(&h, &mut vm).await;
        tick(&h, &mut vm).await;

        let secrets = h.cluster.secrets();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].metadata.name.as_deref(), Some("plan-vm-1"));
        let dv = &h.cluster.data_volumes()[0];
        assert_eq!(
            dv.metadata.annotations.as_ref().unwrap()["test/secret"],
            "plan-vm-1"
        );
    }

    #[tokio::test]
    async fn populator_path_tracks_bytes() {
        let cluster = FakeCluster::default();
        let ctx = context_on(&cluster);
        let h = harness_with(
            cluster,
            ctx,
            StubBuilder {
                populators: true,
                populated_bytes: 4096 * MIB,
                ..Default::default()
            },
            StubValidator::default(),
        );
        let mut vm = vm();
        tick(&h, &mut vm).await;
        tick(&h, &mut vm).await;

        assert!(h.cluster.data_volumes().is_empty());
        assert_eq!(h.cluster.persistent_volume_claims().len(), 2);
        assert!(vm.step(STEP_DISK_ALLOCATION).is_some());

        // every populator reports more than the disk size: clamped and done
        assert_eq!(vm.phase, VmPhase::Succeeded);
        assert_eq!(vm.tasks[0].completed, vm.tasks[0].total);
    }

    #[tokio::test]
    async fn conversion_waits_for_the_convert_job() {
        let h = harness();
        let mut vm = vm();
        tick(&h, &mut vm).await;
        tick(&h, &mut vm).await;

        let labeler = Labeler::new(&context_on(&h.cluster), &vm.vm_ref);
        let mut meta = ObjectMeta {
            name: Some("web-01-disk-0".to_string()),
            annotations: Some(BTreeMap::from([
                (ANNOTATION_REQUIRES_CONVERSION.to_string(), "true".to_string()),
                (ANNOTATION_SOURCE_FORMAT.to_string(), "qcow2".to_string()),
            ])),
            ..Default::default()
        };
        labeler.stamp(&mut meta);
        h.cluster.insert_persistent_volume_claim(PersistentVolumeClaim {
            metadata: meta,
            ..Default::default()
        });

        h.cluster.set_all_data_volume_phases(dv_phase::SUCCEEDED);
        tick(&h, &mut vm).await;
        assert_eq!(vm.phase, VmPhase::Converting);
        assert_eq!(
            vm.step(STEP_IMAGE_CONVERSION).unwrap().phase,
            StepPhase::Running
        );
        assert!(h
            .cluster
            .data_volumes()
            .iter()
            .any(|dv| dv.metadata.name.as_deref() == Some("scratch-web-01-disk-0")));
        assert!(h.cluster.virtual_machines().is_empty());
    }

    #[test]
    fn shared_name_is_a_label() {
        let ctx = context_on(&FakeCluster::default());
        assert_eq!(shared_name(&ctx, &Ref::with_id("vm-1")), "plan-vm-1");
        assert_eq!(
            shared_name(&ctx, &Ref::with_id("NS/Web")),
            "plan-ns-web"
        );
    }
}
