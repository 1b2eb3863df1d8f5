//! Workflow orchestrator
//!
//! Drives the installation through a fixed sequence of steps and owns the
//! authoritative record of what happened.
//!
//! ```text
//! Discover -> ValidatePlan -> Partition -> CreatePool -> CreateDatasets
//!   -> Mount -> Bootstrap -> ConfigureSystem -> InstallBootloader
//!   -> Verify -> Done
//!
//! (any step can transition to Failed)
//! ```
//!
//! A step advances only when it succeeded. A failure stops the run where it
//! is: nothing is rolled back, so the disks are left exactly as the last
//! successful step left them. An abort request is honored between steps,
//! never inside one.
//!
//! Reaching `Done` runs one finalize pass: the boot partitions are unmounted
//! and the pool is exported. Its outcome is recorded in the journal but
//! cannot fail the run.

use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter};
use thiserror::Error;

use crate::boot::{BootConfigurator, BootRequest};
use crate::command::{CommandOutput, CommandRunner, DEFAULT_TIMEOUT, Invocation, tail};
use crate::disk::{self, BootMount, DeviceDescriptor, PartitionLayout};
use crate::error::{CommandFailure, InstallError};
use crate::hardware::FirmwareMode;
use crate::plan::{InstallPlan, Partitioning, PlanConfig};
use crate::pool::{self, MountedDataset, Pool, PoolSpec, TeardownReport};
use crate::process_guard::AbortFlag;
use crate::system;

// ============================================================================
// Steps
// ============================================================================

/// Workflow steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter)]
#[repr(u8)]
pub enum Step {
    Discover = 0,
    ValidatePlan = 1,
    /// Erases every selected device
    Partition = 2,
    CreatePool = 3,
    CreateDatasets = 4,
    Mount = 5,
    Bootstrap = 6,
    ConfigureSystem = 7,
    InstallBootloader = 8,
    Verify = 9,
    Done = 10,
    Failed = 255,
}

impl Step {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// True for steps that change disks or the target tree.
    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(
            self,
            Self::Partition
                | Self::CreatePool
                | Self::CreateDatasets
                | Self::Mount
                | Self::Bootstrap
                | Self::ConfigureSystem
                | Self::InstallBootloader
        )
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Discover => Some(Self::ValidatePlan),
            Self::ValidatePlan => Some(Self::Partition),
            Self::Partition => Some(Self::CreatePool),
            Self::CreatePool => Some(Self::CreateDatasets),
            Self::CreateDatasets => Some(Self::Mount),
            Self::Mount => Some(Self::Bootstrap),
            Self::Bootstrap => Some(Self::ConfigureSystem),
            Self::ConfigureSystem => Some(Self::InstallBootloader),
            Self::InstallBootloader => Some(Self::Verify),
            Self::Verify => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Discover => "Discovering block devices",
            Self::ValidatePlan => "Validating plan",
            Self::Partition => "Partitioning devices",
            Self::CreatePool => "Creating pool",
            Self::CreateDatasets => "Creating datasets",
            Self::Mount => "Mounting filesystems",
            Self::Bootstrap => "Installing base system",
            Self::ConfigureSystem => "Configuring system",
            Self::InstallBootloader => "Installing bootloader",
            Self::Verify => "Verifying boot configuration",
            Self::Done => "Installation complete",
            Self::Failed => "Installation failed",
        }
    }

    /// Steps that do work, in order.
    pub const fn work_steps() -> &'static [Self] {
        &[
            Self::Discover,
            Self::ValidatePlan,
            Self::Partition,
            Self::CreatePool,
            Self::CreateDatasets,
            Self::Mount,
            Self::Bootstrap,
            Self::ConfigureSystem,
            Self::InstallBootloader,
            Self::Verify,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Never started because the run stopped earlier
    Skipped,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot skip from {from} to {to}")]
    SkippedStep { from: Step, to: Step },

    #[error("cannot go backwards from {from} to {to}")]
    BackwardTransition { from: Step, to: Step },

    #[error("workflow already finished ({from})")]
    FromTerminalState { from: Step },

    #[error("{step} requires {upstream} to have succeeded, but it is {status}")]
    UpstreamIncomplete {
        step: Step,
        upstream: Step,
        status: StepStatus,
    },

    #[error("{step} is missing the {what} of an earlier step")]
    MissingArtifact { step: Step, what: &'static str },
}

// ============================================================================
// Context
// ============================================================================

/// Owns the current step and enforces forward-only transitions.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    current: Step,
    failed_at: Option<Step>,
    /// (step, unix timestamp) for every step entered
    history: Vec<(Step, u64)>,
}

impl Default for WorkflowContext {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self {
            current: Step::Discover,
            failed_at: None,
            history: vec![(Step::Discover, unix_now())],
        }
    }

    #[inline]
    pub fn current_step(&self) -> Step {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<Step> {
        self.failed_at
    }

    pub fn history(&self) -> &[(Step, u64)] {
        &self.history
    }

    pub fn advance(&mut self) -> Result<Step, TransitionError> {
        let next = self
            .current
            .next()
            .ok_or(TransitionError::FromTerminalState { from: self.current })?;
        self.transition_to(next)
    }

    /// Move to `target`, which must be the immediate successor.
    pub fn transition_to(&mut self, target: Step) -> Result<Step, TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminalState { from: self.current });
        }
        if target != Step::Failed && target.order() < self.current.order() {
            return Err(TransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }
        if self.current.next() != Some(target) {
            return Err(TransitionError::SkippedStep {
                from: self.current,
                to: target,
            });
        }

        self.history.push((target, unix_now()));
        self.current = target;
        Ok(target)
    }

    /// Mark the run as failed at the current step.
    pub fn fail(&mut self) -> Result<(), TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminalState { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.history.push((Step::Failed, unix_now()));
        self.current = Step::Failed;
        Ok(())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Step records and journal
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    #[serde(default)]
    pub detail: String,
    /// Error class of a failed step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Commands run by the step with output tails, kept in debug mode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
}

impl StepRecord {
    fn pending(step: Step) -> Self {
        Self {
            step,
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            detail: String::new(),
            error: None,
            commands: Vec::new(),
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RunStatus {
    Success,
    ValidationFailed {
        detail: String,
    },
    StepFailed {
        step: Step,
        kind: String,
        detail: String,
    },
    Aborted {
        before: Step,
        signal: Option<i32>,
    },
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::StepFailed { .. } => 1,
            Self::ValidationFailed { .. } => 2,
            Self::Aborted { .. } => 130,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "installation complete"),
            Self::ValidationFailed { detail } => write!(f, "plan rejected: {}", detail),
            Self::StepFailed { step, kind, detail } => {
                write!(f, "step {} failed ({}): {}", step, kind, detail)
            }
            Self::Aborted { before, .. } => write!(f, "aborted before step {}", before),
        }
    }
}

/// Ordered record of every step, persisted as the run journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLog {
    pub records: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunStatus>,
    /// Teardown after a successful run, absent when it was not attempted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<TeardownReport>,
}

impl Default for StepLog {
    fn default() -> Self {
        Self::new()
    }
}

impl StepLog {
    pub fn new() -> Self {
        Self {
            records: Step::work_steps()
                .iter()
                .map(|&step| StepRecord::pending(step))
                .collect(),
            outcome: None,
            finalize: None,
        }
    }

    pub fn get(&self, step: Step) -> Option<&StepRecord> {
        self.records.iter().find(|r| r.step == step)
    }

    fn get_mut(&mut self, step: Step) -> Option<&mut StepRecord> {
        self.records.iter_mut().find(|r| r.step == step)
    }

    pub fn status(&self, step: Step) -> StepStatus {
        self.get(step).map_or(StepStatus::Pending, |r| r.status)
    }

    /// Require every step ahead of `step` to have succeeded.
    pub fn check_upstream(&self, step: Step) -> Result<(), TransitionError> {
        match self
            .records
            .iter()
            .filter(|r| r.step.order() < step.order())
            .find(|r| r.status != StepStatus::Succeeded)
        {
            Some(record) => Err(TransitionError::UpstreamIncomplete {
                step,
                upstream: record.step,
                status: record.status,
            }),
            None => Ok(()),
        }
    }

    fn start(&mut self, step: Step) {
        if let Some(record) = self.get_mut(step) {
            record.status = StepStatus::Running;
            record.started_at = Some(unix_now());
        }
    }

    fn finish(
        &mut self,
        step: Step,
        status: StepStatus,
        detail: String,
        error: Option<&str>,
        commands: Vec<String>,
    ) {
        if let Some(record) = self.get_mut(step) {
            record.status = status;
            record.finished_at = Some(unix_now());
            record.detail = detail;
            record.error = error.map(str::to_string);
            record.commands = commands;
        }
    }

    fn skip_pending(&mut self) {
        for record in &mut self.records {
            if record.status == StepStatus::Pending {
                record.status = StepStatus::Skipped;
            }
        }
    }

    /// Write the journal as JSON, replacing the previous copy atomically.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize step log")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write journal: {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace journal: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read journal: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse journal: {}", path.display()))
    }
}

// ============================================================================
// Command transcript
// ============================================================================

/// Runner wrapper that remembers what a step ran.
struct Transcript<'a> {
    inner: &'a dyn CommandRunner,
    entries: RefCell<Vec<String>>,
}

impl<'a> Transcript<'a> {
    fn new(inner: &'a dyn CommandRunner) -> Self {
        Self {
            inner,
            entries: RefCell::new(Vec::new()),
        }
    }

    fn into_entries(self) -> Vec<String> {
        self.entries.into_inner()
    }
}

impl CommandRunner for Transcript<'_> {
    fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, CommandFailure> {
        tracing::debug!("$ {}", invocation);
        let result = self.inner.execute(invocation);

        let mut entry = format!("$ {}", invocation);
        match &result {
            Ok(output) => {
                match output.exit_code {
                    Some(code) => entry.push_str(&format!(" -> exit {}", code)),
                    None => entry.push_str(" -> killed by signal"),
                }
                for (name, text) in [("stdout", &output.stdout), ("stderr", &output.stderr)] {
                    let text = tail(text, 3);
                    if !text.trim().is_empty() {
                        entry.push_str(&format!("\n  {}: {}", name, text.trim_end()));
                    }
                }
            }
            Err(failure) => entry.push_str(&format!(" -> {}", failure)),
        }
        tracing::trace!("{}", entry);
        self.entries.borrow_mut().push(entry);

        result
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub firmware: FirmwareMode,
    /// Installed memory, used to size an unset swap volume (0 if unknown)
    pub memory_bytes: u64,
    /// Attach command transcripts to step records
    pub debug: bool,
    pub journal: Option<PathBuf>,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            firmware: FirmwareMode::Bios,
            memory_bytes: 0,
            debug: false,
            journal: None,
        }
    }
}

/// Products of completed steps consumed by later ones.
#[derive(Default)]
struct Artifacts {
    discovered: Option<Vec<DeviceDescriptor>>,
    plan: Option<InstallPlan>,
    layouts: Option<Vec<PartitionLayout>>,
    pool: Option<Pool>,
    swap: Option<PathBuf>,
    mounted: Option<Vec<MountedDataset>>,
    boot_mounts: Option<Vec<BootMount>>,
    boot: Option<BootConfigurator>,
}

fn need<'a, T>(
    value: &'a Option<T>,
    step: Step,
    what: &'static str,
) -> Result<&'a T, TransitionError> {
    value
        .as_ref()
        .ok_or(TransitionError::MissingArtifact { step, what })
}

pub struct Orchestrator<R: CommandRunner> {
    runner: R,
    config: PlanConfig,
    options: WorkflowOptions,
    abort: AbortFlag,
    context: WorkflowContext,
    log: StepLog,
    artifacts: Artifacts,
}

impl<R: CommandRunner> Orchestrator<R> {
    pub fn new(runner: R, config: PlanConfig, options: WorkflowOptions, abort: AbortFlag) -> Self {
        Self {
            runner,
            config,
            options,
            abort,
            context: WorkflowContext::new(),
            log: StepLog::new(),
            artifacts: Artifacts::default(),
        }
    }

    pub fn log(&self) -> &StepLog {
        &self.log
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.context
    }

    /// The validated plan, once `ValidatePlan` succeeded.
    pub fn plan(&self) -> Option<&InstallPlan> {
        self.artifacts.plan.as_ref()
    }

    /// The created pool, once `CreatePool` succeeded.
    pub fn pool(&self) -> Option<&Pool> {
        self.artifacts.pool.as_ref()
    }

    /// Run every remaining step and return the terminal status.
    pub fn run(&mut self) -> RunStatus {
        let status = loop {
            let step = self.context.current_step();
            if step == Step::Done {
                self.finalize();
                break RunStatus::Success;
            }

            if self.abort.is_requested() {
                tracing::warn!("Abort requested, stopping before {}", step);
                self.mark_failed();
                break RunStatus::Aborted {
                    before: step,
                    signal: self.abort.signal(),
                };
            }

            if let Err(status) = self.run_step(step) {
                self.mark_failed();
                break status;
            }

            if let Err(err) = self.context.advance() {
                self.mark_failed();
                break RunStatus::StepFailed {
                    step,
                    kind: "TransitionError".to_string(),
                    detail: err.to_string(),
                };
            }
        };

        self.log.skip_pending();
        self.log.outcome = Some(status.clone());
        self.persist();
        status
    }

    /// Release the target after Verify succeeded.
    fn finalize(&mut self) {
        let (Some(plan), Some(created)) = (&self.artifacts.plan, &self.artifacts.pool) else {
            return;
        };
        if !plan.finalize().export_pool {
            tracing::info!("Leaving {} mounted at {}", created.name, created.altroot.display());
            return;
        }

        tracing::info!("==> Finalizing");
        let boot_mounts = self.artifacts.boot_mounts.as_deref().unwrap_or_default();
        let report = pool::teardown(&self.runner, created, boot_mounts, plan.timeouts().command);
        self.log.finalize = Some(report);
    }

    fn mark_failed(&mut self) {
        if let Err(err) = self.context.fail() {
            tracing::error!("Could not mark run as failed: {}", err);
        }
    }

    fn persist(&self) {
        if let Some(path) = &self.options.journal {
            if let Err(err) = self.log.save(path) {
                tracing::warn!("Journal not updated: {:#}", err);
            }
        }
    }

    fn run_step(&mut self, step: Step) -> Result<(), RunStatus> {
        if step.is_destructive() {
            if let Err(err) = self.log.check_upstream(step) {
                tracing::error!("Refusing to run {}: {}", step, err);
                self.log.finish(
                    step,
                    StepStatus::Failed,
                    err.to_string(),
                    Some("TransitionError"),
                    Vec::new(),
                );
                return Err(RunStatus::StepFailed {
                    step,
                    kind: "TransitionError".to_string(),
                    detail: err.to_string(),
                });
            }
        }

        tracing::info!("==> {}", step.description());
        self.log.start(step);
        self.persist();

        let transcript = Transcript::new(&self.runner);
        let result = perform(
            step,
            &transcript,
            &self.config,
            &self.options,
            &mut self.artifacts,
        );
        let commands = if self.options.debug {
            transcript.into_entries()
        } else {
            Vec::new()
        };

        let outcome = match result {
            Ok(detail) => {
                tracing::info!("{} succeeded: {}", step, detail);
                self.log
                    .finish(step, StepStatus::Succeeded, detail, None, commands);
                Ok(())
            }
            Err(err) => {
                let detail = err.to_string();
                tracing::error!("{} failed: {}", step, detail);
                self.log.finish(
                    step,
                    StepStatus::Failed,
                    detail.clone(),
                    Some(err.kind()),
                    commands,
                );
                Err(if err.is_recoverable() {
                    RunStatus::ValidationFailed { detail }
                } else {
                    RunStatus::StepFailed {
                        step,
                        kind: err.kind().to_string(),
                        detail,
                    }
                })
            }
        };
        self.persist();
        outcome
    }
}

fn pre_validation_timeout(config: &PlanConfig) -> Duration {
    match config.execution.command_timeout_secs {
        0 => DEFAULT_TIMEOUT,
        secs => Duration::from_secs(secs),
    }
}

/// Execute one step, returning a short detail line for its record.
fn perform(
    step: Step,
    runner: &dyn CommandRunner,
    config: &PlanConfig,
    options: &WorkflowOptions,
    art: &mut Artifacts,
) -> Result<String, InstallError> {
    let firmware = options.firmware;
    match step {
        Step::Discover => {
            let devices = disk::discover(runner, firmware, pre_validation_timeout(config))?;
            let detail = format!("found {} disk(s) ({} firmware)", devices.len(), firmware);
            art.discovered = Some(devices);
            Ok(detail)
        }

        Step::ValidatePlan => {
            let discovered = need(&art.discovered, step, "device inventory")?;
            let plan = InstallPlan::from_config(config.clone().with_host_memory(options.memory_bytes))?;
            let selected = disk::select_devices(discovered, plan.devices())?;
            disk::validate_selection(&selected, plan.topology())?;

            let detail = format!(
                "{} pool {} on {}, {} with {}",
                plan.topology(),
                plan.pool_name(),
                selected
                    .iter()
                    .map(|d| d.path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                plan.bootloader(),
                plan.kernel(),
            );
            art.plan = Some(plan);
            Ok(detail)
        }

        Step::Partition => {
            let plan = need(&art.plan, step, "validated plan")?;
            let timeout = plan.timeouts().command;
            let mut layouts = Vec::with_capacity(plan.devices().len());
            let detail = match plan.partitioning() {
                Partitioning::Wipe => {
                    for device in plan.devices() {
                        let layout = PartitionLayout::standard(device, plan.boot().separate_boot);
                        layouts.push(disk::partition(runner, &layout, timeout)?);
                    }
                    format!("partitioned {} device(s)", layouts.len())
                }
                Partitioning::Existing { partitions } => {
                    for (device, parts) in plan.devices().iter().zip(partitions) {
                        let layout = PartitionLayout::existing(
                            device,
                            &parts.efi,
                            parts.boot.as_deref(),
                            &parts.zfs,
                        );
                        layouts.push(disk::prepare_existing(runner, &layout, timeout)?);
                    }
                    format!("prepared existing partitions on {} device(s)", layouts.len())
                }
            };
            art.layouts = Some(layouts);
            Ok(detail)
        }

        Step::CreatePool => {
            let plan = need(&art.plan, step, "validated plan")?;
            let layouts = need(&art.layouts, step, "partition layouts")?;
            let spec = PoolSpec::from_plan(plan, layouts);
            let created = pool::create_pool(runner, &spec, plan.encryption(), plan.timeouts().command)?;
            let detail = created.to_string();
            art.pool = Some(created);
            Ok(detail)
        }

        Step::CreateDatasets => {
            let plan = need(&art.plan, step, "validated plan")?;
            let created = need(&art.pool, step, "pool")?;
            let timeout = plan.timeouts().command;

            pool::create_dataset_tree(runner, created, plan.datasets(), timeout)?;
            if plan.swap_gib() > 0 {
                art.swap = Some(pool::create_swap_volume(
                    runner,
                    created,
                    plan.swap_gib(),
                    timeout,
                )?);
            }
            pool::set_bootfs(runner, created, plan.root_dataset(), timeout)?;

            Ok(format!(
                "{} dataset(s){}",
                plan.datasets().len(),
                if art.swap.is_some() { " and swap volume" } else { "" }
            ))
        }

        Step::Mount => {
            let plan = need(&art.plan, step, "validated plan")?;
            let created = need(&art.pool, step, "pool")?;
            let layouts = need(&art.layouts, step, "partition layouts")?;
            let timeout = plan.timeouts().command;

            let mounted = pool::mount_all(runner, created, plan.datasets(), timeout)?;
            let first = layouts
                .first()
                .ok_or(TransitionError::MissingArtifact { step, what: "boot device layout" })?;
            let boot_mounts =
                disk::mount_boot_partitions(runner, first, plan.target(), plan.bootloader(), timeout)?;

            let detail = format!(
                "{} dataset(s) and {} boot partition(s) under {}",
                mounted.len(),
                boot_mounts.len(),
                plan.target().display()
            );
            art.mounted = Some(mounted);
            art.boot_mounts = Some(boot_mounts);
            Ok(detail)
        }

        Step::Bootstrap => {
            let plan = need(&art.plan, step, "validated plan")?;
            let created = need(&art.pool, step, "pool")?;
            let mounted = need(&art.mounted, step, "mounted datasets")?;
            let boot_mounts = need(&art.boot_mounts, step, "boot mounts")?;

            let mut warnings = Vec::new();
            if plan.mirrors().enabled {
                if let Err(err) = system::rank_mirrors(runner, plan.mirrors(), plan.timeouts().command) {
                    tracing::warn!("Mirror ranking failed, keeping the current mirrorlist: {}", err);
                    warnings.push(format!("mirror ranking failed: {}", err));
                }
            }

            let packages = system::package_list(plan);
            system::bootstrap(
                runner,
                plan.target(),
                &packages,
                plan.retry_policy(),
                plan.timeouts().bootstrap,
            )?;
            let fstab = system::generate_fstab(
                runner,
                created,
                mounted,
                boot_mounts,
                art.swap.as_deref(),
                plan.timeouts().command,
            )?;

            let mut detail = format!(
                "installed {} package(s), wrote {}",
                packages.len(),
                fstab.display()
            );
            if !warnings.is_empty() {
                detail.push_str(&format!("; warnings: {}", warnings.join("; ")));
            }
            Ok(detail)
        }

        Step::ConfigureSystem => {
            let plan = need(&art.plan, step, "validated plan")?;
            let created = need(&art.pool, step, "pool")?;
            let report = system::configure_system(runner, plan, created, plan.timeouts().command)?;

            let mut detail = format!("configured {}", plan.system().hostname);
            if !report.warnings.is_empty() {
                detail.push_str(&format!("; warnings: {}", report.warnings.join("; ")));
            }
            Ok(detail)
        }

        Step::InstallBootloader => {
            let plan = need(&art.plan, step, "validated plan")?;
            let mut boot = BootConfigurator::new(BootRequest::from_plan(plan));
            boot.install(runner)?;
            let detail = format!("{} ({})", plan.bootloader(), boot.state());
            art.boot = Some(boot);
            Ok(detail)
        }

        Step::Verify => {
            let boot = art
                .boot
                .as_mut()
                .ok_or(TransitionError::MissingArtifact { step, what: "bootloader" })?;
            boot.verify(runner)?;
            Ok(format!(
                "{} entry present, root {}",
                boot.request().bootloader.efi_label(),
                boot.request().root_parameter()
            ))
        }

        Step::Done | Step::Failed => Err(TransitionError::FromTerminalState { from: step }.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_step_chain_covers_work_steps() {
        let mut chain = vec![Step::Discover];
        let mut current = Step::Discover;
        while let Some(next) = current.next() {
            chain.push(next);
            current = next;
        }
        assert_eq!(chain.last(), Some(&Step::Done));
        assert_eq!(&chain[..chain.len() - 1], Step::work_steps());
    }

    #[test]
    fn test_step_order_is_sequential() {
        for (i, step) in Step::work_steps().iter().enumerate() {
            assert_eq!(step.order() as usize, i);
        }
        assert!(Step::iter().filter(|s| s.is_terminal()).count() == 2);
    }

    #[test]
    fn test_only_mutating_steps_are_destructive() {
        assert!(!Step::Discover.is_destructive());
        assert!(!Step::ValidatePlan.is_destructive());
        assert!(Step::Partition.is_destructive());
        assert!(Step::InstallBootloader.is_destructive());
        assert!(!Step::Verify.is_destructive());
    }

    #[test]
    fn test_context_rejects_skip_and_backward() {
        let mut ctx = WorkflowContext::new();
        assert_eq!(
            ctx.transition_to(Step::Partition),
            Err(TransitionError::SkippedStep {
                from: Step::Discover,
                to: Step::Partition
            })
        );
        ctx.advance().expect("advance");
        ctx.advance().expect("advance");
        assert_eq!(ctx.current_step(), Step::Partition);
        assert!(matches!(
            ctx.transition_to(Step::Discover),
            Err(TransitionError::BackwardTransition { .. })
        ));
    }

    #[test]
    fn test_context_fail_is_terminal() {
        let mut ctx = WorkflowContext::new();
        ctx.advance().expect("advance");
        ctx.fail().expect("fail");
        assert_eq!(ctx.current_step(), Step::Failed);
        assert_eq!(ctx.failed_at(), Some(Step::ValidatePlan));
        assert!(ctx.advance().is_err());
        assert!(ctx.fail().is_err());
    }

    #[test]
    fn test_upstream_check() {
        let mut log = StepLog::new();
        assert_eq!(
            log.check_upstream(Step::Partition),
            Err(TransitionError::UpstreamIncomplete {
                step: Step::Partition,
                upstream: Step::Discover,
                status: StepStatus::Pending
            })
        );
        log.finish(Step::Discover, StepStatus::Succeeded, String::new(), None, Vec::new());
        log.finish(Step::ValidatePlan, StepStatus::Succeeded, String::new(), None, Vec::new());
        assert_eq!(log.check_upstream(Step::Partition), Ok(()));
    }

    #[test]
    fn test_journal_round_trip() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("journal.json");

        let mut log = StepLog::new();
        log.start(Step::Discover);
        log.finish(
            Step::Discover,
            StepStatus::Succeeded,
            "found 1 disk(s)".to_string(),
            None,
            vec!["$ lsblk -J".to_string()],
        );
        log.outcome = Some(RunStatus::Aborted {
            before: Step::ValidatePlan,
            signal: Some(2),
        });
        log.save(&path).expect("save");

        assert!(!path.with_extension("tmp").exists());
        let loaded = StepLog::load(&path).expect("load");
        assert_eq!(loaded, log);

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"status\": \"succeeded\""));
        assert!(raw.contains("\"status\": \"aborted\""));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Success.exit_code(), 0);
        assert_eq!(
            RunStatus::StepFailed {
                step: Step::Bootstrap,
                kind: "BootstrapError".to_string(),
                detail: String::new()
            }
            .exit_code(),
            1
        );
        assert_eq!(RunStatus::ValidationFailed { detail: String::new() }.exit_code(), 2);
        assert_eq!(
            RunStatus::Aborted {
                before: Step::Partition,
                signal: None
            }
            .exit_code(),
            130
        );
    }
}
