//! The installation pipeline.
//!
//! A run takes one catalog entry from `Queued` to `Committed` (or `Failed`):
//! approval check, source policy, private temp download, the artifact gates,
//! installer execution, then one whole-entry catalog write. Any failure leaves
//! the catalog untouched and the temp workspace removed.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};

use crate::catalog::entry::{CatalogEntry, InstallerKind};
use crate::catalog::locks::{EntryGuard, EntryLocks};
use crate::catalog::store::CatalogRepository;
use crate::core::config::PipelineConfig;
use crate::core::errors::{DeployError, Gate, Result};
use crate::core::network::{NetworkConfigProvider, resolve_download_url};
use crate::logger::audit::{AuditAction, AuditRecord, AuditSink};
use crate::pipeline::attempt::{ActionKind, InstallationAttempt, Stage};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::download::{ArtifactFetcher, TempWorkspace};
use crate::pipeline::installer::{ExecutionOutcome, InstallerRegistry};
use crate::pipeline::pool::{JobHandle, WorkerPool};
use crate::pipeline::process::ProcessSupervisor;
use crate::pipeline::progress::{Band, NullProgress, ProgressReporter, ProgressSink};
use crate::verify::gate::{ArtifactExpectations, GateSubject, SecurityGateChain};

/// Who started a run, how to cancel it, and where its progress goes.
#[derive(Clone)]
pub struct RunContext {
    pub actor: String,
    pub cancel: CancellationToken,
    pub progress: Arc<dyn ProgressSink>,
}

impl RunContext {
    #[must_use]
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            cancel: CancellationToken::new(),
            progress: Arc::new(NullProgress),
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// The artifact a run installs: where it comes from and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source: String,
    pub checksum: Option<String>,
    pub version: Option<String>,
}

impl Delivery {
    /// The entry's current release.
    #[must_use]
    pub fn current(entry: &CatalogEntry) -> Self {
        Self {
            source: entry.download_url.clone(),
            checksum: entry.checksum.clone(),
            version: entry.current_version.clone(),
        }
    }
}

/// Stage, status and progress bookkeeping for one run.
pub struct RunTracker {
    attempt: InstallationAttempt,
    reporter: ProgressReporter,
}

impl RunTracker {
    #[must_use]
    pub fn begin(entry_code: &str, action: ActionKind, ctx: &RunContext) -> Self {
        let mut tracker = Self {
            attempt: InstallationAttempt::start(entry_code, action, Utc::now()),
            reporter: ProgressReporter::new(entry_code, Arc::clone(&ctx.progress)),
        };
        tracker.advance(Stage::Queued, Band::Prepare, 0.0, "queued");
        tracker
    }

    pub fn advance(&mut self, stage: Stage, band: Band, within: f64, message: &str) {
        self.attempt.advance(stage);
        let fraction = self.reporter.report(self.attempt.stage, band, within, message);
        self.attempt.set_progress(fraction);
    }

    fn bytes(&mut self, downloaded: u64, total: Option<u64>) {
        let fraction = self.reporter.bytes(downloaded, total);
        self.attempt.set_progress(fraction);
    }

    pub fn succeed(&mut self) {
        self.advance(Stage::Committed, Band::Commit, 1.0, "committed");
        self.attempt.succeed(Utc::now());
    }

    pub fn fail(&mut self, error: &DeployError) {
        self.attempt.fail(error, Utc::now());
    }

    #[must_use]
    pub const fn attempt(&self) -> &InstallationAttempt {
        &self.attempt
    }

    #[must_use]
    pub fn into_attempt(self) -> InstallationAttempt {
        self.attempt
    }
}

/// Structured outcome of install / uninstall. Never a panic, never a bare error.
#[derive(Debug)]
pub struct InstallationResult {
    pub success: bool,
    /// Entry state after the run (as committed on success, as found on failure).
    pub entry: Option<CatalogEntry>,
    pub error: Option<DeployError>,
    pub restart_required: bool,
    pub attempt: InstallationAttempt,
}

impl InstallationResult {
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success,
            "entry": self.attempt.entry_code,
            "action": self.attempt.action,
            "stage": self.attempt.stage,
            "failed_at": self.attempt.failed_at,
            "restart_required": self.restart_required,
            "version": self.entry.as_ref().and_then(|e| e.current_version.clone()),
            "error_code": self.error.as_ref().map(DeployError::code),
            "error_message": self.error_message(),
            "duration_ms": self.attempt.duration_ms(),
        })
    }
}

/// Timeouts and temp location for runs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub temp_root: std::path::PathBuf,
    pub install_timeout: Duration,
    pub uninstall_timeout: Duration,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            temp_root: config.temp_root.clone(),
            install_timeout: Duration::from_secs(config.install_timeout_secs),
            uninstall_timeout: Duration::from_secs(config.uninstall_timeout_secs),
        }
    }
}

pub struct InstallationPipeline {
    catalog: Arc<dyn CatalogRepository>,
    gates: Arc<SecurityGateChain>,
    fetcher: Arc<dyn ArtifactFetcher>,
    network: Arc<dyn NetworkConfigProvider>,
    installers: InstallerRegistry,
    supervisor: ProcessSupervisor,
    audit: Arc<dyn AuditSink>,
    locks: EntryLocks,
    settings: PipelineSettings,
}

impl InstallationPipeline {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        gates: Arc<SecurityGateChain>,
        fetcher: Arc<dyn ArtifactFetcher>,
        network: Arc<dyn NetworkConfigProvider>,
        installers: InstallerRegistry,
        supervisor: ProcessSupervisor,
        audit: Arc<dyn AuditSink>,
        locks: EntryLocks,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            catalog,
            gates,
            fetcher,
            network,
            installers,
            supervisor,
            audit,
            locks,
            settings,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn CatalogRepository> {
        &self.catalog
    }

    #[must_use]
    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    #[must_use]
    pub const fn locks(&self) -> &EntryLocks {
        &self.locks
    }

    /// Claim the per-entry lock. A second concurrent caller gets `EntryBusy`.
    pub fn lock(&self, code: &str) -> Result<EntryGuard> {
        self.locks.try_acquire(code)
    }

    /// Install an approved entry from its current release.
    pub fn install(&self, code: &str, ctx: &RunContext) -> InstallationResult {
        let mut tracker = RunTracker::begin(code, ActionKind::Install, ctx);
        let mut snapshot = None;
        let outcome = self.try_install(code, ctx, &mut tracker, &mut snapshot);
        self.finish(tracker, outcome, snapshot, ctx, AuditAction::Install)
    }

    fn try_install(
        &self,
        code: &str,
        ctx: &RunContext,
        tracker: &mut RunTracker,
        snapshot: &mut Option<CatalogEntry>,
    ) -> Result<(CatalogEntry, ExecutionOutcome)> {
        let guard = self.lock(code)?;
        let entry = self.catalog.require(code)?;
        *snapshot = Some(entry.clone());
        if !entry.is_approved() {
            return Err(DeployError::NotApproved {
                code: code.to_string(),
            });
        }

        let outcome = self.install_artifact(
            &guard,
            &entry,
            &Delivery::current(&entry),
            tracker,
            ctx,
        )?;

        let mut committed = self.catalog.require(code)?;
        let now = Utc::now();
        if committed.current_version.is_none() {
            committed.current_version = Some(UNVERSIONED.to_string());
        }
        committed.installed_at = Some(now);
        committed.last_error = None;
        committed.updated_at = now;
        self.catalog.save(&committed)?;
        Ok((committed, outcome))
    }

    /// Remove an installed entry using its stored uninstall command.
    pub fn uninstall(&self, code: &str, ctx: &RunContext) -> InstallationResult {
        let mut tracker = RunTracker::begin(code, ActionKind::Uninstall, ctx);
        let mut snapshot = None;
        let outcome = self.try_uninstall(code, ctx, &mut tracker, &mut snapshot);
        self.finish(tracker, outcome, snapshot, ctx, AuditAction::Uninstall)
    }

    fn try_uninstall(
        &self,
        code: &str,
        ctx: &RunContext,
        tracker: &mut RunTracker,
        snapshot: &mut Option<CatalogEntry>,
    ) -> Result<(CatalogEntry, ExecutionOutcome)> {
        let _guard = self.lock(code)?;
        let entry = self.catalog.require(code)?;
        *snapshot = Some(entry.clone());
        if !entry.is_installed() {
            return Err(DeployError::InvalidState {
                code: code.to_string(),
                details: "entry is not installed".to_string(),
            });
        }

        tracker.advance(Stage::Executing, Band::Execute, 0.0, "running uninstaller");
        let outcome = match self.installers.uninstall_plan(&entry)? {
            Some(command) => self.installers.execute(
                &command,
                &self.supervisor,
                self.settings.uninstall_timeout,
                &ctx.cancel,
            )?,
            None => ExecutionOutcome {
                exit_code: 0,
                restart_required: false,
            },
        };
        tracker.advance(Stage::Executing, Band::Execute, 1.0, "uninstaller finished");
        ctx.cancel.check("committing")?;

        let mut committed = self.catalog.require(code)?;
        let now = Utc::now();
        committed.installed_at = None;
        committed.previous = None;
        committed.pending = None;
        committed.update_approval = None;
        committed.failure_count = 0;
        committed.last_error = None;
        committed.updated_at = now;
        self.catalog.save(&committed)?;
        Ok((committed, outcome))
    }

    /// Source check, download, gates and installer for one delivery.
    ///
    /// The caller holds the entry lock and owns the catalog write that follows.
    /// The temp workspace is gone when this returns, whatever the outcome.
    pub fn install_artifact(
        &self,
        _guard: &EntryGuard,
        entry: &CatalogEntry,
        delivery: &Delivery,
        tracker: &mut RunTracker,
        ctx: &RunContext,
    ) -> Result<ExecutionOutcome> {
        let action = tracker.attempt().action;
        let subject = GateSubject {
            entry_code: entry.code.clone(),
            actor: ctx.actor.clone(),
            version: delivery.version.clone(),
            action: audit_action(action),
        };
        ctx.cancel.check("queued")?;

        if entry.kind == InstallerKind::PackageManager {
            tracker.advance(Stage::ScanCompleted, Band::Verify, 1.0, "package manager source");
            return self.execute(entry, None, tracker, ctx);
        }

        let source = resolve_download_url(self.network.as_ref(), &delivery.source);
        self.gates.check_source(&source, &subject)?;
        tracker.advance(Stage::SourceValidated, Band::Prepare, 1.0, "source allowed");

        let workspace = TempWorkspace::create(&self.settings.temp_root, &entry.code)?;
        let artifact = workspace.artifact_path(&source);
        tracker.advance(Stage::Downloading, Band::Download, 0.0, "downloading");
        self.fetcher
            .fetch(&source, &artifact, &ctx.cancel, &mut |done, total| {
                tracker.bytes(done, total);
            })?;
        tracker.advance(Stage::Downloading, Band::Download, 1.0, "downloaded");

        self.gates.verify_artifact(
            &artifact,
            ArtifactExpectations {
                checksum: delivery.checksum.as_deref(),
                signature: &entry.signature,
            },
            &subject,
            &ctx.cancel,
            &mut |gate| match gate {
                Gate::Checksum => {
                    tracker.advance(Stage::ChecksumVerified, Band::Verify, 1.0 / 3.0, "checksum ok");
                }
                Gate::Signature => {
                    tracker.advance(Stage::SignatureVerified, Band::Verify, 2.0 / 3.0, "signature ok");
                }
                Gate::MalwareScan => {
                    tracker.advance(Stage::ScanCompleted, Band::Verify, 1.0, "scan complete");
                }
                Gate::SourcePolicy => {}
            },
        )?;

        let outcome = self.execute(entry, Some(&artifact), tracker, ctx);
        drop(workspace);
        outcome
    }

    fn execute(
        &self,
        entry: &CatalogEntry,
        artifact: Option<&std::path::Path>,
        tracker: &mut RunTracker,
        ctx: &RunContext,
    ) -> Result<ExecutionOutcome> {
        let plan = self.installers.install_plan(entry, artifact)?;
        tracker.advance(Stage::Executing, Band::Execute, 0.0, "running installer");
        let outcome = self.installers.run_plan(
            &plan,
            &self.supervisor,
            self.settings.install_timeout,
            &ctx.cancel,
        )?;
        tracker.advance(Stage::Executing, Band::Execute, 1.0, "installer finished");
        ctx.cancel.check("committing")?;
        Ok(outcome)
    }

    fn finish(
        &self,
        mut tracker: RunTracker,
        outcome: Result<(CatalogEntry, ExecutionOutcome)>,
        snapshot: Option<CatalogEntry>,
        ctx: &RunContext,
        action: AuditAction,
    ) -> InstallationResult {
        match outcome {
            Ok((entry, execution)) => {
                tracker.succeed();
                let attempt = tracker.into_attempt();
                let mut record = AuditRecord::new(
                    action,
                    &ctx.actor,
                    format!("{} {} succeeded", attempt.action, entry.code),
                )
                .entry(&entry.code)
                .version(entry.current_version.as_deref());
                if let Some(ms) = attempt.duration_ms() {
                    record = record.duration_ms(ms);
                }
                if execution.restart_required {
                    record.details.push_str("; restart required");
                }
                self.audit.log(record);
                InstallationResult {
                    success: true,
                    entry: Some(entry),
                    error: None,
                    restart_required: execution.restart_required,
                    attempt,
                }
            }
            Err(error) => {
                tracker.fail(&error);
                let attempt = tracker.into_attempt();
                // Gate failures were already audited by the gate chain.
                if error.gate().is_none() {
                    let mut record = AuditRecord::failure(action, &ctx.actor, &error)
                        .entry(&attempt.entry_code);
                    if let Some(ms) = attempt.duration_ms() {
                        record = record.duration_ms(ms);
                    }
                    self.audit.log(record);
                }
                InstallationResult {
                    success: false,
                    entry: snapshot,
                    error: Some(error),
                    restart_required: false,
                    attempt,
                }
            }
        }
    }

    /// Queue an install on `pool`. The handle cancels the run.
    pub fn submit_install(
        self: &Arc<Self>,
        pool: &WorkerPool,
        code: &str,
        ctx: RunContext,
    ) -> Result<JobHandle<InstallationResult>> {
        let pipeline = Arc::clone(self);
        let code = code.to_string();
        let token = ctx.cancel.clone();
        pool.submit(token, move |_| pipeline.install(&code, &ctx))
    }

    /// Queue an uninstall on `pool`.
    pub fn submit_uninstall(
        self: &Arc<Self>,
        pool: &WorkerPool,
        code: &str,
        ctx: RunContext,
    ) -> Result<JobHandle<InstallationResult>> {
        let pipeline = Arc::clone(self);
        let code = code.to_string();
        let token = ctx.cancel.clone();
        pool.submit(token, move |_| pipeline.uninstall(&code, &ctx))
    }
}

/// Version recorded for entries installed without a declared version.
pub const UNVERSIONED: &str = "unversioned";

const fn audit_action(action: ActionKind) -> AuditAction {
    match action {
        ActionKind::Install => AuditAction::Install,
        ActionKind::Uninstall => AuditAction::Uninstall,
        ActionKind::Update => AuditAction::Update,
        ActionKind::Rollback => AuditAction::Rollback,
    }
}
