//! Update orchestration: check, approve, install, roll back, sweep, dispatch.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};

use crate::catalog::entry::CatalogEntry;
use crate::catalog::store::{CatalogQuery, CatalogRepository};
use crate::core::config::SchedulerConfig;
use crate::core::errors::{DeployError, Result};
use crate::logger::audit::{AuditAction, AuditRecord, AuditSink};
use crate::pipeline::attempt::ActionKind;
use crate::pipeline::runner::{Delivery, InstallationPipeline, RunContext, RunTracker};
use crate::updates::checker::{UpdateFeed, extract_release};
use crate::updates::state::{self, CheckOutcome};

/// Outcome of one update check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateCheckResult {
    pub update_found: bool,
    pub new_version: Option<String>,
    pub message: String,
    pub outcome: CheckOutcome,
}

impl From<CheckOutcome> for UpdateCheckResult {
    fn from(outcome: CheckOutcome) -> Self {
        let (update_found, new_version, message) = match &outcome {
            CheckOutcome::NotConfigured => {
                (false, None, "update checks are not configured".to_string())
            }
            CheckOutcome::NoUpdate => (false, None, "already up to date".to_string()),
            CheckOutcome::UpdateFound {
                version,
                auto_approved,
            } => (
                true,
                Some(version.clone()),
                if *auto_approved {
                    format!("update {version} available and auto-approved")
                } else {
                    format!("update {version} available, awaiting approval")
                },
            ),
            CheckOutcome::AlreadyPending { version } => (
                true,
                Some(version.clone()),
                format!("update {version} already pending"),
            ),
        };
        Self {
            update_found,
            new_version,
            message,
            outcome,
        }
    }
}

/// Outcome of an update install or rollback.
#[derive(Debug)]
pub struct UpdateResult {
    pub success: bool,
    pub entry_code: String,
    pub action: ActionKind,
    pub new_version: Option<String>,
    pub restart_required: bool,
    pub error: Option<DeployError>,
}

impl UpdateResult {
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success,
            "entry": self.entry_code,
            "action": self.action,
            "new_version": self.new_version,
            "restart_required": self.restart_required,
            "error_code": self.error.as_ref().map(DeployError::code),
            "error_message": self.error_message(),
        })
    }

    fn failed(entry_code: &str, action: ActionKind, error: DeployError) -> Self {
        Self {
            success: false,
            entry_code: entry_code.to_string(),
            action,
            new_version: None,
            restart_required: false,
            error: Some(error),
        }
    }
}

/// Dispatcher limits.
#[derive(Debug, Clone, Copy)]
pub struct UpdateSettings {
    pub failure_ceiling: u32,
    pub parallelism: usize,
}

impl From<&SchedulerConfig> for UpdateSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            failure_ceiling: config.failure_ceiling,
            parallelism: config.auto_update_parallelism,
        }
    }
}

pub struct UpdateManager {
    pipeline: Arc<InstallationPipeline>,
    feed: Arc<dyn UpdateFeed>,
    settings: UpdateSettings,
}

impl UpdateManager {
    #[must_use]
    pub fn new(
        pipeline: Arc<InstallationPipeline>,
        feed: Arc<dyn UpdateFeed>,
        settings: UpdateSettings,
    ) -> Self {
        Self {
            pipeline,
            feed,
            settings,
        }
    }

    fn catalog(&self) -> &Arc<dyn CatalogRepository> {
        self.pipeline.catalog()
    }

    fn audit(&self) -> &Arc<dyn AuditSink> {
        self.pipeline.audit()
    }

    #[must_use]
    pub const fn settings(&self) -> UpdateSettings {
        self.settings
    }

    /// Fetch the entry's check URL and record what it advertises.
    pub fn check_for_update(
        &self,
        code: &str,
        ctx: &RunContext,
        now: DateTime<Utc>,
    ) -> Result<UpdateCheckResult> {
        let _guard = self.pipeline.lock(code)?;
        let mut entry = self.catalog().require(code)?;
        let Some(url) = entry.update_check_url.clone().filter(|u| !u.trim().is_empty()) else {
            return Ok(CheckOutcome::NotConfigured.into());
        };

        let release = self
            .feed
            .fetch(&url, &ctx.cancel)
            .and_then(|body| extract_release(&body));

        let release = match release {
            Ok(release) => release,
            Err(err) => {
                if !matches!(err, DeployError::Cancelled { .. }) {
                    entry.last_update_check = Some(now);
                    entry.last_error = Some(err.to_string());
                    entry.updated_at = now;
                    self.catalog().save(&entry)?;
                }
                self.audit().log(
                    AuditRecord::failure(AuditAction::UpdateCheck, &ctx.actor, &err).entry(code),
                );
                return Err(err);
            }
        };

        let outcome = state::record_check(&mut entry, release, now);
        self.catalog().save(&entry)?;
        let result = UpdateCheckResult::from(outcome);
        self.audit().log(
            AuditRecord::new(AuditAction::UpdateCheck, &ctx.actor, result.message.clone())
                .entry(code)
                .version(result.new_version.as_deref()),
        );
        Ok(result)
    }

    /// Approve the pending update of `code`.
    pub fn approve_update(&self, code: &str, approved_by: &str, now: DateTime<Utc>) -> Result<CatalogEntry> {
        let _guard = self.pipeline.lock(code)?;
        let mut entry = self.catalog().require(code)?;
        state::approve(&mut entry, approved_by, now)?;
        self.catalog().save(&entry)?;
        let version = entry.pending.as_ref().map(|p| p.version.clone());
        let expiry = entry
            .update_approval
            .as_ref()
            .and_then(|a| a.expires_at)
            .map_or_else(|| "never expires".to_string(), |at| format!("expires {}", at.to_rfc3339()));
        self.audit().log(
            AuditRecord::new(
                AuditAction::UpdateApproved,
                approved_by,
                format!("update approved ({expiry})"),
            )
            .entry(code)
            .version(version),
        );
        Ok(entry)
    }

    /// Install the pending update if it is ready.
    pub fn install_update(&self, code: &str, ctx: &RunContext, now: DateTime<Utc>) -> UpdateResult {
        match self.try_install_update(code, ctx, now) {
            Ok(result) | Err(result) => result,
        }
    }

    fn try_install_update(
        &self,
        code: &str,
        ctx: &RunContext,
        now: DateTime<Utc>,
    ) -> std::result::Result<UpdateResult, UpdateResult> {
        let action = ActionKind::Update;
        let fail = |err: DeployError| {
            self.audit_failure(AuditAction::Update, ctx, code, &err);
            UpdateResult::failed(code, action, err)
        };
        let guard = self.pipeline.lock(code).map_err(fail)?;
        let entry = self.catalog().require(code).map_err(fail)?;
        if !entry.is_approved() {
            return Err(fail(DeployError::NotApproved {
                code: code.to_string(),
            }));
        }
        if !entry.is_installed() {
            return Err(fail(DeployError::InvalidState {
                code: code.to_string(),
                details: "entry is not installed".to_string(),
            }));
        }
        let Some(pending) = entry.pending.clone() else {
            return Err(fail(DeployError::InvalidState {
                code: code.to_string(),
                details: "no pending update".to_string(),
            }));
        };
        if !state::is_ready_to_install(&entry, now) {
            return Err(fail(DeployError::NotApproved {
                code: code.to_string(),
            }));
        }

        let delivery = Delivery {
            source: pending
                .download_url
                .clone()
                .unwrap_or_else(|| entry.download_url.clone()),
            checksum: pending.checksum.clone(),
            version: Some(pending.version.clone()),
        };
        let mut tracker = RunTracker::begin(code, action, ctx);
        let outcome = self
            .pipeline
            .install_artifact(&guard, &entry, &delivery, &mut tracker, ctx);

        let mut fresh = self.catalog().require(code).map_err(fail)?;
        match outcome {
            Ok(execution) => {
                state::complete_update(&mut fresh, Utc::now()).map_err(fail)?;
                self.catalog().save(&fresh).map_err(fail)?;
                tracker.succeed();
                let mut record = AuditRecord::new(
                    AuditAction::Update,
                    &ctx.actor,
                    format!(
                        "updated {} -> {}",
                        entry.current_version.as_deref().unwrap_or("?"),
                        pending.version
                    ),
                )
                .entry(code)
                .version(Some(pending.version.clone()));
                if let Some(ms) = tracker.attempt().duration_ms() {
                    record = record.duration_ms(ms);
                }
                self.audit().log(record);
                Ok(UpdateResult {
                    success: true,
                    entry_code: code.to_string(),
                    action,
                    new_version: Some(pending.version),
                    restart_required: execution.restart_required,
                    error: None,
                })
            }
            Err(err) => {
                tracker.fail(&err);
                if !matches!(err, DeployError::Cancelled { .. }) {
                    state::mark_failed(&mut fresh, &err.to_string(), Utc::now());
                    if err.is_security_failure() {
                        state::trip_breaker(&mut fresh, self.settings.failure_ceiling);
                    }
                    self.catalog().save(&fresh).map_err(|e| UpdateResult::failed(code, action, e))?;
                }
                if err.gate().is_none() {
                    self.audit_failure(AuditAction::Update, ctx, code, &err);
                }
                Err(UpdateResult::failed(code, action, err))
            }
        }
    }

    /// Reinstall the previous release and swap current/previous.
    pub fn rollback(&self, code: &str, ctx: &RunContext) -> UpdateResult {
        match self.try_rollback(code, ctx) {
            Ok(result) | Err(result) => result,
        }
    }

    fn try_rollback(
        &self,
        code: &str,
        ctx: &RunContext,
    ) -> std::result::Result<UpdateResult, UpdateResult> {
        let action = ActionKind::Rollback;
        let fail = |err: DeployError| {
            if err.gate().is_none() {
                self.audit_failure(AuditAction::Rollback, ctx, code, &err);
            }
            UpdateResult::failed(code, action, err)
        };
        let guard = self.pipeline.lock(code).map_err(fail)?;
        let entry = self.catalog().require(code).map_err(fail)?;
        if !entry.is_approved() {
            return Err(fail(DeployError::NotApproved {
                code: code.to_string(),
            }));
        }
        let Some(previous) = entry.previous.clone() else {
            return Err(fail(DeployError::RollbackUnavailable {
                code: code.to_string(),
            }));
        };
        if !entry.is_installed() {
            return Err(fail(DeployError::InvalidState {
                code: code.to_string(),
                details: "entry is not installed".to_string(),
            }));
        }

        let delivery = Delivery {
            source: previous.download_url.clone(),
            checksum: previous.checksum.clone(),
            version: Some(previous.version.clone()),
        };
        let mut tracker = RunTracker::begin(code, action, ctx);
        let execution = match self
            .pipeline
            .install_artifact(&guard, &entry, &delivery, &mut tracker, ctx)
        {
            Ok(execution) => execution,
            Err(err) => {
                tracker.fail(&err);
                return Err(fail(err));
            }
        };

        let mut fresh = self.catalog().require(code).map_err(fail)?;
        state::rollback_swap(&mut fresh, Utc::now()).map_err(fail)?;
        self.catalog().save(&fresh).map_err(fail)?;
        tracker.succeed();
        self.audit().log(
            AuditRecord::new(
                AuditAction::Rollback,
                &ctx.actor,
                format!(
                    "rolled back {} -> {}",
                    entry.current_version.as_deref().unwrap_or("?"),
                    previous.version
                ),
            )
            .entry(code)
            .version(Some(previous.version.clone())),
        );
        Ok(UpdateResult {
            success: true,
            entry_code: code.to_string(),
            action,
            new_version: Some(previous.version),
            restart_required: execution.restart_required,
            error: None,
        })
    }

    /// Clear elapsed update approvals. Returns the affected codes.
    pub fn sweep_expired_approvals(&self, actor: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut cleared = Vec::new();
        for entry in self.catalog().query(CatalogQuery::ExpiredApproval, now)? {
            // Entries with a run in flight are picked up by the next sweep.
            let Ok(_guard) = self.pipeline.lock(&entry.code) else {
                continue;
            };
            let Some(mut fresh) = self.catalog().get(&entry.code)? else {
                continue;
            };
            if state::clear_expired_approval(&mut fresh, now) {
                self.catalog().save(&fresh)?;
                self.audit().log(
                    AuditRecord::new(
                        AuditAction::ApprovalExpired,
                        actor,
                        "update approval expired and was cleared",
                    )
                    .entry(&fresh.code)
                    .version(fresh.pending.as_ref().map(|p| p.version.clone())),
                );
                cleared.push(fresh.code);
            }
        }
        Ok(cleared)
    }

    /// Entries the auto-update dispatcher would run right now.
    pub fn auto_update_candidates(&self, now: DateTime<Utc>) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .catalog()
            .query(CatalogQuery::UpdatePending, now)?
            .into_iter()
            .filter(|entry| state::eligible_for_auto_update(entry, now, self.settings.failure_ceiling))
            .collect())
    }

    /// Install every eligible Auto update, at most `parallelism` at a time.
    pub fn dispatch_auto_updates(&self, ctx: &RunContext, now: DateTime<Utc>) -> Result<Vec<UpdateResult>> {
        let codes: Vec<String> = self
            .auto_update_candidates(now)?
            .into_iter()
            .map(|entry| entry.code)
            .collect();
        if codes.is_empty() {
            return Ok(Vec::new());
        }

        let next = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(codes.len()));
        let workers = self.settings.parallelism.clamp(1, codes.len());
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(code) = codes.get(index) else {
                            break;
                        };
                        if ctx.cancel.is_cancelled() {
                            break;
                        }
                        let result = self.install_update(code, ctx, now);
                        results.lock().push(result);
                    }
                });
            }
        });
        Ok(results.into_inner())
    }

    fn audit_failure(&self, action: AuditAction, ctx: &RunContext, code: &str, err: &DeployError) {
        self.audit()
            .log(AuditRecord::failure(action, &ctx.actor, err).entry(code));
    }
}
