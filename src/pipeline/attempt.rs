//! One pipeline invocation: action, stage, status and timing.

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::errors::DeployError;

/// What the run is doing to the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Install,
    Uninstall,
    Update,
    Rollback,
}

impl ActionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Update => "update",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stages in execution order. `Failed` is reachable from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    SourceValidated,
    Downloading,
    ChecksumVerified,
    SignatureVerified,
    ScanCompleted,
    Executing,
    Committed,
    Failed,
}

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::SourceValidated => "source_validated",
            Self::Downloading => "downloading",
            Self::ChecksumVerified => "checksum_verified",
            Self::SignatureVerified => "signature_verified",
            Self::ScanCompleted => "scan_completed",
            Self::Executing => "executing",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Ephemeral record of one run. Never persisted; mirrored into audit records.
#[derive(Debug, Clone, Serialize)]
pub struct InstallationAttempt {
    pub entry_code: String,
    pub action: ActionKind,
    pub stage: Stage,
    pub status: AttemptStatus,
    pub progress: f64,
    pub error_message: Option<String>,
    /// Stage at which the run failed, when it did.
    pub failed_at: Option<Stage>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl InstallationAttempt {
    #[must_use]
    pub fn start(entry_code: impl Into<String>, action: ActionKind, now: DateTime<Utc>) -> Self {
        Self {
            entry_code: entry_code.into(),
            action,
            stage: Stage::Queued,
            status: AttemptStatus::Running,
            progress: 0.0,
            error_message: None,
            failed_at: None,
            started_at: now,
            finished_at: None,
        }
    }

    /// Move forward to `stage`. Backward or post-terminal moves are ignored.
    pub fn advance(&mut self, stage: Stage) {
        if !self.stage.is_terminal() && stage > self.stage && stage != Stage::Failed {
            self.stage = stage;
        }
    }

    pub fn set_progress(&mut self, fraction: f64) {
        self.progress = self.progress.max(fraction.clamp(0.0, 1.0));
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) {
        self.advance(Stage::Committed);
        self.status = AttemptStatus::Succeeded;
        self.progress = 1.0;
        self.finished_at = Some(now);
    }

    pub fn fail(&mut self, error: &DeployError, now: DateTime<Utc>) {
        self.failed_at = Some(self.stage);
        self.stage = Stage::Failed;
        self.status = if matches!(error, DeployError::Cancelled { .. }) {
            AttemptStatus::Cancelled
        } else {
            AttemptStatus::Failed
        };
        self.error_message = Some(error.to_string());
        self.finished_at = Some(now);
    }

    /// Wall-clock milliseconds from start to finish, if finished.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        let finished = self.finished_at?;
        u64::try_from((finished - self.started_at).num_milliseconds()).ok()
    }
}
