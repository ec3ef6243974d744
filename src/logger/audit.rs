//! Audit record model and the `AuditSink` seam.
//!
//! Every security-relevant decision the pipeline makes becomes one
//! `AuditRecord`. Sinks are fire-and-forget: logging never fails a run.

#![allow(missing_docs)]

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{DeployError, Gate, Severity};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Install,
    Uninstall,
    Update,
    Rollback,
    UpdateCheck,
    UpdateApproved,
    ApprovalExpired,
    SecurityGateFailed,
    SignatureInformational,
    ScanUnavailable,
    EntryApproved,
    CatalogChanged,
    PolicyChanged,
    DaemonStart,
    DaemonStop,
    EventsDropped,
}

impl AuditAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Update => "update",
            Self::Rollback => "rollback",
            Self::UpdateCheck => "update_check",
            Self::UpdateApproved => "update_approved",
            Self::ApprovalExpired => "approval_expired",
            Self::SecurityGateFailed => "security_gate_failed",
            Self::SignatureInformational => "signature_informational",
            Self::ScanUnavailable => "scan_unavailable",
            Self::EntryApproved => "entry_approved",
            Self::CatalogChanged => "catalog_changed",
            Self::PolicyChanged => "policy_changed",
            Self::DaemonStart => "daemon_start",
            Self::DaemonStop => "daemon_stop",
            Self::EventsDropped => "events_dropped",
        }
    }
}

/// One audit line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// ISO 8601 UTC timestamp.
    pub ts: String,
    pub action: AuditAction,
    pub actor: String,
    pub success: bool,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entry_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gate: Option<Gate>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration_ms: Option<u64>,
    pub details: String,
}

impl AuditRecord {
    /// Successful action at Info severity, stamped now.
    pub fn new(action: AuditAction, actor: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            ts: format_utc_now(),
            action,
            actor: actor.into(),
            success: true,
            severity: Severity::Info,
            entry_code: None,
            version: None,
            gate: None,
            error_code: None,
            duration_ms: None,
            details: details.into(),
        }
    }

    /// Failed action classified by the error: severity, gate and code come from it.
    pub fn failure(action: AuditAction, actor: impl Into<String>, error: &DeployError) -> Self {
        Self {
            success: false,
            severity: error.severity(),
            gate: error.gate(),
            error_code: Some(error.code().to_string()),
            ..Self::new(action, actor, error.to_string())
        }
    }

    #[must_use]
    pub fn entry(mut self, code: impl Into<String>) -> Self {
        self.entry_code = Some(code.into());
        self
    }

    #[must_use]
    pub fn version(mut self, version: Option<impl Into<String>>) -> Self {
        self.version = version.map(Into::into);
        self
    }

    #[must_use]
    pub const fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub const fn duration_ms(mut self, millis: u64) -> Self {
        self.duration_ms = Some(millis);
        self
    }
}

/// Destination for audit records. Implementations must not block the caller for long.
pub trait AuditSink: Send + Sync {
    fn log(&self, record: AuditRecord);
}

/// Collects records in memory; used by tests and embedders that forward them elsewhere.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn count(&self, action: AuditAction) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|record| record.action == action)
            .count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn log(&self, _record: AuditRecord) {}
}

/// Format current UTC time as ISO 8601.
pub(crate) fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
