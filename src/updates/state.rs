//! Update and rollback state transitions on a `CatalogEntry`.
//!
//! Everything here is a pure function of the entry and an explicit `now`;
//! callers persist the entry in one whole-entry write afterwards.

#![allow(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::catalog::entry::{Approval, CatalogEntry, PendingUpdate, UpdatePolicy, VersionSnapshot};
use crate::core::errors::{DeployError, Result};

/// Actor recorded on approvals granted by the Auto policy.
pub const AUTO_APPROVER: &str = "system:auto-update";

/// A release advertised by an update feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedRelease {
    pub version: String,
    pub download_url: Option<String>,
    pub checksum: Option<String>,
}

/// Where an entry sits in the update lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    NoUpdate,
    PendingApproval,
    /// Approval was granted but has elapsed; behaves like `PendingApproval`.
    Expired,
    Approved,
    AutoApproved,
}

#[must_use]
pub fn update_state(entry: &CatalogEntry, now: DateTime<Utc>) -> UpdateState {
    if entry.pending.is_none() {
        return UpdateState::NoUpdate;
    }
    match &entry.update_approval {
        Some(approval) if approval.is_expired(now) => UpdateState::Expired,
        Some(approval) if approval.approved_by == AUTO_APPROVER => UpdateState::AutoApproved,
        Some(_) => UpdateState::Approved,
        None => UpdateState::PendingApproval,
    }
}

fn same_version(a: &str, b: &str) -> bool {
    let strip = |v: &str| v.trim().trim_start_matches(['v', 'V']).to_string();
    strip(a) == strip(b)
}

/// What a completed check did to the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The entry has no update-check URL.
    NotConfigured,
    NoUpdate,
    UpdateFound { version: String, auto_approved: bool },
    /// The advertised version is already the pending one.
    AlreadyPending { version: String },
}

/// Fold a feed result into the entry. Always stamps `last_update_check`.
pub fn record_check(entry: &mut CatalogEntry, release: FeedRelease, now: DateTime<Utc>) -> CheckOutcome {
    entry.last_update_check = Some(now);
    entry.updated_at = now;

    if entry
        .current_version
        .as_deref()
        .is_some_and(|current| same_version(current, &release.version))
    {
        entry.pending = None;
        entry.update_approval = None;
        return CheckOutcome::NoUpdate;
    }
    if let Some(pending) = &entry.pending
        && same_version(&pending.version, &release.version)
    {
        return CheckOutcome::AlreadyPending {
            version: pending.version.clone(),
        };
    }

    // A new version supersedes any earlier pending one and its approval.
    entry.pending = Some(PendingUpdate {
        version: release.version.clone(),
        download_url: release.download_url,
        checksum: release.checksum,
        detected_at: now,
    });
    entry.update_approval = None;
    let auto_approved = entry.update_policy == UpdatePolicy::Auto;
    if auto_approved {
        entry.update_approval = Some(Approval::new(AUTO_APPROVER, now));
    }
    CheckOutcome::UpdateFound {
        version: release.version,
        auto_approved,
    }
}

/// Approve the pending update. The window (hours, 0 = never) sets the expiry.
pub fn approve(entry: &mut CatalogEntry, approved_by: &str, now: DateTime<Utc>) -> Result<()> {
    if entry.pending.is_none() {
        return Err(DeployError::InvalidState {
            code: entry.code.clone(),
            details: "no pending update to approve".to_string(),
        });
    }
    let mut approval = Approval::new(approved_by, now);
    if entry.approval_window_hours > 0 {
        approval.expires_at = Some(now + Duration::hours(i64::from(entry.approval_window_hours)));
    }
    entry.update_approval = Some(approval);
    entry.updated_at = now;
    Ok(())
}

/// Whether the pending update may be installed right now.
#[must_use]
pub fn is_ready_to_install(entry: &CatalogEntry, now: DateTime<Utc>) -> bool {
    if entry.pending.is_none() || entry.update_approval_expired(now) {
        return false;
    }
    match entry.update_policy {
        UpdatePolicy::Auto => true,
        UpdatePolicy::AdminApproved | UpdatePolicy::Manual => entry.has_live_update_approval(now),
        UpdatePolicy::Disabled => false,
    }
}

/// Promote the pending update to current, keeping the old current as the rollback snapshot.
pub fn complete_update(entry: &mut CatalogEntry, now: DateTime<Utc>) -> Result<()> {
    let pending = entry.pending.take().ok_or_else(|| DeployError::InvalidState {
        code: entry.code.clone(),
        details: "no pending update to complete".to_string(),
    })?;
    entry.previous = entry.current_snapshot();
    entry.current_version = Some(pending.version);
    if let Some(url) = pending.download_url {
        entry.download_url = url;
    }
    entry.checksum = pending.checksum;
    entry.update_approval = None;
    entry.failure_count = 0;
    entry.last_error = None;
    entry.installed_at = Some(now);
    entry.updated_at = now;
    Ok(())
}

/// Swap current and previous release fields. Applying it twice is the identity.
pub fn rollback_swap(entry: &mut CatalogEntry, now: DateTime<Utc>) -> Result<()> {
    let Some(previous) = entry.previous.take() else {
        return Err(DeployError::RollbackUnavailable {
            code: entry.code.clone(),
        });
    };
    let Some(current) = entry.current_snapshot() else {
        entry.previous = Some(previous);
        return Err(DeployError::InvalidState {
            code: entry.code.clone(),
            details: "entry has no current version to roll back from".to_string(),
        });
    };
    let VersionSnapshot {
        version,
        download_url,
        checksum,
    } = previous;
    entry.current_version = Some(version);
    entry.download_url = download_url;
    entry.checksum = checksum;
    entry.previous = Some(current);
    entry.updated_at = now;
    Ok(())
}

/// Count a failed update attempt. The pending update is kept.
pub fn mark_failed(entry: &mut CatalogEntry, error: &str, now: DateTime<Utc>) {
    entry.failure_count = entry.failure_count.saturating_add(1);
    entry.last_error = Some(error.to_string());
    entry.updated_at = now;
}

/// Close the auto-update breaker. Only an administrator action calls this.
pub fn reset_failures(entry: &mut CatalogEntry, now: DateTime<Utc>) -> bool {
    if entry.failure_count == 0 && entry.last_error.is_none() {
        return false;
    }
    entry.failure_count = 0;
    entry.last_error = None;
    entry.updated_at = now;
    true
}

/// Open the auto-update breaker immediately (security failures).
pub fn trip_breaker(entry: &mut CatalogEntry, ceiling: u32) {
    entry.failure_count = entry.failure_count.max(ceiling);
}

/// Clear an elapsed update approval. Returns whether anything changed.
pub fn clear_expired_approval(entry: &mut CatalogEntry, now: DateTime<Utc>) -> bool {
    if entry.update_approval_expired(now) {
        entry.update_approval = None;
        entry.updated_at = now;
        true
    } else {
        false
    }
}

/// Auto policy, catalog-approved, installed, ready, and below the failure ceiling.
#[must_use]
pub fn eligible_for_auto_update(entry: &CatalogEntry, now: DateTime<Utc>, ceiling: u32) -> bool {
    entry.update_policy == UpdatePolicy::Auto
        && entry.is_approved()
        && entry.is_installed()
        && entry.update_available()
        && is_ready_to_install(entry, now)
        && entry.failure_count < ceiling
}
