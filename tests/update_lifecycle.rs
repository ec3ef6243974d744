//! Update check, approval, install, rollback and scheduler ticks end to end.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use crossbeam_channel::{Receiver, Sender, bounded};
use serde_json::json;

use fleet_deploy::catalog::entry::{CatalogEntry, UpdatePolicy};
use fleet_deploy::catalog::store::CatalogRepository;
use fleet_deploy::core::errors::{DeployError, Gate, Result};
use fleet_deploy::logger::audit::AuditAction;
use fleet_deploy::pipeline::cancel::CancellationToken;
use fleet_deploy::pipeline::runner::RunContext;
use fleet_deploy::updates::checker::UpdateFeed;
use fleet_deploy::updates::state::{AUTO_APPROVER, CheckOutcome, UpdateState, update_state};

use common::{Harness, artifact_url};

const FEED_URL: &str = "https://updates.example.com/app/latest.json";

fn ctx() -> RunContext {
    RunContext::new("admin")
}

/// Install `app` 1.0.0 with the given update policy and a configured feed URL.
fn installed_app(h: &Harness, policy: UpdatePolicy) -> CatalogEntry {
    let mut entry = h.add_script_entry("app", "1.0.0", "exit 0\n");
    entry.update_policy = policy;
    entry.update_check_url = Some(FEED_URL.to_string());
    h.catalog.save(&entry).unwrap();
    let result = h.services.pipeline.install("app", &ctx());
    assert!(result.success, "{:?}", result.error_message());
    h.entry("app")
}

/// Serve the installer for `version` and advertise it on the feed.
fn release(h: &Harness, version: &str) -> (String, String) {
    let (url, digest) = h.publish_script("app", version, &format!("# app {version}\nexit 0\n"));
    h.feed.publish(
        FEED_URL,
        &json!({ "version": version, "download_url": url, "sha256": digest }).to_string(),
    );
    (url, digest)
}

#[test]
fn check_approve_update_and_rollback_twice() {
    let h = Harness::new();
    let original = installed_app(&h, UpdatePolicy::AdminApproved);
    let (new_url, new_digest) = release(&h, "2.0.0");
    let now = Utc::now();

    let check = h.services.updates.check_for_update("app", &ctx(), now).unwrap();
    assert!(check.update_found);
    assert_eq!(check.new_version.as_deref(), Some("2.0.0"));
    assert_eq!(update_state(&h.entry("app"), now), UpdateState::PendingApproval);

    let premature = h.services.updates.install_update("app", &ctx(), now);
    assert!(matches!(premature.error, Some(DeployError::NotApproved { .. })));

    h.services.updates.approve_update("app", "alice", now).unwrap();
    assert_eq!(update_state(&h.entry("app"), now), UpdateState::Approved);

    let updated = h.services.updates.install_update("app", &ctx(), now);
    assert!(updated.success, "{:?}", updated.error_message());
    assert_eq!(updated.new_version.as_deref(), Some("2.0.0"));
    let after_update = h.entry("app");
    assert_eq!(after_update.current_version.as_deref(), Some("2.0.0"));
    assert_eq!(after_update.download_url, new_url);
    assert_eq!(after_update.checksum.as_deref(), Some(new_digest.as_str()));
    assert!(after_update.pending.is_none());
    assert!(after_update.update_approval.is_none());
    let previous = after_update.previous.clone().unwrap();
    assert_eq!(previous.version, "1.0.0");
    assert_eq!(previous.download_url, original.download_url);

    let back = h.services.updates.rollback("app", &ctx());
    assert!(back.success, "{:?}", back.error_message());
    let rolled = h.entry("app");
    assert_eq!(rolled.current_version.as_deref(), Some("1.0.0"));
    assert_eq!(rolled.checksum, original.checksum);
    assert_eq!(rolled.previous.as_ref().map(|p| p.version.as_str()), Some("2.0.0"));

    let forward = h.services.updates.rollback("app", &ctx());
    assert!(forward.success);
    let again = h.entry("app");
    assert_eq!(again.current_version, after_update.current_version);
    assert_eq!(again.download_url, after_update.download_url);
    assert_eq!(again.previous, after_update.previous);

    assert_eq!(h.records(AuditAction::UpdateApproved)[0].actor, "alice");
    assert_eq!(h.records(AuditAction::Rollback).len(), 2);
}

#[test]
fn rollback_without_previous_release_is_unavailable() {
    let h = Harness::new();
    installed_app(&h, UpdatePolicy::AdminApproved);

    let result = h.services.updates.rollback("app", &ctx());

    assert!(matches!(result.error, Some(DeployError::RollbackUnavailable { .. })));
}

#[test]
fn failed_rollback_leaves_current_release_in_place() {
    let h = Harness::new();
    installed_app(&h, UpdatePolicy::AdminApproved);
    release(&h, "2.0.0");
    let now = Utc::now();
    h.services.updates.check_for_update("app", &ctx(), now).unwrap();
    h.services.updates.approve_update("app", "alice", now).unwrap();
    assert!(h.services.updates.install_update("app", &ctx(), now).success);
    let before = h.entry("app");
    h.fetcher.withdraw(&artifact_url("app", "1.0.0"));

    let result = h.services.updates.rollback("app", &ctx());

    assert!(matches!(result.error, Some(DeployError::Network { .. })));
    let after = h.entry("app");
    assert_eq!(after.current_version, before.current_version);
    assert_eq!(after.previous, before.previous);
    let failures: Vec<_> = h
        .records(AuditAction::Rollback)
        .into_iter()
        .filter(|r| !r.success)
        .collect();
    assert_eq!(failures.len(), 1);
}

#[test]
fn newer_release_supersedes_pending_approval() {
    let h = Harness::new();
    installed_app(&h, UpdatePolicy::AdminApproved);
    let now = Utc::now();
    release(&h, "2.0.0");
    h.services.updates.check_for_update("app", &ctx(), now).unwrap();
    h.services.updates.approve_update("app", "alice", now).unwrap();

    release(&h, "2.1.0");
    let check = h.services.updates.check_for_update("app", &ctx(), now).unwrap();

    assert_eq!(check.new_version.as_deref(), Some("2.1.0"));
    let entry = h.entry("app");
    assert_eq!(entry.pending.as_ref().map(|p| p.version.as_str()), Some("2.1.0"));
    assert!(entry.update_approval.is_none());

    let same = h.services.updates.check_for_update("app", &ctx(), now).unwrap();
    assert_eq!(
        same.outcome,
        CheckOutcome::AlreadyPending {
            version: "2.1.0".to_string()
        }
    );
}

#[test]
fn check_failure_stamps_the_entry() {
    let h = Harness::new();
    installed_app(&h, UpdatePolicy::AdminApproved);
    let now = Utc::now();

    let err = h
        .services
        .updates
        .check_for_update("app", &ctx(), now)
        .unwrap_err();

    assert!(matches!(err, DeployError::Network { .. }));
    let entry = h.entry("app");
    assert_eq!(entry.last_update_check, Some(now));
    assert!(entry.last_error.is_some());
    assert!(entry.pending.is_none());
    let checks = h.records(AuditAction::UpdateCheck);
    assert_eq!(checks.len(), 1);
    assert!(!checks[0].success);
}

#[test]
fn feed_with_a_non_sha256_checksum_is_rejected() {
    let h = Harness::new();
    installed_app(&h, UpdatePolicy::Auto);
    let (url, _) = h.publish_script("app", "2.0.0", "exit 0\n");
    h.feed.publish(
        FEED_URL,
        &json!({ "version": "2.0.0", "download_url": url, "checksum": "md5:9e107d9d372bb6826bd81d3542a419d6" })
            .to_string(),
    );
    let now = Utc::now();

    let err = h
        .services
        .updates
        .check_for_update("app", &ctx(), now)
        .unwrap_err();

    assert!(matches!(err, DeployError::Serialization { .. }));
    let entry = h.entry("app");
    assert!(entry.pending.is_none(), "no unverifiable update is queued");
    assert_eq!(entry.last_update_check, Some(now));
    assert!(h.services.updates.auto_update_candidates(now).unwrap().is_empty());
}

#[test]
fn unconfigured_check_leaves_the_entry_alone() {
    let h = Harness::new();
    let mut entry = installed_app(&h, UpdatePolicy::AdminApproved);
    entry.update_check_url = None;
    h.catalog.save(&entry).unwrap();

    let result = h
        .services
        .updates
        .check_for_update("app", &ctx(), Utc::now())
        .unwrap();

    assert_eq!(result.outcome, CheckOutcome::NotConfigured);
    assert!(h.entry("app").last_update_check.is_none());
    assert_eq!(h.feed.calls(), 0);
}

#[test]
fn expired_approval_blocks_install_and_is_swept() {
    let h = Harness::new();
    let mut entry = installed_app(&h, UpdatePolicy::AdminApproved);
    entry.approval_window_hours = 1;
    h.catalog.save(&entry).unwrap();
    release(&h, "2.0.0");
    let now = Utc::now();

    h.services
        .updates
        .check_for_update("app", &ctx(), now - Duration::hours(3))
        .unwrap();
    h.services
        .updates
        .approve_update("app", "alice", now - Duration::hours(2))
        .unwrap();
    assert_eq!(update_state(&h.entry("app"), now), UpdateState::Expired);

    let blocked = h.services.updates.install_update("app", &ctx(), now);
    assert!(matches!(blocked.error, Some(DeployError::NotApproved { .. })));

    let cleared = h.services.updates.sweep_expired_approvals("system:test", now).unwrap();
    assert_eq!(cleared, vec!["app".to_string()]);
    let swept = h.entry("app");
    assert!(swept.update_approval.is_none());
    assert!(swept.pending.is_some(), "the pending release survives expiry");
    assert_eq!(h.records(AuditAction::ApprovalExpired).len(), 1);

    let second = h.services.updates.sweep_expired_approvals("system:test", now).unwrap();
    assert!(second.is_empty());
}

#[test]
fn auto_policy_entry_is_updated_by_a_tick() {
    let h = Harness::new();
    installed_app(&h, UpdatePolicy::Auto);
    release(&h, "2.0.0");
    let scheduler = h.services.scheduler();
    let now = Utc::now() + Duration::seconds(1);

    let report = scheduler.tick(now).unwrap().unwrap();

    assert_eq!(report.checked, vec!["app".to_string()]);
    assert_eq!(report.updates_found, vec!["app".to_string()]);
    assert_eq!(report.dispatched.len(), 1);
    assert!(report.dispatched[0].success, "{:?}", report.dispatched[0].error_message());
    let entry = h.entry("app");
    assert_eq!(entry.current_version.as_deref(), Some("2.0.0"));
    assert_eq!(h.records(AuditAction::Update)[0].actor, "system:scheduler");

    // Not due again until the check interval elapses.
    let quiet = scheduler.tick(now + Duration::minutes(5)).unwrap().unwrap();
    assert!(quiet.checked.is_empty());
    assert!(quiet.dispatched.is_empty());
}

#[test]
fn auto_approval_is_recorded_on_check() {
    let h = Harness::new();
    installed_app(&h, UpdatePolicy::Auto);
    release(&h, "2.0.0");
    let now = Utc::now();

    let result = h.services.updates.check_for_update("app", &ctx(), now).unwrap();

    assert!(result.message.contains("auto-approved"));
    let entry = h.entry("app");
    assert_eq!(
        entry.update_approval.as_ref().map(|a| a.approved_by.as_str()),
        Some(AUTO_APPROVER)
    );
    assert_eq!(h.services.updates.auto_update_candidates(now).unwrap().len(), 1);
}

#[test]
fn security_failure_opens_the_breaker() {
    let h = Harness::new();
    installed_app(&h, UpdatePolicy::Auto);
    let (url, _) = release(&h, "2.0.0");
    h.fetcher.serve(&url, b"exit 0 # swapped on the mirror\n");
    let scheduler = h.services.scheduler();
    let now = Utc::now() + Duration::seconds(1);

    let report = scheduler.tick(now).unwrap().unwrap();

    assert_eq!(report.dispatched.len(), 1);
    assert!(matches!(
        report.dispatched[0].error,
        Some(DeployError::ChecksumMismatch { .. })
    ));
    let entry = h.entry("app");
    assert_eq!(entry.current_version.as_deref(), Some("1.0.0"));
    assert!(entry.pending.is_some());
    assert!(entry.failure_count >= h.services.updates.settings().failure_ceiling);
    assert!(h.services.updates.auto_update_candidates(now).unwrap().is_empty());

    let gate_failures = h.records(AuditAction::SecurityGateFailed);
    assert_eq!(gate_failures.len(), 1);
    assert_eq!(gate_failures[0].gate, Some(Gate::Checksum));
    assert!(h.records(AuditAction::Update).is_empty());
}

#[test]
fn newer_release_keeps_the_breaker_open_until_reset() {
    let h = Harness::new();
    installed_app(&h, UpdatePolicy::Auto);
    let (url, _) = release(&h, "2.0.0");
    h.fetcher.serve(&url, b"exit 0 # swapped on the mirror\n");
    let now = Utc::now() + Duration::seconds(1);
    h.services.scheduler().tick(now).unwrap().unwrap();
    let ceiling = h.services.updates.settings().failure_ceiling;

    release(&h, "2.0.1");
    let later = now + Duration::seconds(5);
    let check = h.services.updates.check_for_update("app", &ctx(), later).unwrap();

    assert!(check.update_found);
    let entry = h.entry("app");
    assert_eq!(entry.pending.as_ref().map(|p| p.version.as_str()), Some("2.0.1"));
    assert!(entry.failure_count >= ceiling);
    assert!(h.services.updates.auto_update_candidates(later).unwrap().is_empty());

    h.services.admin().reset_failures("app", "alice", later).unwrap();
    let dispatched = h.services.updates.dispatch_auto_updates(&ctx(), later).unwrap();
    assert_eq!(dispatched.len(), 1);
    assert!(dispatched[0].success, "{:?}", dispatched[0].error_message());
    assert_eq!(h.entry("app").current_version.as_deref(), Some("2.0.1"));
    assert!(
        h.records(AuditAction::CatalogChanged)
            .iter()
            .any(|r| r.actor == "alice" && r.details.contains("failures cleared"))
    );
}

#[test]
fn revoked_catalog_approval_stops_updates_and_rollbacks() {
    let h = Harness::new();
    installed_app(&h, UpdatePolicy::Auto);
    let mut entry = h.entry("app");
    entry.approval = None;
    h.catalog.save(&entry).unwrap();
    release(&h, "2.0.0");
    let fetches = h.fetcher.calls();
    let now = Utc::now() + Duration::seconds(1);

    let report = h.services.scheduler().tick(now).unwrap().unwrap();

    assert_eq!(report.updates_found, vec!["app".to_string()]);
    assert!(report.dispatched.is_empty());
    assert!(h.services.updates.auto_update_candidates(now).unwrap().is_empty());

    let direct = h.services.updates.install_update("app", &ctx(), now);
    assert!(matches!(direct.error, Some(DeployError::NotApproved { .. })));
    let rollback = h.services.updates.rollback("app", &ctx());
    assert!(matches!(rollback.error, Some(DeployError::NotApproved { .. })));

    assert_eq!(h.fetcher.calls(), fetches, "nothing downloaded for an unapproved entry");
    let after = h.entry("app");
    assert_eq!(after.current_version.as_deref(), Some("1.0.0"));
    assert_eq!(after.failure_count, 0);
}

#[test]
fn disabled_entries_are_never_checked() {
    let h = Harness::new();
    installed_app(&h, UpdatePolicy::Disabled);
    release(&h, "2.0.0");

    let report = h
        .services
        .scheduler()
        .tick(Utc::now() + Duration::seconds(1))
        .unwrap()
        .unwrap();

    assert!(report.checked.is_empty());
    assert_eq!(h.feed.calls(), 0);
}

/// Feed that blocks inside `fetch` until released.
struct GatedFeed {
    entered: Sender<()>,
    release: Receiver<()>,
}

impl UpdateFeed for GatedFeed {
    fn fetch(&self, _url: &str, _cancel: &CancellationToken) -> Result<String> {
        let _ = self.entered.send(());
        let _ = self.release.recv_timeout(StdDuration::from_secs(10));
        Ok("1.0.0".to_string())
    }
}

#[test]
fn overlapping_ticks_are_skipped() {
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let h = Harness::with_feed(Arc::new(GatedFeed {
        entered: entered_tx,
        release: release_rx,
    }));
    installed_app(&h, UpdatePolicy::AdminApproved);
    let scheduler = h.services.scheduler();
    let now = Utc::now() + Duration::seconds(1);

    let first = {
        let scheduler = Arc::clone(&scheduler);
        thread::spawn(move || scheduler.tick(now))
    };
    entered_rx
        .recv_timeout(StdDuration::from_secs(10))
        .expect("first tick reached the feed");

    assert!(scheduler.is_ticking());
    assert!(scheduler.tick(now).unwrap().is_none());

    release_tx.send(()).unwrap();
    let report = first.join().unwrap().unwrap().unwrap();
    assert_eq!(report.checked, vec!["app".to_string()]);
    assert!(report.updates_found.is_empty());
    assert!(!scheduler.is_ticking());
}
