//! Administrative catalog and policy edits, each audited.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};

use crate::catalog::entry::{Approval, CatalogEntry};
use crate::catalog::locks::EntryLocks;
use crate::catalog::store::{CatalogRepository, PolicyRepository};
use crate::core::errors::{DeployError, Result};
use crate::logger::audit::{AuditAction, AuditRecord, AuditSink};
use crate::policy::source::SourcePolicy;
use crate::updates::state;

pub struct CatalogAdmin<'a> {
    pub catalog: &'a dyn CatalogRepository,
    pub policies: &'a dyn PolicyRepository,
    pub audit: &'a dyn AuditSink,
    /// Edits to an entry with a run in flight are refused with `EntryBusy`.
    pub locks: &'a EntryLocks,
}

impl CatalogAdmin<'_> {
    pub fn add_entry(&self, entry: &CatalogEntry, actor: &str) -> Result<()> {
        self.catalog.insert(entry)?;
        self.audit.log(
            AuditRecord::new(
                AuditAction::CatalogChanged,
                actor,
                format!("added {} ({}, {})", entry.name, entry.kind, entry.download_url),
            )
            .entry(&entry.code)
            .version(entry.current_version.as_deref()),
        );
        Ok(())
    }

    /// Mark `code` approved for installation.
    pub fn approve_entry(&self, code: &str, approved_by: &str, now: DateTime<Utc>) -> Result<CatalogEntry> {
        let _guard = self.locks.try_acquire(code)?;
        let mut entry = self.catalog.require(code)?;
        entry.approval = Some(Approval::new(approved_by, now));
        entry.updated_at = now;
        self.catalog.save(&entry)?;
        self.audit.log(
            AuditRecord::new(AuditAction::EntryApproved, approved_by, "approved for installation")
                .entry(code),
        );
        Ok(entry)
    }

    /// Withdraw installation approval. Installed software stays installed.
    pub fn revoke_entry(&self, code: &str, actor: &str, now: DateTime<Utc>) -> Result<CatalogEntry> {
        let _guard = self.locks.try_acquire(code)?;
        let mut entry = self.catalog.require(code)?;
        if entry.approval.take().is_none() {
            return Err(DeployError::InvalidState {
                code: code.to_string(),
                details: "entry is not approved".to_string(),
            });
        }
        entry.updated_at = now;
        self.catalog.save(&entry)?;
        self.audit.log(
            AuditRecord::new(AuditAction::CatalogChanged, actor, "installation approval revoked")
                .entry(code),
        );
        Ok(entry)
    }

    /// Clear the update failure counter so auto-updates resume for `code`.
    pub fn reset_failures(&self, code: &str, actor: &str, now: DateTime<Utc>) -> Result<CatalogEntry> {
        let _guard = self.locks.try_acquire(code)?;
        let mut entry = self.catalog.require(code)?;
        let count = entry.failure_count;
        if !state::reset_failures(&mut entry, now) {
            return Err(DeployError::InvalidState {
                code: code.to_string(),
                details: "no update failures recorded".to_string(),
            });
        }
        self.catalog.save(&entry)?;
        self.audit.log(
            AuditRecord::new(
                AuditAction::CatalogChanged,
                actor,
                format!("update failures cleared (count was {count})"),
            )
            .entry(code),
        );
        Ok(entry)
    }

    pub fn remove_entry(&self, code: &str, actor: &str) -> Result<()> {
        let _guard = self.locks.try_acquire(code)?;
        self.catalog.delete(code)?;
        self.audit
            .log(AuditRecord::new(AuditAction::CatalogChanged, actor, "removed from catalog").entry(code));
        Ok(())
    }

    /// Insert a policy and return its assigned id.
    pub fn add_policy(&self, policy: &SourcePolicy, actor: &str) -> Result<u64> {
        let id = self.policies.insert(policy)?;
        let stored = SourcePolicy {
            id,
            ..policy.clone()
        };
        self.audit.log(AuditRecord::new(
            AuditAction::PolicyChanged,
            actor,
            format!("added source policy {}", stored.label()),
        ));
        Ok(id)
    }

    pub fn remove_policy(&self, id: u64, actor: &str) -> Result<()> {
        self.policies.delete(id)?;
        self.audit.log(AuditRecord::new(
            AuditAction::PolicyChanged,
            actor,
            format!("removed source policy #{id}"),
        ));
        Ok(())
    }

    /// Enable or disable a policy without deleting it.
    pub fn set_policy_active(&self, id: u64, active: bool, actor: &str) -> Result<SourcePolicy> {
        let mut policy = self
            .policies
            .list()?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| DeployError::EntryNotFound {
                code: format!("policy #{id}"),
            })?;
        policy.active = active;
        self.policies.update(&policy)?;
        self.audit.log(AuditRecord::new(
            AuditAction::PolicyChanged,
            actor,
            format!(
                "{} source policy {}",
                if active { "enabled" } else { "disabled" },
                policy.label()
            ),
        ));
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::entry::InstallerKind;
    use crate::catalog::store::{MemoryCatalog, MemoryPolicies};
    use crate::logger::audit::MemoryAuditSink;
    use crate::policy::source::Direction;

    struct Fixture {
        catalog: MemoryCatalog,
        policies: MemoryPolicies,
        audit: MemoryAuditSink,
        locks: EntryLocks,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                catalog: MemoryCatalog::new(),
                policies: MemoryPolicies::new(),
                audit: MemoryAuditSink::default(),
                locks: EntryLocks::new(),
            }
        }

        fn admin(&self) -> CatalogAdmin<'_> {
            CatalogAdmin {
                catalog: &self.catalog,
                policies: &self.policies,
                audit: &self.audit,
                locks: &self.locks,
            }
        }
    }

    fn entry(code: &str) -> CatalogEntry {
        CatalogEntry::new(code, "Editor", InstallerKind::Msi, "https://dl.example.com/e.msi", Utc::now())
    }

    #[test]
    fn approve_then_revoke() {
        let fx = Fixture::new();
        fx.admin().add_entry(&entry("editor"), "admin").unwrap();
        let approved = fx.admin().approve_entry("editor", "alice", Utc::now()).unwrap();
        assert!(approved.is_approved());
        assert_eq!(approved.approval.unwrap().approved_by, "alice");

        let revoked = fx.admin().revoke_entry("editor", "alice", Utc::now()).unwrap();
        assert!(!revoked.is_approved());
        assert!(matches!(
            fx.admin().revoke_entry("editor", "alice", Utc::now()),
            Err(DeployError::InvalidState { .. })
        ));

        let actions: Vec<_> = fx.audit.records().iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::CatalogChanged,
                AuditAction::EntryApproved,
                AuditAction::CatalogChanged
            ]
        );
    }

    #[test]
    fn edits_are_refused_while_a_run_is_in_flight() {
        let fx = Fixture::new();
        fx.admin().add_entry(&entry("editor"), "admin").unwrap();
        let _run = fx.locks.try_acquire("editor").unwrap();
        assert!(matches!(
            fx.admin().approve_entry("editor", "alice", Utc::now()),
            Err(DeployError::EntryBusy { .. })
        ));
        assert!(matches!(
            fx.admin().remove_entry("editor", "alice"),
            Err(DeployError::EntryBusy { .. })
        ));
    }

    #[test]
    fn reset_failures_is_audited_and_needs_failures() {
        let fx = Fixture::new();
        let mut failing = entry("editor");
        failing.failure_count = 3;
        failing.last_error = Some("[FDP-2106] malware detected".to_string());
        fx.admin().add_entry(&failing, "admin").unwrap();

        let cleared = fx.admin().reset_failures("editor", "alice", Utc::now()).unwrap();
        assert_eq!(cleared.failure_count, 0);
        assert!(cleared.last_error.is_none());
        assert_eq!(fx.catalog.require("editor").unwrap().failure_count, 0);
        let last = fx.audit.records().pop().unwrap();
        assert_eq!(last.actor, "alice");
        assert!(last.details.contains("count was 3"));

        assert!(matches!(
            fx.admin().reset_failures("editor", "alice", Utc::now()),
            Err(DeployError::InvalidState { .. })
        ));
    }

    #[test]
    fn installed_entries_cannot_be_removed() {
        let fx = Fixture::new();
        let mut installed = entry("editor");
        installed.current_version = Some("1.0".to_string());
        installed.installed_at = Some(Utc::now());
        fx.admin().add_entry(&installed, "admin").unwrap();
        assert!(matches!(
            fx.admin().remove_entry("editor", "admin"),
            Err(DeployError::CatalogConflict { .. })
        ));
    }

    #[test]
    fn policy_toggle_keeps_the_rule() {
        let fx = Fixture::new();
        let id = fx
            .admin()
            .add_policy(&SourcePolicy::new("*.ru", Direction::Deny, 1), "admin")
            .unwrap();
        let disabled = fx.admin().set_policy_active(id, false, "admin").unwrap();
        assert!(!disabled.active);
        assert!(fx.policies.active_by_priority().unwrap().is_empty());
        assert_eq!(fx.policies.list().unwrap().len(), 1);

        fx.admin().remove_policy(id, "admin").unwrap();
        assert!(fx.policies.list().unwrap().is_empty());
        assert!(matches!(
            fx.admin().set_policy_active(id, true, "admin"),
            Err(DeployError::EntryNotFound { .. })
        ));
    }
}
