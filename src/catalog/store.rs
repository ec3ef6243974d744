//! Catalog and policy repositories, with in-memory implementations.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::catalog::entry::CatalogEntry;
use crate::core::errors::{DeployError, Result};
use crate::policy::source::SourcePolicy;

/// Named catalog queries the pipeline and scheduler rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogQuery {
    Approved,
    Installed,
    UpdatePending,
    RollbackAvailable,
    /// Installed, not Disabled, check interval elapsed.
    DueForCheck,
    /// Update approval still set but past its expiry.
    ExpiredApproval,
}

impl CatalogQuery {
    #[must_use]
    pub fn matches(self, entry: &CatalogEntry, now: DateTime<Utc>) -> bool {
        match self {
            Self::Approved => entry.is_approved(),
            Self::Installed => entry.is_installed(),
            Self::UpdatePending => entry.update_available(),
            Self::RollbackAvailable => entry.rollback_available(),
            Self::DueForCheck => entry.is_due_for_check(now),
            Self::ExpiredApproval => entry.update_approval_expired(now),
        }
    }
}

/// Persistence for catalog entries. Every mutation is a whole-entry write.
pub trait CatalogRepository: Send + Sync {
    /// Store a new entry; fails if the code already exists.
    fn insert(&self, entry: &CatalogEntry) -> Result<()>;
    fn get(&self, code: &str) -> Result<Option<CatalogEntry>>;
    /// Replace an existing entry; fails if it does not exist.
    fn save(&self, entry: &CatalogEntry) -> Result<()>;
    /// Remove an entry; rejected while it is installed.
    fn delete(&self, code: &str) -> Result<()>;
    /// All entries ordered by code.
    fn list(&self) -> Result<Vec<CatalogEntry>>;

    fn query(&self, query: CatalogQuery, now: DateTime<Utc>) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|entry| query.matches(entry, now))
            .collect())
    }

    /// `get` that treats absence as an error.
    fn require(&self, code: &str) -> Result<CatalogEntry> {
        self.get(code)?.ok_or_else(|| DeployError::EntryNotFound {
            code: code.to_string(),
        })
    }
}

/// Persistence for source policies.
pub trait PolicyRepository: Send + Sync {
    /// Store a new policy and return its id; pattern + direction must be unique.
    fn insert(&self, policy: &SourcePolicy) -> Result<u64>;
    fn update(&self, policy: &SourcePolicy) -> Result<()>;
    fn delete(&self, id: u64) -> Result<()>;
    fn list(&self) -> Result<Vec<SourcePolicy>>;

    /// Active policies sorted ascending by priority, ties broken by id.
    fn active_by_priority(&self) -> Result<Vec<SourcePolicy>> {
        let mut active: Vec<SourcePolicy> =
            self.list()?.into_iter().filter(|p| p.active).collect();
        active.sort_by_key(|p| (p.priority, p.id));
        Ok(active)
    }
}

pub(crate) fn policy_conflict(policy: &SourcePolicy) -> DeployError {
    DeployError::CatalogConflict {
        key: format!("{} {}", policy.direction, policy.pattern),
        details: "a policy with this pattern and direction already exists".to_string(),
    }
}

pub(crate) fn installed_delete_conflict(code: &str) -> DeployError {
    DeployError::CatalogConflict {
        key: code.to_string(),
        details: "entry is installed; uninstall it before removing it from the catalog"
            .to_string(),
    }
}

/// Catalog held in memory behind a `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: RwLock<BTreeMap<String, CatalogEntry>>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CatalogRepository for MemoryCatalog {
    fn insert(&self, entry: &CatalogEntry) -> Result<()> {
        entry.validate()?;
        let mut entries = self.entries.write();
        if entries.contains_key(&entry.code) {
            return Err(DeployError::CatalogConflict {
                key: entry.code.clone(),
                details: "an entry with this code already exists".to_string(),
            });
        }
        entries.insert(entry.code.clone(), entry.clone());
        Ok(())
    }

    fn get(&self, code: &str) -> Result<Option<CatalogEntry>> {
        Ok(self.entries.read().get(code).cloned())
    }

    fn save(&self, entry: &CatalogEntry) -> Result<()> {
        entry.validate()?;
        let mut entries = self.entries.write();
        let slot = entries
            .get_mut(&entry.code)
            .ok_or_else(|| DeployError::EntryNotFound {
                code: entry.code.clone(),
            })?;
        *slot = entry.clone();
        Ok(())
    }

    fn delete(&self, code: &str) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.get(code) {
            None => Err(DeployError::EntryNotFound {
                code: code.to_string(),
            }),
            Some(entry) if entry.is_installed() => Err(installed_delete_conflict(code)),
            Some(_) => {
                entries.remove(code);
                Ok(())
            }
        }
    }

    fn list(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self.entries.read().values().cloned().collect())
    }
}

/// Policy store held in memory.
#[derive(Debug, Default)]
pub struct MemoryPolicies {
    inner: RwLock<MemoryPoliciesInner>,
}

#[derive(Debug, Default)]
struct MemoryPoliciesInner {
    next_id: u64,
    policies: BTreeMap<u64, SourcePolicy>,
}

impl MemoryPolicies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from a list of rules.
    pub fn with_policies(policies: &[SourcePolicy]) -> Result<Self> {
        let store = Self::new();
        for policy in policies {
            store.insert(policy)?;
        }
        Ok(store)
    }
}

impl PolicyRepository for MemoryPolicies {
    fn insert(&self, policy: &SourcePolicy) -> Result<u64> {
        let mut inner = self.inner.write();
        if inner
            .policies
            .values()
            .any(|p| p.direction == policy.direction && p.pattern == policy.pattern)
        {
            return Err(policy_conflict(policy));
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let mut stored = policy.clone();
        stored.id = id;
        inner.policies.insert(id, stored);
        Ok(id)
    }

    fn update(&self, policy: &SourcePolicy) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.policies.values().any(|p| {
            p.id != policy.id && p.direction == policy.direction && p.pattern == policy.pattern
        }) {
            return Err(policy_conflict(policy));
        }
        let slot = inner
            .policies
            .get_mut(&policy.id)
            .ok_or_else(|| DeployError::EntryNotFound {
                code: format!("policy #{}", policy.id),
            })?;
        *slot = policy.clone();
        Ok(())
    }

    fn delete(&self, id: u64) -> Result<()> {
        self.inner
            .write()
            .policies
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DeployError::EntryNotFound {
                code: format!("policy #{id}"),
            })
    }

    fn list(&self) -> Result<Vec<SourcePolicy>> {
        Ok(self.inner.read().policies.values().cloned().collect())
    }
}
