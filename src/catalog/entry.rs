//! Catalog entry model: one deployable application and its version state.

#![allow(missing_docs)]

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{DeployError, Result};

/// How an artifact is turned into an installed application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallerKind {
    /// Single-file setup executable.
    Executable,
    /// Platform installer package (MSI).
    Msi,
    /// Packaged archive extracted into the install directory.
    Archive,
    /// Portable binary copied into the install directory.
    Portable,
    /// Reference into the OS package manager; nothing is downloaded.
    PackageManager,
}

impl InstallerKind {
    pub const ALL: [Self; 5] = [
        Self::Executable,
        Self::Msi,
        Self::Archive,
        Self::Portable,
        Self::PackageManager,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Executable => "executable",
            Self::Msi => "msi",
            Self::Archive => "archive",
            Self::Portable => "portable",
            Self::PackageManager => "package_manager",
        }
    }

    /// Whether the pipeline downloads and gates an artifact for this kind.
    #[must_use]
    pub const fn downloads_artifact(self) -> bool {
        !matches!(self, Self::PackageManager)
    }
}

impl fmt::Display for InstallerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallerKind {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        let needle = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == needle)
            .or(match needle.as_str() {
                "exe" => Some(Self::Executable),
                "zip" | "tar" => Some(Self::Archive),
                "winget" => Some(Self::PackageManager),
                _ => None,
            })
            .ok_or_else(|| DeployError::InvalidState {
                code: s.to_string(),
                details: "unknown installer kind".to_string(),
            })
    }
}

/// Who may move a detected update into installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Detected updates are approved automatically and dispatched by the scheduler.
    Auto,
    /// An administrator approves each update.
    #[default]
    AdminApproved,
    /// Approved and installed only on explicit request.
    Manual,
    /// Updates are never installed, approval or not.
    Disabled,
}

impl UpdatePolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::AdminApproved => "admin_approved",
            Self::Manual => "manual",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdatePolicy {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(Self::Auto),
            "admin_approved" | "admin" => Ok(Self::AdminApproved),
            "manual" => Ok(Self::Manual),
            "disabled" => Ok(Self::Disabled),
            _ => Err(DeployError::InvalidState {
                code: s.to_string(),
                details: "unknown update policy".to_string(),
            }),
        }
    }
}

/// A recorded approval decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    /// `None` never expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Approval {
    #[must_use]
    pub fn new(approved_by: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            approved_by: approved_by.into(),
            approved_at: now,
            expires_at: None,
        }
    }

    /// Lazy invalidation: an elapsed approval counts as revoked while still stored.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// A detected, not yet installed version. Version, URL and checksum live and die together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub version: String,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Version, URL and checksum of one installed release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub version: String,
    pub download_url: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Signature requirements checked by the signature gate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureRequirement {
    pub required: bool,
    /// Case-insensitive substring of the signer subject.
    pub expected_publisher: Option<String>,
    /// Certificate thumbprint; whitespace and case are ignored.
    pub expected_thumbprint: Option<String>,
}

const DEFAULT_CHECK_INTERVAL_HOURS: u32 = 24;

const fn default_check_interval_hours() -> u32 {
    DEFAULT_CHECK_INTERVAL_HOURS
}

/// One deployable application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Stable unique key.
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    pub kind: InstallerKind,

    #[serde(default)]
    pub current_version: Option<String>,
    pub download_url: String,
    #[serde(default)]
    pub checksum: Option<String>,

    #[serde(default)]
    pub approval: Option<Approval>,
    /// Set while installed; `None` means not installed.
    #[serde(default)]
    pub installed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub signature: SignatureRequirement,

    #[serde(default)]
    pub update_policy: UpdatePolicy,
    #[serde(default)]
    pub update_check_url: Option<String>,
    #[serde(default = "default_check_interval_hours")]
    pub update_check_interval_hours: u32,
    #[serde(default)]
    pub last_update_check: Option<DateTime<Utc>>,
    /// Hours an update approval stays valid. 0 never expires.
    #[serde(default)]
    pub approval_window_hours: u32,

    #[serde(default)]
    pub pending: Option<PendingUpdate>,
    #[serde(default)]
    pub update_approval: Option<Approval>,

    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,

    /// Snapshot of the release replaced by the last update; present iff rollback is possible.
    #[serde(default)]
    pub previous: Option<VersionSnapshot>,

    /// Replaces the kind's default installer arguments.
    #[serde(default)]
    pub silent_args: Option<Vec<String>>,
    #[serde(default)]
    pub uninstall_command: Option<String>,
    #[serde(default)]
    pub install_dir: Option<PathBuf>,
    #[serde(default)]
    pub package_ref: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntry {
    /// New entry: unapproved, not installed, no update state.
    #[must_use]
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        kind: InstallerKind,
        download_url: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            category: None,
            kind,
            current_version: None,
            download_url: download_url.into(),
            checksum: None,
            approval: None,
            installed_at: None,
            signature: SignatureRequirement::default(),
            update_policy: UpdatePolicy::default(),
            update_check_url: None,
            update_check_interval_hours: DEFAULT_CHECK_INTERVAL_HOURS,
            last_update_check: None,
            approval_window_hours: 0,
            pending: None,
            update_approval: None,
            failure_count: 0,
            last_error: None,
            previous: None,
            silent_args: None,
            uninstall_command: None,
            install_dir: None,
            package_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn is_approved(&self) -> bool {
        self.approval.is_some()
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed_at.is_some()
    }

    #[must_use]
    pub fn update_available(&self) -> bool {
        self.pending.is_some()
    }

    #[must_use]
    pub fn rollback_available(&self) -> bool {
        self.previous.is_some()
    }

    /// Update approval that is set and not yet elapsed.
    #[must_use]
    pub fn has_live_update_approval(&self, now: DateTime<Utc>) -> bool {
        self.update_approval
            .as_ref()
            .is_some_and(|approval| !approval.is_expired(now))
    }

    /// Update approval still physically set but past its expiry.
    #[must_use]
    pub fn update_approval_expired(&self, now: DateTime<Utc>) -> bool {
        self.update_approval
            .as_ref()
            .is_some_and(|approval| approval.is_expired(now))
    }

    /// When the next update check is due; `None` if checks are not configured.
    #[must_use]
    pub fn next_check_at(&self) -> Option<DateTime<Utc>> {
        self.update_check_url.as_ref()?;
        Some(self.last_update_check.map_or(self.created_at, |last| {
            last + Duration::hours(i64::from(self.update_check_interval_hours))
        }))
    }

    /// Installed, not Disabled, configured for checks, and the interval has elapsed.
    #[must_use]
    pub fn is_due_for_check(&self, now: DateTime<Utc>) -> bool {
        self.is_installed()
            && self.update_policy != UpdatePolicy::Disabled
            && self.next_check_at().is_some_and(|due| now >= due)
    }

    /// Snapshot of what is installed right now, if anything.
    #[must_use]
    pub fn current_snapshot(&self) -> Option<VersionSnapshot> {
        self.current_version.as_ref().map(|version| VersionSnapshot {
            version: version.clone(),
            download_url: self.download_url.clone(),
            checksum: self.checksum.clone(),
        })
    }

    /// Structural checks applied before an entry is stored.
    pub fn validate(&self) -> Result<()> {
        let invalid = |details: &str| DeployError::InvalidState {
            code: self.code.clone(),
            details: details.to_string(),
        };
        if self.code.trim().is_empty() {
            return Err(invalid("code must not be empty"));
        }
        if self.code.chars().any(char::is_whitespace) {
            return Err(invalid("code must not contain whitespace"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.kind.downloads_artifact() && self.download_url.trim().is_empty() {
            return Err(invalid("download_url is required for this installer kind"));
        }
        if self.kind == InstallerKind::PackageManager && self.package_ref.is_none() {
            return Err(invalid("package_ref is required for package_manager entries"));
        }
        if self.is_installed() && self.current_version.is_none() {
            return Err(invalid("installed entry must carry a current version"));
        }
        if let Some(checksum) = &self.checksum
            && !is_sha256_hex(checksum)
        {
            return Err(invalid("checksum must be a 64-character hex SHA-256 digest"));
        }
        Ok(())
    }
}

/// Whether `value` looks like a hex SHA-256 digest.
#[must_use]
pub fn is_sha256_hex(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit())
}
