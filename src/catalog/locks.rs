//! Per-entry mutual exclusion: at most one in-flight pipeline run per catalog code.
//!
//! The in-process registry covers threads sharing one pipeline. When a lease
//! directory is configured, each claim also holds an exclusive `flock()` on
//! `<dir>/<code>.lock`, so the daemon and one-shot CLI commands working on the
//! same catalog exclude each other. The kernel drops the lease if the holder dies.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use parking_lot::Mutex;

use crate::core::errors::{DeployError, Result};

#[cfg(unix)]
type Lease = nix::fcntl::Flock<File>;
#[cfg(not(unix))]
type Lease = File;

/// Registry of catalog codes that currently have a run in flight.
#[derive(Debug, Clone, Default)]
pub struct EntryLocks {
    held: Arc<Mutex<HashSet<String>>>,
    lease_dir: Option<PathBuf>,
}

impl EntryLocks {
    /// In-process registry only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed by lock files under `dir`, shared with other processes.
    #[must_use]
    pub fn with_lease_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            held: Arc::default(),
            lease_dir: Some(dir.into()),
        }
    }

    /// Directory holding the lease files, if any.
    #[must_use]
    pub fn lease_dir(&self) -> Option<&Path> {
        self.lease_dir.as_deref()
    }

    /// Claim `code` without blocking; a second caller gets `EntryBusy`.
    pub fn try_acquire(&self, code: &str) -> Result<EntryGuard> {
        if !self.held.lock().insert(code.to_string()) {
            return Err(busy(code));
        }
        let lease = match &self.lease_dir {
            Some(dir) => match acquire_lease(dir, code) {
                Ok(lease) => Some(lease),
                Err(err) => {
                    self.held.lock().remove(code);
                    return Err(err);
                }
            },
            None => None,
        };
        Ok(EntryGuard {
            code: code.to_string(),
            held: Arc::clone(&self.held),
            lease,
        })
    }

    /// Whether this process holds `code`. Leases held elsewhere are not visible.
    #[must_use]
    pub fn is_held(&self, code: &str) -> bool {
        self.held.lock().contains(code)
    }
}

fn busy(code: &str) -> DeployError {
    DeployError::EntryBusy {
        code: code.to_string(),
    }
}

/// Lock file name for `code`; anything outside `[A-Za-z0-9._-]` becomes `_`.
fn lease_file_name(code: &str) -> String {
    let safe: String = code
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.lock")
}

fn open_lease_file(dir: &Path, code: &str) -> Result<File> {
    fs::create_dir_all(dir).map_err(|source| DeployError::io(dir, source))?;
    let path = dir.join(lease_file_name(code));
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(&path).map_err(|source| DeployError::io(&path, source))
}

#[cfg(unix)]
fn acquire_lease(dir: &Path, code: &str) -> Result<Lease> {
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};

    let file = open_lease_file(dir, code)?;
    #[allow(deprecated)]
    let locked = Flock::lock(file, FlockArg::LockExclusiveNonblock);
    locked.map_err(|(_file, errno)| {
        if errno == Errno::EWOULDBLOCK {
            busy(code)
        } else {
            DeployError::Runtime {
                details: format!("failed to lock entry {code}: {errno}"),
            }
        }
    })
}

// No advisory locking here; the file only marks the claim.
#[cfg(not(unix))]
fn acquire_lease(dir: &Path, code: &str) -> Result<Lease> {
    open_lease_file(dir, code)
}

/// Releases the claim on drop.
pub struct EntryGuard {
    code: String,
    held: Arc<Mutex<HashSet<String>>>,
    lease: Option<Lease>,
}

impl EntryGuard {
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Whether the claim also holds a lease file lock.
    #[must_use]
    pub const fn is_leased(&self) -> bool {
        self.lease.is_some()
    }
}

impl fmt::Debug for EntryGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryGuard")
            .field("code", &self.code)
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        // Lease first: a same-process claimer must not see a free slot while the file is locked.
        drop(self.lease.take());
        self.held.lock().remove(&self.code);
    }
}
