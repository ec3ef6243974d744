//! SQLite catalog store: WAL-mode database holding catalog entries and source policies.
//!
//! Each entry is stored as a JSON body plus the handful of columns the
//! scheduler filters on, so the due-for-check and expired-approval scans run
//! as indexed queries instead of full deserialisation passes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};

use crate::catalog::entry::{CatalogEntry, UpdatePolicy};
use crate::catalog::store::{
    CatalogQuery, CatalogRepository, PolicyRepository, installed_delete_conflict, policy_conflict,
};
use crate::core::errors::{DeployError, Result};
use crate::policy::source::{Direction, SourcePolicy};

/// Catalog and policy persistence in one SQLite file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| DeployError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS catalog_entries (
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            approved INTEGER NOT NULL,
            installed INTEGER NOT NULL,
            update_available INTEGER NOT NULL,
            rollback_available INTEGER NOT NULL,
            update_policy TEXT NOT NULL,
            next_check_at TEXT,
            approval_expires_at TEXT,
            body TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_catalog_next_check
            ON catalog_entries(next_check_at) WHERE installed = 1;
        CREATE INDEX IF NOT EXISTS idx_catalog_approval_expiry
            ON catalog_entries(approval_expires_at);

        CREATE TABLE IF NOT EXISTS source_policies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pattern TEXT NOT NULL,
            direction TEXT NOT NULL,
            priority INTEGER NOT NULL,
            active INTEGER NOT NULL,
            description TEXT,
            UNIQUE(pattern, direction)
        );",
    )?;
    Ok(())
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

/// Column values derived from an entry; recomputed on every write.
struct EntryColumns {
    approved: bool,
    installed: bool,
    update_available: bool,
    rollback_available: bool,
    update_policy: &'static str,
    next_check_at: Option<String>,
    approval_expires_at: Option<String>,
    body: String,
    updated_at: String,
}

impl EntryColumns {
    fn from_entry(entry: &CatalogEntry) -> Result<Self> {
        Ok(Self {
            approved: entry.is_approved(),
            installed: entry.is_installed(),
            update_available: entry.update_available(),
            rollback_available: entry.rollback_available(),
            update_policy: entry.update_policy.as_str(),
            next_check_at: entry.next_check_at().map(ts),
            approval_expires_at: entry
                .update_approval
                .as_ref()
                .and_then(|approval| approval.expires_at)
                .map(ts),
            body: serde_json::to_string(entry)?,
            updated_at: ts(entry.updated_at),
        })
    }
}

fn decode_bodies(bodies: Vec<String>) -> Result<Vec<CatalogEntry>> {
    bodies
        .iter()
        .map(|body| serde_json::from_str::<CatalogEntry>(body).map_err(DeployError::from))
        .collect()
}

impl CatalogRepository for SqliteStore {
    fn insert(&self, entry: &CatalogEntry) -> Result<()> {
        entry.validate()?;
        let cols = EntryColumns::from_entry(entry)?;
        let conn = self.conn.lock();
        let outcome = conn
            .prepare_cached(
                "INSERT INTO catalog_entries (
                    code, name, approved, installed, update_available, rollback_available,
                    update_policy, next_check_at, approval_expires_at, body, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            )?
            .execute(params![
                entry.code,
                entry.name,
                cols.approved,
                cols.installed,
                cols.update_available,
                cols.rollback_available,
                cols.update_policy,
                cols.next_check_at,
                cols.approval_expires_at,
                cols.body,
                cols.updated_at,
            ]);
        match outcome {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(DeployError::CatalogConflict {
                key: entry.code.clone(),
                details: "an entry with this code already exists".to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn get(&self, code: &str) -> Result<Option<CatalogEntry>> {
        let conn = self.conn.lock();
        let body: Option<String> = conn
            .prepare_cached("SELECT body FROM catalog_entries WHERE code = ?1")?
            .query_row(params![code], |row| row.get(0))
            .optional()?;
        body.map(|raw| serde_json::from_str(&raw).map_err(DeployError::from))
            .transpose()
    }

    fn save(&self, entry: &CatalogEntry) -> Result<()> {
        entry.validate()?;
        let cols = EntryColumns::from_entry(entry)?;
        let conn = self.conn.lock();
        let changed = conn
            .prepare_cached(
                "UPDATE catalog_entries SET
                    name = ?2, approved = ?3, installed = ?4, update_available = ?5,
                    rollback_available = ?6, update_policy = ?7, next_check_at = ?8,
                    approval_expires_at = ?9, body = ?10, updated_at = ?11
                 WHERE code = ?1",
            )?
            .execute(params![
                entry.code,
                entry.name,
                cols.approved,
                cols.installed,
                cols.update_available,
                cols.rollback_available,
                cols.update_policy,
                cols.next_check_at,
                cols.approval_expires_at,
                cols.body,
                cols.updated_at,
            ])?;
        if changed == 0 {
            return Err(DeployError::EntryNotFound {
                code: entry.code.clone(),
            });
        }
        Ok(())
    }

    fn delete(&self, code: &str) -> Result<()> {
        let conn = self.conn.lock();
        let installed: Option<bool> = conn
            .query_row(
                "SELECT installed FROM catalog_entries WHERE code = ?1",
                params![code],
                |row| row.get(0),
            )
            .optional()?;
        match installed {
            None => Err(DeployError::EntryNotFound {
                code: code.to_string(),
            }),
            Some(true) => Err(installed_delete_conflict(code)),
            Some(false) => {
                conn.execute(
                    "DELETE FROM catalog_entries WHERE code = ?1",
                    params![code],
                )?;
                Ok(())
            }
        }
    }

    fn list(&self) -> Result<Vec<CatalogEntry>> {
        let conn = self.conn.lock();
        let bodies = conn
            .prepare_cached("SELECT body FROM catalog_entries ORDER BY code")?
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(conn);
        decode_bodies(bodies)
    }

    fn query(&self, query: CatalogQuery, now: DateTime<Utc>) -> Result<Vec<CatalogEntry>> {
        let now_str = ts(now);
        let sql = match query {
            CatalogQuery::Approved => {
                "SELECT body FROM catalog_entries WHERE approved = 1 ORDER BY code"
            }
            CatalogQuery::Installed => {
                "SELECT body FROM catalog_entries WHERE installed = 1 ORDER BY code"
            }
            CatalogQuery::UpdatePending => {
                "SELECT body FROM catalog_entries WHERE update_available = 1 ORDER BY code"
            }
            CatalogQuery::RollbackAvailable => {
                "SELECT body FROM catalog_entries WHERE rollback_available = 1 ORDER BY code"
            }
            CatalogQuery::DueForCheck => {
                "SELECT body FROM catalog_entries
                 WHERE installed = 1 AND update_policy != ?1
                   AND next_check_at IS NOT NULL AND next_check_at <= ?2
                 ORDER BY next_check_at, code"
            }
            CatalogQuery::ExpiredApproval => {
                "SELECT body FROM catalog_entries
                 WHERE approval_expires_at IS NOT NULL AND approval_expires_at <= ?1
                 ORDER BY code"
            }
        };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = match query {
            CatalogQuery::DueForCheck => stmt
                .query_map(params![UpdatePolicy::Disabled.as_str(), now_str], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            CatalogQuery::ExpiredApproval => stmt
                .query_map(params![now_str], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
            _ => stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };
        drop(stmt);
        drop(conn);
        decode_bodies(rows)
    }
}

impl PolicyRepository for SqliteStore {
    fn insert(&self, policy: &SourcePolicy) -> Result<u64> {
        let conn = self.conn.lock();
        let outcome = conn.execute(
            "INSERT INTO source_policies (pattern, direction, priority, active, description)
             VALUES (?1,?2,?3,?4,?5)",
            params![
                policy.pattern,
                policy.direction.as_str(),
                policy.priority,
                policy.active,
                policy.description,
            ],
        );
        match outcome {
            Ok(_) => u64::try_from(conn.last_insert_rowid()).map_err(|_| DeployError::Sql {
                context: "source_policies",
                details: "negative rowid".to_string(),
            }),
            Err(err) if is_constraint_violation(&err) => Err(policy_conflict(policy)),
            Err(err) => Err(err.into()),
        }
    }

    fn update(&self, policy: &SourcePolicy) -> Result<()> {
        let conn = self.conn.lock();
        let outcome = conn.execute(
            "UPDATE source_policies
             SET pattern = ?2, direction = ?3, priority = ?4, active = ?5, description = ?6
             WHERE id = ?1",
            params![
                i64::try_from(policy.id).unwrap_or(i64::MAX),
                policy.pattern,
                policy.direction.as_str(),
                policy.priority,
                policy.active,
                policy.description,
            ],
        );
        match outcome {
            Ok(0) => Err(DeployError::EntryNotFound {
                code: format!("policy #{}", policy.id),
            }),
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(policy_conflict(policy)),
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, id: u64) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM source_policies WHERE id = ?1",
            params![i64::try_from(id).unwrap_or(i64::MAX)],
        )?;
        if changed == 0 {
            return Err(DeployError::EntryNotFound {
                code: format!("policy #{id}"),
            });
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<SourcePolicy>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, pattern, direction, priority, active, description
             FROM source_policies ORDER BY priority, id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i32>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, pattern, direction, priority, active, description)| {
                Ok(SourcePolicy {
                    id: u64::try_from(id).unwrap_or_default(),
                    pattern,
                    direction: direction.parse::<Direction>()?,
                    priority,
                    active,
                    description,
                })
            })
            .collect()
    }
}
