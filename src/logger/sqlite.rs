//! SQLite audit table: WAL-mode storage for querying past deployment decisions.

#![allow(missing_docs)]

use std::path::Path;

use rusqlite::{Connection, OpenFlags, params};

use crate::core::errors::{DeployError, Result};
use crate::logger::audit::AuditRecord;

/// Audit rows in the `audit_log` table.
pub struct AuditDb {
    conn: Connection,
}

impl AuditDb {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| DeployError::io(parent, source))?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Insert one record.
    pub fn log_record(&self, record: &AuditRecord) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO audit_log (
                    timestamp, action, actor, success, severity, entry_code,
                    version, gate, error_code, duration_ms, details
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            )?
            .execute(params![
                record.ts,
                record.action.as_str(),
                record.actor,
                record.success,
                record.severity.as_str(),
                record.entry_code,
                record.version,
                record.gate.map(|gate| gate.label()),
                record.error_code,
                record.duration_ms.and_then(|ms| i64::try_from(ms).ok()),
                record.details,
            ])?;
        Ok(())
    }

    /// Most recent records, newest first, optionally limited to one entry.
    pub fn recent(&self, entry_code: Option<&str>, limit: u32) -> Result<Vec<AuditRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT timestamp, action, actor, success, severity, entry_code, error_code, details
             FROM audit_log
             WHERE (?1 IS NULL OR entry_code = ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![entry_code, limit], |row| {
                Ok(AuditRow {
                    timestamp: row.get(0)?,
                    action: row.get(1)?,
                    actor: row.get(2)?,
                    success: row.get(3)?,
                    severity: row.get(4)?,
                    entry_code: row.get(5)?,
                    error_code: row.get(6)?,
                    details: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            action TEXT NOT NULL,
            actor TEXT NOT NULL,
            success INTEGER NOT NULL,
            severity TEXT NOT NULL,
            entry_code TEXT,
            version TEXT,
            gate TEXT,
            error_code TEXT,
            duration_ms INTEGER,
            details TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_entry ON audit_log(entry_code, id);",
    )?;
    Ok(())
}

/// Flattened audit row as read back from SQLite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub timestamp: String,
    pub action: String,
    pub actor: String,
    pub success: bool,
    pub severity: String,
    pub entry_code: Option<String>,
    pub error_code: Option<String>,
    pub details: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::DeployError;
    use crate::logger::audit::AuditAction;

    #[test]
    fn records_are_queryable_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let db = AuditDb::open(&dir.path().join("audit.sqlite3")).unwrap();
        db.log_record(&AuditRecord::new(AuditAction::Install, "alice", "ok").entry("a"))
            .unwrap();
        let err = DeployError::ChecksumMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        db.log_record(&AuditRecord::failure(AuditAction::SecurityGateFailed, "alice", &err).entry("b"))
            .unwrap();

        let all = db.recent(None, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].action, "security_gate_failed");
        assert_eq!(all[0].error_code.as_deref(), Some("FDP-2101"));
        assert!(!all[0].success);

        let only_a = db.recent(Some("a"), 10).unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].actor, "alice");
    }
}
