//! Dual-write audit logger: JSONL always, SQLite when enabled.
//!
//! A dedicated logger thread owns the `JsonlWriter` and the optional `AuditDb`.
//! Pipeline threads send `AuditRecord`s through a bounded crossbeam channel with
//! `try_send()`, so a slow disk never stalls an install.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{DeployError, Result, Severity};
use crate::logger::audit::{AuditAction, AuditRecord, AuditSink};
use crate::logger::jsonl::{JsonlConfig, JsonlWriter};
#[cfg(feature = "sqlite")]
use crate::logger::sqlite::AuditDb;

/// Default bounded channel capacity for audit records.
const CHANNEL_CAPACITY: usize = 1024;

enum LoggerMessage {
    Record(Box<AuditRecord>),
    Shutdown,
}

/// Thread-safe, cheaply-cloneable handle for sending audit records.
#[derive(Clone)]
pub struct AuditLoggerHandle {
    tx: Sender<LoggerMessage>,
    dropped_events: Arc<AtomicU64>,
}

impl AuditLoggerHandle {
    /// Number of records dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LoggerMessage::Shutdown);
    }
}

impl AuditSink for AuditLoggerHandle {
    /// Non-blocking. A full channel drops the record and bumps the counter.
    fn log(&self, record: AuditRecord) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(LoggerMessage::Record(Box::new(record)))
        {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Options for building the audit logger.
pub struct AuditLoggerConfig {
    /// SQLite database for the `audit_log` table. `None` disables SQLite.
    pub sqlite_path: Option<PathBuf>,
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
}

impl AuditLoggerConfig {
    #[must_use]
    pub fn from_paths(paths: &crate::core::config::PathsConfig) -> Self {
        Self {
            sqlite_path: Some(paths.catalog_db.with_file_name("audit.sqlite3")),
            jsonl_config: JsonlConfig::at(paths.audit_jsonl.clone(), paths.audit_fallback.clone()),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread and return a handle plus its join handle.
pub fn spawn_audit_logger(
    config: AuditLoggerConfig,
) -> Result<(AuditLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<LoggerMessage>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = AuditLoggerHandle {
        tx,
        dropped_events: dropped,
    };

    let join = thread::Builder::new()
        .name("fdp-audit".to_string())
        .spawn(move || {
            logger_thread_main(&rx, config.sqlite_path, config.jsonl_config, &dropped_clone);
        })
        .map_err(|e| DeployError::Runtime {
            details: format!("failed to spawn audit logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(
    rx: &Receiver<LoggerMessage>,
    sqlite_path: Option<PathBuf>,
    jsonl_config: JsonlConfig,
    dropped: &AtomicU64,
) {
    #[cfg(feature = "sqlite")]
    let mut sqlite = sqlite_path.and_then(|p| match AuditDb::open(&p) {
        Ok(db) => Some(db),
        Err(e) => {
            eprintln!("[FDP-AUDIT] failed to open SQLite at {}: {e}", p.display());
            None
        }
    });
    #[cfg(not(feature = "sqlite"))]
    let _ = sqlite_path;

    let mut jsonl = JsonlWriter::open(jsonl_config);
    #[cfg(feature = "sqlite")]
    let mut sqlite_failures: u32 = 0;

    while let Ok(message) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let warn = AuditRecord::new(
                AuditAction::EventsDropped,
                "audit-logger",
                format!("{d} audit records dropped due to back-pressure"),
            )
            .severity(Severity::Warning);
            jsonl.write_record(&warn);
        }

        let record = match message {
            LoggerMessage::Record(record) => record,
            LoggerMessage::Shutdown => break,
        };

        jsonl.write_record(&record);

        #[cfg(feature = "sqlite")]
        {
            if let Some(db) = &sqlite {
                if db.log_record(&record).is_ok() {
                    sqlite_failures = 0;
                } else {
                    sqlite_failures += 1;
                    if sqlite_failures >= 3 {
                        eprintln!(
                            "[FDP-AUDIT] SQLite write failed {sqlite_failures} times, disabling"
                        );
                        sqlite = None;
                    }
                }
            }
        }

        // Critical records are fsynced immediately.
        if record.severity == Severity::Critical {
            jsonl.fsync();
        }
    }

    jsonl.flush();
    jsonl.fsync();
}
