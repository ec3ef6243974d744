//! Audit trail: record model, JSONL writer, optional SQLite table, logger thread.

pub mod audit;
pub mod dual;
pub mod jsonl;
#[cfg(feature = "sqlite")]
pub mod sqlite;
