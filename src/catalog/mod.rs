//! Application catalog: entries, repositories, and per-entry run locks.

pub mod admin;
pub mod entry;
pub mod locks;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;
