#![forbid(unsafe_code)]

//! fleet-deploy: secure software deployment and update pipeline for managed
//! workstations.
//!
//! An approved catalog entry moves through a fixed chain before anything runs:
//! 1. **Source policy**: prioritized allow/deny rules over the download URL
//! 2. **Integrity gates**: SHA-256, code signature and publisher, malware scan
//! 3. **Supervised execution**: silent installer under timeout and cancellation
//!
//! Installed entries are then tracked through update detection, approval with
//! expiry, automatic or manual update, and one-step rollback.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use fleet_deploy::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use fleet_deploy::core::config::Config;
//! use fleet_deploy::policy::source::{CompiledPolicySet, SourcePolicy};
//! ```

pub mod prelude;

pub mod catalog;
pub mod core;
pub mod logger;
pub mod pipeline;
pub mod policy;
pub mod runtime;
pub mod scheduler;
pub mod updates;
pub mod verify;
