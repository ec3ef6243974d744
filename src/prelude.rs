//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use fleet_deploy::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{DeployError, Gate, Result, Severity};

// Catalog
pub use crate::catalog::entry::{CatalogEntry, InstallerKind, SignatureRequirement, UpdatePolicy};
pub use crate::catalog::store::{CatalogQuery, CatalogRepository, MemoryCatalog, PolicyRepository};

// Policy
pub use crate::policy::source::{Direction, PolicyDecision, SourcePolicy, SourcePolicyEngine};

// Verification
pub use crate::verify::gate::SecurityGateChain;
pub use crate::verify::scan::{MalwareScanner, ScanOutcome};
pub use crate::verify::signature::{SignatureInfo, SignatureInspector};

// Pipeline
pub use crate::pipeline::cancel::CancellationToken;
pub use crate::pipeline::progress::{ProgressSink, ProgressUpdate};
pub use crate::pipeline::runner::{InstallationPipeline, InstallationResult, RunContext};

// Updates
pub use crate::scheduler::loop_main::UpdateScheduler;
pub use crate::updates::service::{UpdateCheckResult, UpdateManager, UpdateResult};

// Wiring
pub use crate::runtime::{Collaborators, Services};
