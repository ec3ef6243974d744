//! Service wiring: builds the pipeline, update manager and scheduler from a
//! loaded [`Config`] and a set of collaborators.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::catalog::admin::CatalogAdmin;
use crate::catalog::locks::EntryLocks;
use crate::catalog::store::{CatalogRepository, PolicyRepository};
use crate::core::config::{Config, PolicyRule};
use crate::core::errors::Result;
use crate::core::network::{NetworkConfigProvider, StaticNetworkConfig};
use crate::logger::audit::{AuditAction, AuditRecord, AuditSink};
use crate::logger::dual::AuditLoggerHandle;
use crate::pipeline::download::{ArtifactFetcher, CurlFetcher};
use crate::pipeline::installer::InstallerRegistry;
use crate::pipeline::pool::WorkerPool;
use crate::pipeline::process::ProcessSupervisor;
use crate::pipeline::runner::{InstallationPipeline, PipelineSettings};
use crate::policy::source::{SourcePolicy, SourcePolicyEngine};
use crate::scheduler::loop_main::UpdateScheduler;
use crate::updates::checker::UpdateFeed;
use crate::updates::service::{UpdateManager, UpdateSettings};
use crate::verify::gate::SecurityGateChain;
use crate::verify::scan::{CommandMalwareScanner, DisabledScanner, MalwareScanner};
use crate::verify::signature::{CommandSignatureInspector, SignatureInspector};

/// Everything the services need that is not derived from config alone.
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogRepository>,
    pub policies: Arc<dyn PolicyRepository>,
    pub audit: Arc<dyn AuditSink>,
    pub inspector: Arc<dyn SignatureInspector>,
    pub scanner: Arc<dyn MalwareScanner>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub feed: Arc<dyn UpdateFeed>,
    /// Entry claims; lease-backed when other processes share the catalog.
    pub locks: EntryLocks,
}

impl Collaborators {
    /// Host-tool collaborators (curl, the configured inspector and scanner)
    /// over the given stores.
    pub fn from_config(
        config: &Config,
        catalog: Arc<dyn CatalogRepository>,
        policies: Arc<dyn PolicyRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let supervisor = ProcessSupervisor::new();
        let network = StaticNetworkConfig::new(config.network.clone());
        let curl = Arc::new(CurlFetcher::new(
            config.pipeline.download_program.clone(),
            Duration::from_secs(config.pipeline.connect_timeout_secs),
            Duration::from_secs(config.pipeline.download_timeout_secs),
            network.proxy(),
            supervisor,
        ));
        let scanner: Arc<dyn MalwareScanner> = if config.scanner.enabled {
            Arc::new(CommandMalwareScanner::new(config.scanner.clone(), supervisor)?)
        } else {
            Arc::new(DisabledScanner)
        };
        Ok(Self {
            catalog,
            policies,
            audit,
            inspector: Arc::new(CommandSignatureInspector::new(
                config.signature.clone(),
                supervisor,
            )),
            scanner,
            fetcher: curl.clone(),
            feed: curl,
            locks: EntryLocks::with_lease_dir(config.paths.lease_dir.clone()),
        })
    }
}

/// The assembled service graph.
pub struct Services {
    pub config: Config,
    pub catalog: Arc<dyn CatalogRepository>,
    pub policies: Arc<dyn PolicyRepository>,
    pub policy_engine: SourcePolicyEngine,
    pub audit: Arc<dyn AuditSink>,
    pub pipeline: Arc<InstallationPipeline>,
    pub updates: Arc<UpdateManager>,
    audit_logger: Option<(AuditLoggerHandle, thread::JoinHandle<()>)>,
}

impl Services {
    /// Wire the services and seed bootstrap policies into an empty policy store.
    pub fn assemble(config: Config, parts: Collaborators) -> Result<Self> {
        let seeded = seed_bootstrap_policies(parts.policies.as_ref(), &config.policy.bootstrap)?;
        if seeded > 0 {
            parts.audit.log(AuditRecord::new(
                AuditAction::PolicyChanged,
                "system:bootstrap",
                format!("seeded {seeded} bootstrap source policies"),
            ));
        }

        let policy_engine = SourcePolicyEngine::new(Arc::clone(&parts.policies));
        let gates = Arc::new(SecurityGateChain::new(
            policy_engine.clone(),
            parts.inspector,
            parts.scanner,
            Arc::clone(&parts.audit),
        ));
        let network: Arc<dyn NetworkConfigProvider> =
            Arc::new(StaticNetworkConfig::new(config.network.clone()));
        let pipeline = Arc::new(InstallationPipeline::new(
            Arc::clone(&parts.catalog),
            gates,
            parts.fetcher,
            network,
            InstallerRegistry::from_config(&config.installers, &config.pipeline.restart_exit_codes),
            ProcessSupervisor::new(),
            Arc::clone(&parts.audit),
            parts.locks,
            PipelineSettings::from(&config.pipeline),
        ));
        let updates = Arc::new(UpdateManager::new(
            Arc::clone(&pipeline),
            parts.feed,
            UpdateSettings::from(&config.scheduler),
        ));

        Ok(Self {
            config,
            catalog: parts.catalog,
            policies: parts.policies,
            policy_engine,
            audit: parts.audit,
            pipeline,
            updates,
            audit_logger: None,
        })
    }

    /// Open the SQLite stores and the dual-write audit logger named by `config`.
    #[cfg(feature = "sqlite")]
    pub fn open(config: Config) -> Result<Self> {
        use crate::catalog::sqlite::SqliteStore;
        use crate::logger::dual::{AuditLoggerConfig, spawn_audit_logger};

        let store = Arc::new(SqliteStore::open(&config.paths.catalog_db)?);
        let (handle, join) = spawn_audit_logger(AuditLoggerConfig::from_paths(&config.paths))?;
        let audit: Arc<dyn AuditSink> = Arc::new(handle.clone());
        let parts = Collaborators::from_config(&config, store.clone(), store, audit)?;
        let mut services = Self::assemble(config, parts)?;
        services.audit_logger = Some((handle, join));
        Ok(services)
    }

    /// Audited catalog and policy edits sharing the pipeline's entry locks.
    #[must_use]
    pub fn admin(&self) -> CatalogAdmin<'_> {
        CatalogAdmin {
            catalog: self.catalog.as_ref(),
            policies: self.policies.as_ref(),
            audit: self.audit.as_ref(),
            locks: self.pipeline.locks(),
        }
    }

    /// Worker pool sized from `[pipeline] worker_threads`.
    pub fn worker_pool(&self) -> Result<WorkerPool> {
        WorkerPool::new(self.config.pipeline.worker_threads)
    }

    #[must_use]
    pub fn scheduler(&self) -> Arc<UpdateScheduler> {
        Arc::new(UpdateScheduler::new(
            Arc::clone(&self.updates),
            Arc::clone(&self.catalog),
        ))
    }

    /// Flush and stop the audit logger thread, if this instance owns one.
    pub fn close(mut self) {
        if let Some((handle, join)) = self.audit_logger.take() {
            handle.shutdown();
            let _ = join.join();
        }
    }
}

/// Insert `rules` when the store holds no policies yet. Returns the count inserted.
pub fn seed_bootstrap_policies(policies: &dyn PolicyRepository, rules: &[PolicyRule]) -> Result<usize> {
    if rules.is_empty() || !policies.list()?.is_empty() {
        return Ok(0);
    }
    for rule in rules {
        let mut policy = SourcePolicy::new(rule.pattern.clone(), rule.direction, rule.priority);
        policy.description.clone_from(&rule.description);
        policies.insert(&policy)?;
    }
    Ok(rules.len())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::MemoryPolicies;
    use crate::policy::source::Direction;

    fn rule(pattern: &str, direction: Direction, priority: i32) -> PolicyRule {
        PolicyRule {
            pattern: pattern.to_string(),
            direction,
            priority,
            description: Some("bootstrap".to_string()),
        }
    }

    #[test]
    fn bootstrap_seeds_only_an_empty_store() {
        let store = MemoryPolicies::new();
        let rules = vec![
            rule("*.internal.example", Direction::Allow, 10),
            rule("*.ru", Direction::Deny, 1),
        ];
        assert_eq!(seed_bootstrap_policies(&store, &rules).unwrap(), 2);
        assert_eq!(seed_bootstrap_policies(&store, &rules).unwrap(), 0);
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|p| p.description.as_deref() == Some("bootstrap")));
    }

    #[test]
    fn assemble_audits_bootstrap_seeding() {
        let mut config = Config::default();
        config.policy.bootstrap = vec![rule("*.ru", Direction::Deny, 1)];
        let fx = testing::fixture(config);
        assert_eq!(fx.audit.count(AuditAction::PolicyChanged), 1);
        assert!(
            !fx.services
                .policy_engine
                .evaluate("https://mirror.example.ru/a.exe")
                .unwrap()
                .is_allowed()
        );
    }

    #[test]
    fn empty_bootstrap_is_a_no_op() {
        let store = MemoryPolicies::new();
        assert_eq!(seed_bootstrap_policies(&store, &[]).unwrap(), 0);
        assert!(store.list().unwrap().is_empty());
    }
}
