//! The security gate chain.
//!
//! Gates run in a fixed order: source policy (before any download), then
//! checksum, signature and malware scan on the downloaded artifact. The first
//! failing gate aborts the chain; the artifact is deleted, exactly one audit
//! record names the gate, and the typed error is returned to the pipeline.

#![allow(missing_docs)]

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use crate::catalog::entry::SignatureRequirement;
use crate::core::errors::{DeployError, Gate, Result, Severity};
use crate::logger::audit::{AuditAction, AuditRecord, AuditSink};
use crate::pipeline::cancel::CancellationToken;
use crate::policy::source::{PolicyDecision, SourcePolicyEngine};
use crate::verify::checksum::{ChecksumOutcome, verify_checksum};
use crate::verify::scan::{MalwareScanner, ScanOutcome};
use crate::verify::signature::{
    SignatureInspector, SignatureStatus, SignatureVerdict, check_signature,
};

/// Who and what the chain is verifying, for audit attribution.
#[derive(Debug, Clone)]
pub struct GateSubject {
    pub entry_code: String,
    pub actor: String,
    pub version: Option<String>,
    pub action: AuditAction,
}

/// Integrity expectations for one artifact.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactExpectations<'a> {
    pub checksum: Option<&'a str>,
    pub signature: &'a SignatureRequirement,
}

/// Everything the artifact gates concluded for a passing artifact.
#[derive(Debug, Clone)]
pub struct GateReport {
    pub checksum: ChecksumOutcome,
    pub signature: SignatureVerdict,
    pub scan: ScanOutcome,
}

pub struct SecurityGateChain {
    policy: SourcePolicyEngine,
    inspector: Arc<dyn SignatureInspector>,
    scanner: Arc<dyn MalwareScanner>,
    audit: Arc<dyn AuditSink>,
}

impl SecurityGateChain {
    #[must_use]
    pub fn new(
        policy: SourcePolicyEngine,
        inspector: Arc<dyn SignatureInspector>,
        scanner: Arc<dyn MalwareScanner>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            policy,
            inspector,
            scanner,
            audit,
        }
    }

    /// Source-policy gate. Runs before anything touches the network.
    pub fn check_source(&self, url: &str, subject: &GateSubject) -> Result<PolicyDecision> {
        let decision = self.policy.evaluate(url)?;
        if let Err(err) = decision.clone().into_result(url) {
            self.record_abort(subject, &err);
            return Err(err);
        }
        Ok(decision)
    }

    /// Checksum, signature and malware-scan gates on a downloaded artifact.
    ///
    /// `on_pass` is called after each gate that passes, in order.
    pub fn verify_artifact(
        &self,
        artifact: &Path,
        expectations: ArtifactExpectations<'_>,
        subject: &GateSubject,
        cancel: &CancellationToken,
        on_pass: &mut dyn FnMut(Gate),
    ) -> Result<GateReport> {
        match self.run_artifact_gates(artifact, expectations, subject, cancel, on_pass) {
            Ok(report) => Ok(report),
            Err(err) => {
                discard_artifact(artifact);
                if err.gate().is_some() {
                    self.record_abort(subject, &err);
                }
                Err(err)
            }
        }
    }

    fn run_artifact_gates(
        &self,
        artifact: &Path,
        expectations: ArtifactExpectations<'_>,
        subject: &GateSubject,
        cancel: &CancellationToken,
        on_pass: &mut dyn FnMut(Gate),
    ) -> Result<GateReport> {
        cancel.check("verifying")?;
        let checksum = verify_checksum(artifact, expectations.checksum)?;
        on_pass(Gate::Checksum);

        cancel.check("verifying")?;
        let info = self.inspector.inspect(artifact, cancel)?;
        let signature = check_signature(info, expectations.signature)?;
        if let SignatureVerdict::Informational(info) = &signature
            && info.status() != SignatureStatus::Valid
        {
            let mut record = AuditRecord::new(
                AuditAction::SignatureInformational,
                &subject.actor,
                format!(
                    "signature not required; inspector reported {:?}: {}",
                    info.status(),
                    info.error.as_deref().unwrap_or("no details")
                ),
            )
            .entry(&subject.entry_code)
            .version(subject.version.as_deref());
            record.severity = Severity::Warning;
            self.audit.log(record);
        }
        on_pass(Gate::Signature);

        cancel.check("scanning")?;
        let scan = self.scanner.scan(artifact, cancel)?.outcome();
        match &scan {
            ScanOutcome::ThreatDetected(name) => {
                return Err(DeployError::MalwareDetected {
                    threat: name.clone(),
                });
            }
            ScanOutcome::Error(details) => {
                let err = DeployError::ScanUnavailable {
                    details: details.clone(),
                };
                self.audit.log(
                    AuditRecord::failure(AuditAction::ScanUnavailable, &subject.actor, &err)
                        .entry(&subject.entry_code)
                        .version(subject.version.as_deref())
                        .severity(Severity::Warning),
                );
            }
            ScanOutcome::Clean | ScanOutcome::Skipped => {}
        }
        on_pass(Gate::MalwareScan);

        Ok(GateReport {
            checksum,
            signature,
            scan,
        })
    }

    fn record_abort(&self, subject: &GateSubject, err: &DeployError) {
        let mut record = AuditRecord::failure(AuditAction::SecurityGateFailed, &subject.actor, err)
            .entry(&subject.entry_code)
            .version(subject.version.as_deref());
        record.details = format!("{} aborted: {err}", subject.action.as_str());
        self.audit.log(record);
    }
}

fn discard_artifact(artifact: &Path) {
    match fs::remove_file(artifact) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => eprintln!(
            "[FDP-GATE] failed to remove rejected artifact {}: {e}",
            artifact.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::MemoryPolicies;
    use crate::logger::audit::MemoryAuditSink;
    use crate::policy::source::{Direction, SourcePolicy};
    use crate::verify::scan::ScanReport;
    use crate::verify::signature::SignatureInfo;
    use parking_lot::Mutex;

    struct FixedInspector(SignatureInfo);

    impl SignatureInspector for FixedInspector {
        fn inspect(&self, _path: &Path, _cancel: &CancellationToken) -> Result<SignatureInfo> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingScanner {
        report: ScanReport,
        calls: Mutex<u32>,
    }

    impl MalwareScanner for RecordingScanner {
        fn scan(&self, _path: &Path, _cancel: &CancellationToken) -> Result<ScanReport> {
            *self.calls.lock() += 1;
            Ok(self.report.clone())
        }
    }

    fn subject() -> GateSubject {
        GateSubject {
            entry_code: "app".to_string(),
            actor: "tester".to_string(),
            version: Some("1.0".to_string()),
            action: AuditAction::Install,
        }
    }

    fn chain(
        policies: &[SourcePolicy],
        info: SignatureInfo,
        scanner: Arc<RecordingScanner>,
        audit: Arc<MemoryAuditSink>,
    ) -> SecurityGateChain {
        let repo = Arc::new(MemoryPolicies::with_policies(policies).unwrap());
        SecurityGateChain::new(
            SourcePolicyEngine::new(repo),
            Arc::new(FixedInspector(info)),
            scanner,
            audit,
        )
    }

    fn artifact(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("setup.exe");
        fs::write(&path, b"hello").unwrap();
        path
    }

    const HELLO_SHA: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn denied_source_is_audited_once() {
        let audit = Arc::new(MemoryAuditSink::new());
        let chain = chain(
            &[SourcePolicy::new("*crack*", Direction::Deny, 1)],
            SignatureInfo::default(),
            Arc::new(RecordingScanner::default()),
            Arc::clone(&audit),
        );
        let err = chain
            .check_source("https://files.example.com/CRACKED.exe", &subject())
            .unwrap_err();
        assert_eq!(err.gate(), Some(Gate::SourcePolicy));
        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].gate, Some(Gate::SourcePolicy));
        assert_eq!(records[0].severity, Severity::Critical);
    }

    #[test]
    fn checksum_failure_wins_over_signature_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path());
        let audit = Arc::new(MemoryAuditSink::new());
        let scanner = Arc::new(RecordingScanner::default());
        let chain = chain(
            &[],
            SignatureInfo::unsigned("not signed"),
            Arc::clone(&scanner),
            Arc::clone(&audit),
        );
        let requirement = SignatureRequirement {
            required: true,
            ..SignatureRequirement::default()
        };
        let bad = "0".repeat(64);
        let mut passed = Vec::new();
        let err = chain
            .verify_artifact(
                &path,
                ArtifactExpectations {
                    checksum: Some(&bad),
                    signature: &requirement,
                },
                &subject(),
                &CancellationToken::new(),
                &mut |gate| passed.push(gate),
            )
            .unwrap_err();
        assert!(matches!(err, DeployError::ChecksumMismatch { .. }));
        assert!(passed.is_empty());
        assert!(!path.exists(), "rejected artifact must be deleted");
        assert_eq!(*scanner.calls.lock(), 0);
        assert_eq!(audit.count(AuditAction::SecurityGateFailed), 1);
        assert_eq!(audit.records()[0].gate, Some(Gate::Checksum));
    }

    #[test]
    fn threat_aborts_after_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path());
        let audit = Arc::new(MemoryAuditSink::new());
        let scanner = Arc::new(RecordingScanner {
            report: ScanReport {
                completed: true,
                threat_detected: true,
                threat_name: Some("Trojan.X".to_string()),
                scanner_id: "fake".to_string(),
                error: None,
            },
            calls: Mutex::new(0),
        });
        let chain = chain(&[], SignatureInfo::default(), scanner, Arc::clone(&audit));
        let mut passed = Vec::new();
        let err = chain
            .verify_artifact(
                &path,
                ArtifactExpectations {
                    checksum: Some(HELLO_SHA),
                    signature: &SignatureRequirement::default(),
                },
                &subject(),
                &CancellationToken::new(),
                &mut |gate| passed.push(gate),
            )
            .unwrap_err();
        assert_eq!(err.code(), "FDP-2106");
        assert_eq!(passed, vec![Gate::Checksum, Gate::Signature]);
        assert!(!path.exists());
        assert_eq!(audit.count(AuditAction::SecurityGateFailed), 1);
    }

    #[test]
    fn scan_error_degrades_and_informational_signature_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let path = artifact(dir.path());
        let audit = Arc::new(MemoryAuditSink::new());
        let scanner = Arc::new(RecordingScanner {
            report: ScanReport {
                error: Some("engine offline".to_string()),
                ..ScanReport::default()
            },
            calls: Mutex::new(0),
        });
        let chain = chain(
            &[],
            SignatureInfo::unsigned("not signed"),
            scanner,
            Arc::clone(&audit),
        );
        let mut passed = Vec::new();
        let report = chain
            .verify_artifact(
                &path,
                ArtifactExpectations {
                    checksum: None,
                    signature: &SignatureRequirement::default(),
                },
                &subject(),
                &CancellationToken::new(),
                &mut |gate| passed.push(gate),
            )
            .unwrap();
        assert_eq!(report.checksum, ChecksumOutcome::Skipped);
        assert!(matches!(report.scan, ScanOutcome::Error(_)));
        assert_eq!(passed, vec![Gate::Checksum, Gate::Signature, Gate::MalwareScan]);
        assert!(path.exists());
        assert_eq!(audit.count(AuditAction::ScanUnavailable), 1);
        assert_eq!(audit.count(AuditAction::SignatureInformational), 1);
        assert_eq!(audit.count(AuditAction::SecurityGateFailed), 0);
    }
}
