//! FDP-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, DeployError>;

/// Security gate that produced a verdict, in the fixed order the chain runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    SourcePolicy,
    Checksum,
    Signature,
    MalwareScan,
}

impl Gate {
    /// All gates in execution order.
    pub const ORDER: [Self; 4] = [
        Self::SourcePolicy,
        Self::Checksum,
        Self::Signature,
        Self::MalwareScan,
    ];

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::SourcePolicy => "source_policy",
            Self::Checksum => "checksum",
            Self::Signature => "signature",
            Self::MalwareScan => "malware_scan",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Severity attached to audit records and error classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Top-level error type for the deployment pipeline.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("[FDP-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[FDP-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[FDP-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[FDP-2001] {code} is not approved for installation")]
    NotApproved { code: String },

    #[error("[FDP-2002] source denied for {url}: {reason}")]
    SourceDenied {
        url: String,
        reason: String,
        policy: Option<String>,
    },

    #[error("[FDP-2101] checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("[FDP-2102] artifact is not signed: {details}")]
    SignatureUnsigned { details: String },

    #[error("[FDP-2103] artifact signature is invalid: {details}")]
    SignatureInvalid { details: String },

    #[error("[FDP-2104] publisher mismatch: expected {expected:?}, signer is {actual:?}")]
    PublisherMismatch { expected: String, actual: String },

    #[error("[FDP-2105] certificate thumbprint mismatch: expected {expected}, got {actual}")]
    ThumbprintMismatch { expected: String, actual: String },

    #[error("[FDP-2106] malware detected: {threat}")]
    MalwareDetected { threat: String },

    #[error("[FDP-2107] malware scan unavailable: {details}")]
    ScanUnavailable { details: String },

    #[error("[FDP-3001] network failure for {url}: {details}")]
    Network { url: String, details: String },

    #[error("[FDP-3002] {program} timed out after {timeout:?}")]
    ProcessTimeout { program: String, timeout: Duration },

    #[error("[FDP-3003] {program} exited with code {code}")]
    ProcessExit { program: String, code: i32 },

    #[error("[FDP-3004] failed to launch {program}: {details}")]
    ProcessLaunch { program: String, details: String },

    #[error("[FDP-4001] no rollback snapshot available for {code}")]
    RollbackUnavailable { code: String },

    #[error("[FDP-4002] operation cancelled during {stage}")]
    Cancelled { stage: String },

    #[error("[FDP-4003] another pipeline run is in flight for {code}")]
    EntryBusy { code: String },

    #[error("[FDP-4004] catalog entry not found: {code}")]
    EntryNotFound { code: String },

    #[error("[FDP-4005] catalog conflict for {key}: {details}")]
    CatalogConflict { key: String, details: String },

    #[error("[FDP-4006] invalid state for {code}: {details}")]
    InvalidState { code: String, details: String },

    #[error("[FDP-5001] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[FDP-5002] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[FDP-5003] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[FDP-5004] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[FDP-5900] runtime failure: {details}")]
    Runtime { details: String },
}

impl DeployError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "FDP-1001",
            Self::MissingConfig { .. } => "FDP-1002",
            Self::ConfigParse { .. } => "FDP-1003",
            Self::NotApproved { .. } => "FDP-2001",
            Self::SourceDenied { .. } => "FDP-2002",
            Self::ChecksumMismatch { .. } => "FDP-2101",
            Self::SignatureUnsigned { .. } => "FDP-2102",
            Self::SignatureInvalid { .. } => "FDP-2103",
            Self::PublisherMismatch { .. } => "FDP-2104",
            Self::ThumbprintMismatch { .. } => "FDP-2105",
            Self::MalwareDetected { .. } => "FDP-2106",
            Self::ScanUnavailable { .. } => "FDP-2107",
            Self::Network { .. } => "FDP-3001",
            Self::ProcessTimeout { .. } => "FDP-3002",
            Self::ProcessExit { .. } => "FDP-3003",
            Self::ProcessLaunch { .. } => "FDP-3004",
            Self::RollbackUnavailable { .. } => "FDP-4001",
            Self::Cancelled { .. } => "FDP-4002",
            Self::EntryBusy { .. } => "FDP-4003",
            Self::EntryNotFound { .. } => "FDP-4004",
            Self::CatalogConflict { .. } => "FDP-4005",
            Self::InvalidState { .. } => "FDP-4006",
            Self::Serialization { .. } => "FDP-5001",
            Self::Sql { .. } => "FDP-5002",
            Self::Io { .. } => "FDP-5003",
            Self::ChannelClosed { .. } => "FDP-5004",
            Self::Runtime { .. } => "FDP-5900",
        }
    }

    /// Whether a later scheduled attempt might succeed where this one failed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::ProcessTimeout { .. }
                | Self::EntryBusy { .. }
                | Self::Io { .. }
                | Self::Sql { .. }
                | Self::ChannelClosed { .. }
        )
    }

    /// Security-classified failures: always fatal, audited as critical, never auto-retried.
    #[must_use]
    pub const fn is_security_failure(&self) -> bool {
        matches!(
            self,
            Self::SourceDenied { .. }
                | Self::SignatureUnsigned { .. }
                | Self::SignatureInvalid { .. }
                | Self::PublisherMismatch { .. }
                | Self::ThumbprintMismatch { .. }
                | Self::MalwareDetected { .. }
        )
    }

    /// Gate that produced this error, when it came out of the security chain.
    #[must_use]
    pub const fn gate(&self) -> Option<Gate> {
        match self {
            Self::SourceDenied { .. } => Some(Gate::SourcePolicy),
            Self::ChecksumMismatch { .. } => Some(Gate::Checksum),
            Self::SignatureUnsigned { .. }
            | Self::SignatureInvalid { .. }
            | Self::PublisherMismatch { .. }
            | Self::ThumbprintMismatch { .. } => Some(Gate::Signature),
            Self::MalwareDetected { .. } | Self::ScanUnavailable { .. } => {
                Some(Gate::MalwareScan)
            }
            _ => None,
        }
    }

    /// Audit severity for this failure.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        if self.is_security_failure() {
            Severity::Critical
        } else if matches!(self, Self::ScanUnavailable { .. } | Self::Cancelled { .. }) {
            Severity::Info
        } else {
            Severity::Warning
        }
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for cancellation at a named stage.
    #[must_use]
    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self::Cancelled {
            stage: stage.into(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for DeployError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for DeployError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for DeployError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<DeployError> {
        vec![
            DeployError::InvalidConfig {
                details: String::new(),
            },
            DeployError::MissingConfig {
                path: PathBuf::new(),
            },
            DeployError::ConfigParse {
                context: "",
                details: String::new(),
            },
            DeployError::NotApproved {
                code: String::new(),
            },
            DeployError::SourceDenied {
                url: String::new(),
                reason: String::new(),
                policy: None,
            },
            DeployError::ChecksumMismatch {
                expected: String::new(),
                actual: String::new(),
            },
            DeployError::SignatureUnsigned {
                details: String::new(),
            },
            DeployError::SignatureInvalid {
                details: String::new(),
            },
            DeployError::PublisherMismatch {
                expected: String::new(),
                actual: String::new(),
            },
            DeployError::ThumbprintMismatch {
                expected: String::new(),
                actual: String::new(),
            },
            DeployError::MalwareDetected {
                threat: String::new(),
            },
            DeployError::ScanUnavailable {
                details: String::new(),
            },
            DeployError::Network {
                url: String::new(),
                details: String::new(),
            },
            DeployError::ProcessTimeout {
                program: String::new(),
                timeout: Duration::ZERO,
            },
            DeployError::ProcessExit {
                program: String::new(),
                code: 1,
            },
            DeployError::ProcessLaunch {
                program: String::new(),
                details: String::new(),
            },
            DeployError::RollbackUnavailable {
                code: String::new(),
            },
            DeployError::cancelled("download"),
            DeployError::EntryBusy {
                code: String::new(),
            },
            DeployError::EntryNotFound {
                code: String::new(),
            },
            DeployError::CatalogConflict {
                key: String::new(),
                details: String::new(),
            },
            DeployError::InvalidState {
                code: String::new(),
                details: String::new(),
            },
            DeployError::Serialization {
                context: "",
                details: String::new(),
            },
            DeployError::Sql {
                context: "",
                details: String::new(),
            },
            DeployError::io("", std::io::Error::other("test")),
            DeployError::ChannelClosed { component: "" },
            DeployError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(DeployError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn display_includes_code() {
        for err in all_variants() {
            let msg = err.to_string();
            assert!(
                msg.contains(err.code()),
                "display for {} should carry its code: {msg}",
                err.code()
            );
        }
    }

    #[test]
    fn security_failures_are_critical_and_not_retryable() {
        for err in all_variants() {
            if err.is_security_failure() {
                assert_eq!(err.severity(), Severity::Critical, "{err}");
                assert!(!err.is_retryable(), "{err}");
            }
        }
    }

    #[test]
    fn network_and_timeout_are_retry_eligible() {
        let net = DeployError::Network {
            url: "https://example.com".to_string(),
            details: "reset".to_string(),
        };
        let timeout = DeployError::ProcessTimeout {
            program: "msiexec".to_string(),
            timeout: Duration::from_secs(600),
        };
        assert_eq!(timeout.to_string(), "[FDP-3002] msiexec timed out after 600s");
        let short = DeployError::ProcessTimeout {
            program: "sh".to_string(),
            timeout: Duration::from_millis(200),
        };
        assert_eq!(short.to_string(), "[FDP-3002] sh timed out after 200ms");
        assert!(net.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!net.is_security_failure());
    }

    #[test]
    fn checksum_mismatch_is_not_security_classified_but_gated() {
        let err = DeployError::ChecksumMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(!err.is_security_failure());
        assert_eq!(err.gate(), Some(Gate::Checksum));
    }

    #[test]
    fn signature_family_maps_to_signature_gate() {
        let errs = [
            DeployError::SignatureUnsigned {
                details: String::new(),
            },
            DeployError::SignatureInvalid {
                details: String::new(),
            },
            DeployError::PublisherMismatch {
                expected: String::new(),
                actual: String::new(),
            },
            DeployError::ThumbprintMismatch {
                expected: String::new(),
                actual: String::new(),
            },
        ];
        for err in errs {
            assert_eq!(err.gate(), Some(Gate::Signature));
        }
    }

    #[test]
    fn gate_order_is_fixed() {
        assert_eq!(
            Gate::ORDER,
            [
                Gate::SourcePolicy,
                Gate::Checksum,
                Gate::Signature,
                Gate::MalwareScan
            ]
        );
        assert!(Gate::Checksum < Gate::Signature);
    }
}
