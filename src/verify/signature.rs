//! Digital-signature inspection and the signature gate decision.
//!
//! Inspection is delegated to an external signing-authority tool (PowerShell
//! `Get-AuthenticodeSignature` by default on Windows). The tool prints one JSON
//! object; `Status` decides Valid / Invalid / Unsigned and the certificate
//! fields feed the publisher and thumbprint checks.

#![allow(missing_docs)]

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::entry::SignatureRequirement;
use crate::core::config::SignatureConfig;
use crate::core::errors::{DeployError, Result};
use crate::core::paths::extension_lower;
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::process::{ProcessSpec, ProcessSupervisor};

/// File types that can carry an embedded signature.
pub const SIGNABLE_EXTENSIONS: [&str; 9] =
    ["exe", "msi", "msix", "appx", "dll", "sys", "cab", "ps1", "cat"];

/// Three-way classification of an inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureStatus {
    Valid,
    Invalid,
    Unsigned,
}

/// What the inspector reported.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SignatureInfo {
    pub signed: bool,
    pub valid: bool,
    pub signer: Option<String>,
    pub issuer: Option<String>,
    pub thumbprint: Option<String>,
    pub timestamp_authority: Option<String>,
    pub error: Option<String>,
}

impl SignatureInfo {
    #[must_use]
    pub fn unsigned(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            signed: true,
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn status(&self) -> SignatureStatus {
        match (self.signed, self.valid) {
            (true, true) => SignatureStatus::Valid,
            (true, false) => SignatureStatus::Invalid,
            (false, _) => SignatureStatus::Unsigned,
        }
    }

    fn detail(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| format!("{:?}", self.status()).to_ascii_lowercase())
    }
}

/// Inspects an artifact's signature. Only cancellation is an `Err`; tool
/// failures come back as an `Invalid` or `Unsigned` report.
pub trait SignatureInspector: Send + Sync {
    fn inspect(&self, path: &Path, cancel: &CancellationToken) -> Result<SignatureInfo>;
}

/// Whether `path` has a signable extension.
#[must_use]
pub fn is_signable(path: &Path) -> bool {
    extension_lower(path).is_some_and(|ext| SIGNABLE_EXTENSIONS.contains(&ext.as_str()))
}

/// Inspector that shells out to a configured tool.
#[derive(Debug, Clone)]
pub struct CommandSignatureInspector {
    config: SignatureConfig,
    supervisor: ProcessSupervisor,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ToolReport {
    status: Option<String>,
    signer: Option<String>,
    issuer: Option<String>,
    thumbprint: Option<String>,
    time_stamper: Option<String>,
    message: Option<String>,
}

impl CommandSignatureInspector {
    #[must_use]
    pub fn new(config: SignatureConfig, supervisor: ProcessSupervisor) -> Self {
        Self { config, supervisor }
    }

    fn parse_report(stdout: &str) -> SignatureInfo {
        let report: ToolReport = match serde_json::from_str(stdout.trim()) {
            Ok(report) => report,
            Err(e) => return SignatureInfo::invalid(format!("unreadable inspector output: {e}")),
        };
        let status = report.status.unwrap_or_default();
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let mut info = SignatureInfo {
            signer: non_empty(report.signer),
            issuer: non_empty(report.issuer),
            thumbprint: non_empty(report.thumbprint),
            timestamp_authority: non_empty(report.time_stamper),
            ..SignatureInfo::default()
        };
        match status.to_ascii_lowercase().as_str() {
            "valid" => {
                info.signed = true;
                info.valid = true;
            }
            "notsigned" | "" => {
                info.error = Some(non_empty(report.message).unwrap_or_else(|| "not signed".to_string()));
            }
            other => {
                info.signed = true;
                info.error = Some(
                    non_empty(report.message).unwrap_or_else(|| format!("signature status {other}")),
                );
            }
        }
        info
    }
}

impl SignatureInspector for CommandSignatureInspector {
    fn inspect(&self, path: &Path, cancel: &CancellationToken) -> Result<SignatureInfo> {
        if !is_signable(path) {
            return Ok(SignatureInfo::unsigned(format!(
                "{} is not a signable file type",
                path.file_name()
                    .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
            )));
        }
        if self.config.program.trim().is_empty() {
            return Ok(SignatureInfo::unsigned(
                "no signature inspector is configured on this host",
            ));
        }
        let artifact = path.to_string_lossy();
        let args = self
            .config
            .args
            .iter()
            .map(|arg| arg.replace("{artifact}", &artifact))
            .collect();
        let spec = ProcessSpec::new(
            self.config.program.clone(),
            args,
            Duration::from_secs(self.config.timeout_secs),
            "signature",
        );
        match self.supervisor.run(&spec, cancel) {
            Ok(output) if output.exit_code == 0 => Ok(Self::parse_report(&output.stdout)),
            Ok(output) => Ok(SignatureInfo::invalid(format!(
                "inspector exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            ))),
            Err(err @ DeployError::Cancelled { .. }) => Err(err),
            Err(err) => Ok(SignatureInfo::invalid(format!("inspector failed: {err}"))),
        }
    }
}

/// Result of the signature gate when it does not abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureVerdict {
    /// Required and fully matched.
    Verified(SignatureInfo),
    /// Not required; the report is logged only.
    Informational(SignatureInfo),
}

fn normalize_thumbprint(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Apply the entry's signature requirement to an inspection report.
pub fn check_signature(
    info: SignatureInfo,
    requirement: &SignatureRequirement,
) -> Result<SignatureVerdict> {
    if !requirement.required {
        return Ok(SignatureVerdict::Informational(info));
    }
    match info.status() {
        SignatureStatus::Unsigned => {
            return Err(DeployError::SignatureUnsigned {
                details: info.detail(),
            });
        }
        SignatureStatus::Invalid => {
            return Err(DeployError::SignatureInvalid {
                details: info.detail(),
            });
        }
        SignatureStatus::Valid => {}
    }

    if let Some(expected) = requirement
        .expected_publisher
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        let signer = info.signer.clone().unwrap_or_default();
        if !signer
            .to_lowercase()
            .contains(&expected.to_lowercase())
        {
            return Err(DeployError::PublisherMismatch {
                expected: expected.to_string(),
                actual: signer,
            });
        }
    }

    if let Some(expected) = requirement
        .expected_thumbprint
        .as_deref()
        .map(normalize_thumbprint)
        .filter(|t| !t.is_empty())
    {
        let actual = info
            .thumbprint
            .as_deref()
            .map(normalize_thumbprint)
            .unwrap_or_default();
        if actual != expected {
            return Err(DeployError::ThumbprintMismatch { expected, actual });
        }
    }

    Ok(SignatureVerdict::Verified(info))
}
