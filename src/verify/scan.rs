//! Malware scanning through an external on-host scanner.

#![allow(missing_docs)]

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::core::config::ScannerConfig;
use crate::core::errors::{DeployError, Result};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::process::{ProcessSpec, ProcessSupervisor};

/// Raw scanner report.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ScanReport {
    pub completed: bool,
    pub threat_detected: bool,
    pub threat_name: Option<String>,
    pub scanner_id: String,
    pub error: Option<String>,
}

/// Classified outcome of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Clean,
    ThreatDetected(String),
    /// Scanner could not run or returned an unknown result. Logged, not fatal.
    Error(String),
    /// Scanning is disabled; treated as clean.
    Skipped,
}

impl ScanReport {
    #[must_use]
    pub fn outcome(&self) -> ScanOutcome {
        if self.threat_detected {
            return ScanOutcome::ThreatDetected(
                self.threat_name
                    .clone()
                    .unwrap_or_else(|| "unknown threat".to_string()),
            );
        }
        if self.completed {
            return ScanOutcome::Clean;
        }
        match &self.error {
            Some(error) => ScanOutcome::Error(error.clone()),
            None => ScanOutcome::Skipped,
        }
    }
}

/// Scans one artifact. Only cancellation is an `Err`.
pub trait MalwareScanner: Send + Sync {
    fn scan(&self, path: &Path, cancel: &CancellationToken) -> Result<ScanReport>;
}

/// Scanner that is switched off. Every scan is `Skipped`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledScanner;

impl MalwareScanner for DisabledScanner {
    fn scan(&self, _path: &Path, _cancel: &CancellationToken) -> Result<ScanReport> {
        Ok(ScanReport {
            scanner_id: "disabled".to_string(),
            ..ScanReport::default()
        })
    }
}

/// Runs the configured scanner command and classifies its exit code.
#[derive(Debug, Clone)]
pub struct CommandMalwareScanner {
    config: ScannerConfig,
    threat_pattern: Option<Regex>,
    supervisor: ProcessSupervisor,
}

impl CommandMalwareScanner {
    pub fn new(config: ScannerConfig, supervisor: ProcessSupervisor) -> Result<Self> {
        let threat_pattern = if config.threat_name_pattern.trim().is_empty() {
            None
        } else {
            Some(
                Regex::new(&config.threat_name_pattern).map_err(|e| DeployError::InvalidConfig {
                    details: format!("scanner.threat_name_pattern: {e}"),
                })?,
            )
        };
        Ok(Self {
            config,
            threat_pattern,
            supervisor,
        })
    }

    fn scanner_id(&self) -> String {
        Path::new(&self.config.program)
            .file_name()
            .map_or_else(|| self.config.program.clone(), |n| n.to_string_lossy().into_owned())
    }

    fn threat_name(&self, output: &str) -> Option<String> {
        self.threat_pattern
            .as_ref()?
            .captures(output)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

impl MalwareScanner for CommandMalwareScanner {
    fn scan(&self, path: &Path, cancel: &CancellationToken) -> Result<ScanReport> {
        let mut report = ScanReport {
            scanner_id: self.scanner_id(),
            ..ScanReport::default()
        };
        if !self.config.enabled {
            return Ok(report);
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
            "scanning",
        );

        let output = match self.supervisor.run(&spec, cancel) {
            Ok(output) => output,
            Err(err @ DeployError::Cancelled { .. }) => return Err(err),
            Err(err) => {
                report.error = Some(err.to_string());
                return Ok(report);
            }
        };

        if self.config.threat_exit_codes.contains(&output.exit_code) {
            report.completed = true;
            report.threat_detected = true;
            report.threat_name = self.threat_name(&output.combined());
        } else if self.config.clean_exit_codes.contains(&output.exit_code) {
            report.completed = true;
        } else {
            report.error = Some(format!(
                "scanner exited with unexpected code {}: {}",
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(report)
    }
}
