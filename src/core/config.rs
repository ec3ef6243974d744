//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{DeployError, Result};
use crate::policy::source::Direction;

/// Full fleet-deploy configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub network: NetworkConfig,
    pub signature: SignatureConfig,
    pub scanner: ScannerConfig,
    pub installers: InstallersConfig,
    pub scheduler: SchedulerConfig,
    pub paths: PathsConfig,
    pub policy: PolicyConfig,
}

/// Download, execution and worker-pool knobs for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Parent directory for per-run temp workspaces.
    pub temp_root: PathBuf,
    pub download_program: String,
    pub connect_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub uninstall_timeout_secs: u64,
    /// Installer exit codes that mean "succeeded, restart required".
    pub restart_exit_codes: Vec<i32>,
    /// Worker threads for user-initiated jobs.
    pub worker_threads: usize,
}

/// Server base the relative download paths are resolved against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    #[default]
    Local,
    Cloud,
}

/// Proxy and server-base settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct NetworkConfig {
    pub proxy: Option<String>,
    pub no_proxy: Vec<String>,
    pub server_mode: ServerMode,
    pub local_server_base: Option<String>,
    pub cloud_server_base: Option<String>,
}

/// External signature-inspector invocation. `{artifact}` is substituted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SignatureConfig {
    /// Empty program means no inspector is available on this host.
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

/// External malware-scanner invocation and exit-code contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScannerConfig {
    pub enabled: bool,
    pub program: String,
    pub args: Vec<String>,
    pub clean_exit_codes: Vec<i32>,
    pub threat_exit_codes: Vec<i32>,
    /// Regex with one capture group pulling the threat name out of scanner output.
    pub threat_name_pattern: String,
    pub timeout_secs: u64,
}

/// Program + argument template for one installer kind.
///
/// Placeholders: `{artifact}`, `{install_dir}`, `{package}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct InstallerTemplate {
    pub program: String,
    pub args: Vec<String>,
    /// Uninstall template; empty program falls back to the entry's stored command.
    pub uninstall_program: String,
    pub uninstall_args: Vec<String>,
}

/// Per-kind installer templates. Portable installs are file copies and need none.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstallersConfig {
    pub executable: InstallerTemplate,
    pub msi: InstallerTemplate,
    pub archive: InstallerTemplate,
    pub package_manager: InstallerTemplate,
}

/// Periodic driver settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_secs: u64,
    /// Auto-update dispatch skips entries at or above this failure count.
    pub failure_ceiling: u32,
    pub auto_update_parallelism: usize,
}

/// Filesystem paths used by fdeploy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub catalog_db: PathBuf,
    pub audit_jsonl: PathBuf,
    pub audit_fallback: Option<PathBuf>,
    /// Per-entry lock files shared by the daemon and CLI invocations.
    pub lease_dir: PathBuf,
}

/// One bootstrap rule seeded into an empty policy store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRule {
    pub pattern: String,
    pub direction: Direction,
    #[serde(default = "default_rule_priority")]
    pub priority: i32,
    #[serde(default)]
    pub description: Option<String>,
}

const fn default_rule_priority() -> i32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PolicyConfig {
    pub bootstrap: Vec<PolicyRule>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_root: env::temp_dir().join("fleet-deploy"),
            download_program: "curl".to_string(),
            connect_timeout_secs: 30,
            download_timeout_secs: 30 * 60,
            install_timeout_secs: 60 * 60,
            uninstall_timeout_secs: 30 * 60,
            restart_exit_codes: vec![3010],
            worker_threads: 4,
        }
    }
}

impl Default for SignatureConfig {
    fn default() -> Self {
        if cfg!(windows) {
            Self {
                program: "powershell".to_string(),
                args: vec![
                    "-NoProfile".to_string(),
                    "-NonInteractive".to_string(),
                    "-Command".to_string(),
                    concat!(
                        "$s = Get-AuthenticodeSignature -LiteralPath '{artifact}'; ",
                        "[pscustomobject]@{ Status = [string]$s.Status; ",
                        "Signer = $s.SignerCertificate.Subject; ",
                        "Issuer = $s.SignerCertificate.Issuer; ",
                        "Thumbprint = $s.SignerCertificate.Thumbprint; ",
                        "TimeStamper = $s.TimeStamperCertificate.Subject; ",
                        "Message = $s.StatusMessage } | ConvertTo-Json -Compress"
                    )
                    .to_string(),
                ],
                timeout_secs: 60,
            }
        } else {
            Self {
                program: String::new(),
                args: Vec::new(),
                timeout_secs: 60,
            }
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        if cfg!(windows) {
            Self {
                enabled: true,
                program: r"C:\Program Files\Windows Defender\MpCmdRun.exe".to_string(),
                args: vec![
                    "-Scan".to_string(),
                    "-ScanType".to_string(),
                    "3".to_string(),
                    "-File".to_string(),
                    "{artifact}".to_string(),
                    "-DisableRemediation".to_string(),
                ],
                clean_exit_codes: vec![0],
                threat_exit_codes: vec![2],
                threat_name_pattern: r"Threat\s*:\s*(\S+)".to_string(),
                timeout_secs: 5 * 60,
            }
        } else {
            Self {
                enabled: true,
                program: "clamscan".to_string(),
                args: vec!["--no-summary".to_string(), "{artifact}".to_string()],
                clean_exit_codes: vec![0],
                threat_exit_codes: vec![1],
                threat_name_pattern: r":\s*(\S+)\s+FOUND".to_string(),
                timeout_secs: 5 * 60,
            }
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Default for InstallersConfig {
    fn default() -> Self {
        Self {
            executable: InstallerTemplate {
                program: "{artifact}".to_string(),
                args: strings(&["/S"]),
                uninstall_program: String::new(),
                uninstall_args: Vec::new(),
            },
            msi: InstallerTemplate {
                program: "msiexec".to_string(),
                args: strings(&["/i", "{artifact}", "/qn", "/norestart"]),
                uninstall_program: String::new(),
                uninstall_args: Vec::new(),
            },
            archive: InstallerTemplate {
                program: "tar".to_string(),
                args: strings(&["-xf", "{artifact}", "-C", "{install_dir}"]),
                uninstall_program: String::new(),
                uninstall_args: Vec::new(),
            },
            package_manager: InstallerTemplate {
                program: "winget".to_string(),
                args: strings(&[
                    "install",
                    "--id",
                    "{package}",
                    "--silent",
                    "--accept-package-agreements",
                    "--accept-source-agreements",
                ]),
                uninstall_program: "winget".to_string(),
                uninstall_args: strings(&["uninstall", "--id", "{package}", "--silent"]),
            },
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 60 * 60,
            failure_ceiling: 3,
            auto_update_parallelism: 2,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME")
            .or_else(|| env::var_os("USERPROFILE"))
            .map_or_else(
                || {
                    eprintln!(
                        "[FDP-CONFIG] WARNING: HOME not set, falling back to temp dir for data paths"
                    );
                    env::temp_dir()
                },
                PathBuf::from,
            );
        let cfg = home_dir
            .join(".config")
            .join("fleet-deploy")
            .join("config.toml");
        let data = home_dir.join(".local").join("share").join("fleet-deploy");
        Self {
            config_file: cfg,
            catalog_db: data.join("catalog.sqlite3"),
            audit_jsonl: data.join("audit.jsonl"),
            audit_fallback: Some(env::temp_dir().join("fleet-deploy-audit.jsonl")),
            lease_dir: data.join("leases"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| DeployError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(DeployError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the audit trail.
    ///
    /// FNV-1a over the canonical JSON so the value is stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // pipeline
        if let Some(raw) = lookup("FDP_PIPELINE_TEMP_ROOT") {
            self.pipeline.temp_root = PathBuf::from(raw);
        }
        set_u64(
            &mut lookup,
            "FDP_PIPELINE_DOWNLOAD_TIMEOUT_SECS",
            &mut self.pipeline.download_timeout_secs,
        )?;
        set_u64(
            &mut lookup,
            "FDP_PIPELINE_INSTALL_TIMEOUT_SECS",
            &mut self.pipeline.install_timeout_secs,
        )?;
        set_usize(
            &mut lookup,
            "FDP_PIPELINE_WORKER_THREADS",
            &mut self.pipeline.worker_threads,
        )?;

        // network
        if let Some(raw) = lookup("FDP_NETWORK_PROXY") {
            self.network.proxy = Some(raw);
        }
        if let Some(raw) = lookup("FDP_NETWORK_SERVER_MODE") {
            self.network.server_mode = match raw.trim().to_ascii_lowercase().as_str() {
                "local" => ServerMode::Local,
                "cloud" => ServerMode::Cloud,
                other => {
                    return Err(DeployError::ConfigParse {
                        context: "env",
                        details: format!("FDP_NETWORK_SERVER_MODE={other:?}: expected local|cloud"),
                    });
                }
            };
        }

        // scanner
        set_bool(&mut lookup, "FDP_SCANNER_ENABLED", &mut self.scanner.enabled)?;
        if let Some(raw) = lookup("FDP_SCANNER_PROGRAM") {
            self.scanner.program = raw;
        }

        // scheduler
        set_bool(
            &mut lookup,
            "FDP_SCHEDULER_ENABLED",
            &mut self.scheduler.enabled,
        )?;
        set_u64(
            &mut lookup,
            "FDP_SCHEDULER_TICK_INTERVAL_SECS",
            &mut self.scheduler.tick_interval_secs,
        )?;
        if let Some(raw) = lookup("FDP_SCHEDULER_FAILURE_CEILING") {
            self.scheduler.failure_ceiling =
                raw.parse::<u32>().map_err(|error| DeployError::ConfigParse {
                    context: "env",
                    details: format!("FDP_SCHEDULER_FAILURE_CEILING={raw:?}: {error}"),
                })?;
        }

        // paths
        if let Some(raw) = lookup("FDP_PATHS_CATALOG_DB") {
            self.paths.catalog_db = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("FDP_PATHS_AUDIT_JSONL") {
            self.paths.audit_jsonl = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("FDP_PATHS_LEASE_DIR") {
            self.paths.lease_dir = PathBuf::from(raw);
        }

        Ok(())
    }

    /// Reject configurations that would make the pipeline unusable.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.download_program.trim().is_empty() {
            return Err(DeployError::InvalidConfig {
                details: "pipeline.download_program must not be empty".to_string(),
            });
        }
        for (name, value) in [
            (
                "pipeline.connect_timeout_secs",
                self.pipeline.connect_timeout_secs,
            ),
            (
                "pipeline.download_timeout_secs",
                self.pipeline.download_timeout_secs,
            ),
            (
                "pipeline.install_timeout_secs",
                self.pipeline.install_timeout_secs,
            ),
            (
                "pipeline.uninstall_timeout_secs",
                self.pipeline.uninstall_timeout_secs,
            ),
            ("signature.timeout_secs", self.signature.timeout_secs),
            ("scanner.timeout_secs", self.scanner.timeout_secs),
            ("scheduler.tick_interval_secs", self.scheduler.tick_interval_secs),
        ] {
            if value == 0 {
                return Err(DeployError::InvalidConfig {
                    details: format!("{name} must be > 0"),
                });
            }
        }
        if self.pipeline.connect_timeout_secs > self.pipeline.download_timeout_secs {
            return Err(DeployError::InvalidConfig {
                details: "pipeline.connect_timeout_secs must not exceed download_timeout_secs"
                    .to_string(),
            });
        }
        if self.pipeline.restart_exit_codes.contains(&0) {
            return Err(DeployError::InvalidConfig {
                details: "pipeline.restart_exit_codes must not contain 0".to_string(),
            });
        }
        if self.pipeline.worker_threads == 0 {
            return Err(DeployError::InvalidConfig {
                details: "pipeline.worker_threads must be >= 1".to_string(),
            });
        }
        if self.scheduler.failure_ceiling == 0 {
            return Err(DeployError::InvalidConfig {
                details: "scheduler.failure_ceiling must be >= 1".to_string(),
            });
        }
        if self.scheduler.auto_update_parallelism == 0 {
            return Err(DeployError::InvalidConfig {
                details: "scheduler.auto_update_parallelism must be >= 1".to_string(),
            });
        }
        if self.scanner.enabled {
            if self.scanner.program.trim().is_empty() {
                return Err(DeployError::InvalidConfig {
                    details: "scanner.program must be set when the scanner is enabled".to_string(),
                });
            }
            if let Some(code) = self
                .scanner
                .clean_exit_codes
                .iter()
                .find(|code| self.scanner.threat_exit_codes.contains(code))
            {
                return Err(DeployError::InvalidConfig {
                    details: format!("scanner exit code {code} is both clean and threat"),
                });
            }
        }
        if !self.scanner.threat_name_pattern.is_empty() {
            regex::Regex::new(&self.scanner.threat_name_pattern).map_err(|error| {
                DeployError::InvalidConfig {
                    details: format!("scanner.threat_name_pattern: {error}"),
                }
            })?;
        }
        if self.network.server_mode == ServerMode::Cloud
            && self.network.cloud_server_base.is_none()
        {
            return Err(DeployError::InvalidConfig {
                details: "network.cloud_server_base is required in cloud mode".to_string(),
            });
        }
        for rule in &self.policy.bootstrap {
            if rule.pattern.trim().is_empty() {
                return Err(DeployError::InvalidConfig {
                    details: "policy.bootstrap pattern must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<u64>().map_err(|error| DeployError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_usize<F>(lookup: &mut F, name: &str, slot: &mut usize) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .parse::<usize>()
            .map_err(|error| DeployError::ConfigParse {
                context: "env",
                details: format!("{name}={raw:?}: {error}"),
            })?;
    }
    Ok(())
}

fn set_bool<F>(lookup: &mut F, name: &str, slot: &mut bool) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw
            .trim()
            .parse::<bool>()
            .map_err(|error| DeployError::ConfigParse {
                context: "env",
                details: format!("{name}={raw:?}: {error}"),
            })?;
    }
    Ok(())
}
