//! Installer strategies: installer kind -> program + argument template.
//!
//! Templates understand three placeholders: `{artifact}` (downloaded file),
//! `{install_dir}` (entry's install directory) and `{package}` (package-manager
//! reference). An entry's `silent_args` replace the template arguments.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::catalog::entry::{CatalogEntry, InstallerKind};
use crate::core::config::{InstallerTemplate, InstallersConfig};
use crate::core::errors::{DeployError, Result};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::process::{ProcessSpec, ProcessSupervisor};

/// Fully expanded command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// What executing an install means for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPlan {
    Run(InstallerCommand),
    /// Portable apps are copied into their install directory.
    CopyPortable { artifact: PathBuf, install_dir: PathBuf },
}

/// Result of a successful installer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub restart_required: bool,
}

/// Lookup table from installer kind to strategy.
#[derive(Debug, Clone)]
pub struct InstallerRegistry {
    templates: HashMap<InstallerKind, InstallerTemplate>,
    restart_exit_codes: Vec<i32>,
}

struct Placeholders<'a> {
    artifact: Option<&'a Path>,
    install_dir: Option<&'a Path>,
    package: Option<&'a str>,
}

impl Placeholders<'_> {
    fn expand(&self, raw: &str) -> String {
        let mut out = raw.to_string();
        if let Some(artifact) = self.artifact {
            out = out.replace("{artifact}", &artifact.to_string_lossy());
        }
        if let Some(dir) = self.install_dir {
            out = out.replace("{install_dir}", &dir.to_string_lossy());
        }
        if let Some(package) = self.package {
            out = out.replace("{package}", package);
        }
        out
    }
}

impl InstallerRegistry {
    #[must_use]
    pub fn from_config(config: &InstallersConfig, restart_exit_codes: &[i32]) -> Self {
        let mut templates = HashMap::new();
        templates.insert(InstallerKind::Executable, config.executable.clone());
        templates.insert(InstallerKind::Msi, config.msi.clone());
        templates.insert(InstallerKind::Archive, config.archive.clone());
        templates.insert(InstallerKind::PackageManager, config.package_manager.clone());
        Self {
            templates,
            restart_exit_codes: restart_exit_codes.to_vec(),
        }
    }

    #[must_use]
    pub fn template(&self, kind: InstallerKind) -> Option<&InstallerTemplate> {
        self.templates.get(&kind)
    }

    fn require_install_dir(entry: &CatalogEntry) -> Result<&Path> {
        entry
            .install_dir
            .as_deref()
            .ok_or_else(|| DeployError::InvalidState {
                code: entry.code.clone(),
                details: format!("{} entries need an install_dir", entry.kind),
            })
    }

    /// Resolve how to install `entry` from `artifact` (absent for package-manager entries).
    pub fn install_plan(&self, entry: &CatalogEntry, artifact: Option<&Path>) -> Result<InstallPlan> {
        if entry.kind == InstallerKind::Portable {
            let artifact = artifact.ok_or_else(|| missing_artifact(entry))?;
            return Ok(InstallPlan::CopyPortable {
                artifact: artifact.to_path_buf(),
                install_dir: Self::require_install_dir(entry)?.to_path_buf(),
            });
        }
        if entry.kind.downloads_artifact() && artifact.is_none() {
            return Err(missing_artifact(entry));
        }
        let install_dir = if entry.kind == InstallerKind::Archive {
            Some(Self::require_install_dir(entry)?)
        } else {
            entry.install_dir.as_deref()
        };
        let template = self.template(entry.kind).ok_or_else(|| DeployError::InvalidConfig {
            details: format!("no installer template for kind {}", entry.kind),
        })?;
        let vars = Placeholders {
            artifact,
            install_dir,
            package: entry.package_ref.as_deref(),
        };
        let args = entry.silent_args.as_ref().unwrap_or(&template.args);
        Ok(InstallPlan::Run(InstallerCommand {
            program: vars.expand(&template.program),
            args: args.iter().map(|arg| vars.expand(arg)).collect(),
            // Archives extract into their install dir, which may not exist yet.
            cwd: if entry.kind == InstallerKind::Archive {
                install_dir.map(Path::to_path_buf)
            } else {
                artifact.and_then(Path::parent).map(Path::to_path_buf)
            },
        }))
    }

    /// Resolve the uninstall command. `None` means there is nothing to run.
    pub fn uninstall_plan(&self, entry: &CatalogEntry) -> Result<Option<InstallerCommand>> {
        let vars = Placeholders {
            artifact: None,
            install_dir: entry.install_dir.as_deref(),
            package: entry.package_ref.as_deref(),
        };
        if let Some(command) = entry
            .uninstall_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        {
            let mut parts = split_command_line(command).into_iter().map(|p| vars.expand(&p));
            let Some(program) = parts.next() else {
                return Ok(None);
            };
            return Ok(Some(InstallerCommand {
                program,
                args: parts.collect(),
                cwd: None,
            }));
        }
        match self.template(entry.kind) {
            Some(template) if !template.uninstall_program.trim().is_empty() => {
                Ok(Some(InstallerCommand {
                    program: vars.expand(&template.uninstall_program),
                    args: template.uninstall_args.iter().map(|a| vars.expand(a)).collect(),
                    cwd: None,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Map an exit code: 0 success, restart codes success with restart, else failure.
    pub fn classify_exit(&self, program: &str, exit_code: i32) -> Result<ExecutionOutcome> {
        if exit_code == 0 {
            return Ok(ExecutionOutcome {
                exit_code,
                restart_required: false,
            });
        }
        if self.restart_exit_codes.contains(&exit_code) {
            return Ok(ExecutionOutcome {
                exit_code,
                restart_required: true,
            });
        }
        Err(DeployError::ProcessExit {
            program: program.to_string(),
            code: exit_code,
        })
    }

    /// Run a command under the supervisor and classify its exit code.
    pub fn execute(
        &self,
        command: &InstallerCommand,
        supervisor: &ProcessSupervisor,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let mut spec = ProcessSpec::new(
            command.program.clone(),
            command.args.clone(),
            timeout,
            "executing",
        );
        spec.cwd.clone_from(&command.cwd);
        let output = supervisor.run(&spec, cancel)?;
        self.classify_exit(&command.program, output.exit_code)
    }

    /// Carry out an install plan.
    pub fn run_plan(
        &self,
        plan: &InstallPlan,
        supervisor: &ProcessSupervisor,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        match plan {
            InstallPlan::Run(command) => {
                if let Some(dir) = &command.cwd {
                    fs::create_dir_all(dir).map_err(|e| DeployError::io(dir, e))?;
                }
                self.execute(command, supervisor, timeout, cancel)
            }
            InstallPlan::CopyPortable {
                artifact,
                install_dir,
            } => {
                cancel.check("executing")?;
                copy_portable(artifact, install_dir)?;
                Ok(ExecutionOutcome {
                    exit_code: 0,
                    restart_required: false,
                })
            }
        }
    }
}

fn missing_artifact(entry: &CatalogEntry) -> DeployError {
    DeployError::InvalidState {
        code: entry.code.clone(),
        details: format!("{} install requires a downloaded artifact", entry.kind),
    }
}

fn copy_portable(artifact: &Path, install_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(install_dir).map_err(|e| DeployError::io(install_dir, e))?;
    let name = artifact.file_name().ok_or_else(|| DeployError::Runtime {
        details: format!("artifact path {} has no file name", artifact.display()),
    })?;
    let dest = install_dir.join(name);
    fs::copy(artifact, &dest).map_err(|e| DeployError::io(&dest, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))
            .map_err(|e| DeployError::io(&dest, e))?;
    }
    Ok(dest)
}

/// Split a stored command line into program and arguments.
///
/// Whitespace separates words; double quotes group words and are removed.
/// Backslashes are literal so Windows paths survive.
#[must_use]
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_word = false;
    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_word = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_word {
                    words.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            c => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if has_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn registry() -> InstallerRegistry {
        InstallerRegistry::from_config(&InstallersConfig::default(), &[3010])
    }

    fn entry(kind: InstallerKind) -> CatalogEntry {
        CatalogEntry::new("app", "App", kind, "https://dl.example.com/app", Utc::now())
    }

    #[test]
    fn msi_template_expands_artifact() {
        let plan = registry()
            .install_plan(&entry(InstallerKind::Msi), Some(Path::new("/tmp/run/app.msi")))
            .unwrap();
        let InstallPlan::Run(cmd) = plan else {
            panic!("expected a command");
        };
        assert_eq!(cmd.program, "msiexec");
        assert_eq!(cmd.args, vec!["/i", "/tmp/run/app.msi", "/qn", "/norestart"]);
        assert_eq!(cmd.cwd.as_deref(), Some(Path::new("/tmp/run")));
    }

    #[test]
    fn silent_args_override_template() {
        let mut e = entry(InstallerKind::Executable);
        e.silent_args = Some(vec!["--quiet".to_string(), "--log={artifact}.log".to_string()]);
        let InstallPlan::Run(cmd) = registry()
            .install_plan(&e, Some(Path::new("/tmp/run/setup.exe")))
            .unwrap()
        else {
            panic!("expected a command");
        };
        assert_eq!(cmd.program, "/tmp/run/setup.exe");
        assert_eq!(cmd.args, vec!["--quiet", "--log=/tmp/run/setup.exe.log"]);
    }

    #[test]
    fn package_manager_needs_no_artifact() {
        let mut e = entry(InstallerKind::PackageManager);
        e.package_ref = Some("Mozilla.Firefox".to_string());
        let InstallPlan::Run(cmd) = registry().install_plan(&e, None).unwrap() else {
            panic!("expected a command");
        };
        assert_eq!(cmd.program, "winget");
        assert!(cmd.args.contains(&"Mozilla.Firefox".to_string()));
        let uninstall = registry().uninstall_plan(&e).unwrap().unwrap();
        assert_eq!(uninstall.args, vec!["uninstall", "--id", "Mozilla.Firefox", "--silent"]);
    }

    #[test]
    fn archive_and_portable_require_install_dir() {
        let err = registry()
            .install_plan(&entry(InstallerKind::Archive), Some(Path::new("/tmp/a.tar")))
            .unwrap_err();
        assert_eq!(err.code(), "FDP-4006");
        let mut portable = entry(InstallerKind::Portable);
        portable.install_dir = Some(PathBuf::from("/opt/tools"));
        assert_eq!(
            registry()
                .install_plan(&portable, Some(Path::new("/tmp/run/tool")))
                .unwrap(),
            InstallPlan::CopyPortable {
                artifact: PathBuf::from("/tmp/run/tool"),
                install_dir: PathBuf::from("/opt/tools"),
            }
        );
    }

    #[test]
    fn exit_code_contract() {
        let r = registry();
        assert!(!r.classify_exit("x", 0).unwrap().restart_required);
        assert!(r.classify_exit("x", 3010).unwrap().restart_required);
        let err = r.classify_exit("x", 1603).unwrap_err();
        assert!(matches!(err, DeployError::ProcessExit { code: 1603, .. }));
    }

    #[test]
    fn stored_uninstall_command_is_split() {
        let mut e = entry(InstallerKind::Executable);
        e.uninstall_command =
            Some(r#""C:\Program Files\App\uninst.exe" /S /D="C:\Program Files\App""#.to_string());
        let cmd = registry().uninstall_plan(&e).unwrap().unwrap();
        assert_eq!(cmd.program, r"C:\Program Files\App\uninst.exe");
        assert_eq!(cmd.args, vec!["/S", r"/D=C:\Program Files\App"]);

        e.uninstall_command = Some("   ".to_string());
        assert_eq!(registry().uninstall_plan(&e).unwrap(), None);
    }

    #[test]
    fn portable_copy_lands_in_install_dir() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("tool");
        fs::write(&artifact, b"bin").unwrap();
        let target = dir.path().join("opt");
        let plan = InstallPlan::CopyPortable {
            artifact,
            install_dir: target.clone(),
        };
        let outcome = registry()
            .run_plan(&plan, &ProcessSupervisor::new(), Duration::from_secs(5), &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(fs::read(target.join("tool")).unwrap(), b"bin");
    }

    #[cfg(unix)]
    #[test]
    fn execute_maps_restart_code() {
        let cmd = InstallerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 3010".to_string()],
            cwd: None,
        };
        let outcome = registry()
            .execute(&cmd, &ProcessSupervisor::new(), Duration::from_secs(10), &CancellationToken::new())
            .unwrap();
        assert!(outcome.restart_required);
    }
}
