//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use fleet_deploy::catalog::entry::{CatalogEntry, InstallerKind, SignatureRequirement, UpdatePolicy};
use fleet_deploy::catalog::store::{CatalogQuery, CatalogRepository, PolicyRepository};
use fleet_deploy::core::config::Config;
use fleet_deploy::core::errors::DeployError;
use fleet_deploy::pipeline::pool::JobHandle;
use fleet_deploy::pipeline::progress::ProgressUpdate;
use fleet_deploy::pipeline::runner::{InstallationResult, RunContext};
use fleet_deploy::policy::source::{Direction, PolicyDecision, SourcePolicy};
use fleet_deploy::runtime::Services;
use fleet_deploy::scheduler::daemon::run_daemon;
use fleet_deploy::scheduler::signals::SignalHandler;
use fleet_deploy::updates::service::UpdateResult;
use fleet_deploy::updates::state::update_state;

/// fleet-deploy: secure software deployment and update pipeline.
#[derive(Debug, Parser)]
#[command(
    name = "fdeploy",
    author,
    version,
    about = "Fleet Deploy - policy-gated installs, updates and rollbacks",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Actor recorded in the audit trail. Defaults to $USER.
    #[arg(long, global = true, value_name = "NAME")]
    actor: Option<String>,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the update scheduler until SIGTERM/SIGINT.
    Daemon,
    /// Manage catalog entries.
    Catalog(CatalogArgs),
    /// Approve (or revoke) an entry for installation.
    Approve(ApproveArgs),
    /// Install an approved entry.
    Install(EntryArgs),
    /// Uninstall an installed entry.
    Uninstall(EntryArgs),
    /// Check an entry's update feed now.
    Check(CheckArgs),
    /// Approve an entry's pending update.
    ApproveUpdate(EntryArgs),
    /// Install an entry's approved pending update.
    Update(EntryArgs),
    /// Reinstall the previous release of an entry.
    Rollback(EntryArgs),
    /// Manage source policies.
    Policy(PolicyArgs),
    /// Clear elapsed update approvals.
    Sweep,
    /// Run one scheduler tick in the foreground.
    Tick,
    /// Inspect configuration.
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
struct EntryArgs {
    /// Catalog code.
    code: String,
}

#[derive(Debug, Clone, Args)]
struct ApproveArgs {
    /// Catalog code.
    code: String,
    /// Withdraw the approval instead.
    #[arg(long)]
    revoke: bool,
}

#[derive(Debug, Clone, Args)]
struct CheckArgs {
    /// Catalog code. Omit with --due to check every entry due for a check.
    #[arg(required_unless_present = "due")]
    code: Option<String>,
    /// Check every entry whose check interval has elapsed.
    #[arg(long, conflicts_with = "code")]
    due: bool,
}

#[derive(Debug, Clone, Args)]
struct CatalogArgs {
    #[command(subcommand)]
    command: CatalogCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum CatalogCommand {
    /// Add a new entry.
    Add(AddEntryArgs),
    /// List entries, optionally filtered.
    List(ListArgs),
    /// Show one entry in full.
    Show(EntryArgs),
    /// Remove an entry that is not installed.
    Remove(EntryArgs),
    /// Clear recorded update failures so automatic updates resume.
    ResetFailures(EntryArgs),
}

#[derive(Debug, Clone, Args)]
struct AddEntryArgs {
    /// Stable unique code.
    code: String,
    /// Display name.
    #[arg(long)]
    name: String,
    /// Installer kind: executable, msi, archive, portable, package-manager.
    #[arg(long, value_parser = parse_kind)]
    kind: InstallerKind,
    /// Download URL, UNC/local path, or server-relative path.
    #[arg(long)]
    url: String,
    #[arg(long, value_name = "VERSION")]
    version: Option<String>,
    /// Expected SHA-256 of the artifact.
    #[arg(long, value_name = "HEX")]
    sha256: Option<String>,
    #[arg(long)]
    category: Option<String>,
    /// Update feed URL.
    #[arg(long, value_name = "URL")]
    update_url: Option<String>,
    /// auto, admin-approved, manual, disabled.
    #[arg(long, value_parser = parse_update_policy, default_value = "admin-approved")]
    update_policy: UpdatePolicy,
    #[arg(long, default_value_t = 24, value_name = "HOURS")]
    check_hours: u32,
    /// Hours an update approval stays valid (0 = never expires).
    #[arg(long, default_value_t = 0, value_name = "HOURS")]
    approval_window_hours: u32,
    /// Refuse unsigned or invalidly signed artifacts.
    #[arg(long)]
    require_signature: bool,
    #[arg(long, requires = "require_signature")]
    publisher: Option<String>,
    #[arg(long, requires = "require_signature")]
    thumbprint: Option<String>,
    /// Installer arguments replacing the kind's defaults (repeatable).
    #[arg(long = "silent-arg", value_name = "ARG", allow_hyphen_values = true)]
    silent_args: Vec<String>,
    #[arg(long, value_name = "COMMAND")]
    uninstall_command: Option<String>,
    #[arg(long, value_name = "PATH")]
    install_dir: Option<PathBuf>,
    /// Package-manager package id.
    #[arg(long, value_name = "ID")]
    package: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ListArgs {
    /// approved, installed, pending, rollback, due, expired.
    #[arg(long, value_parser = parse_query)]
    filter: Option<CatalogQuery>,
}

#[derive(Debug, Clone, Args)]
struct PolicyArgs {
    #[command(subcommand)]
    command: PolicyCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum PolicyCommand {
    /// Add an allow or deny rule.
    Add(AddPolicyArgs),
    /// List all rules in evaluation order.
    List,
    /// Evaluate a URL against the active rules.
    Eval {
        url: String,
    },
    /// Delete a rule.
    Remove {
        id: u64,
    },
    /// Re-activate a rule.
    Enable {
        id: u64,
    },
    /// Deactivate a rule without deleting it.
    Disable {
        id: u64,
    },
}

#[derive(Debug, Clone, Args)]
struct AddPolicyArgs {
    /// Domain, domain suffix, or `*` glob.
    pattern: String,
    #[arg(long, conflicts_with = "deny", required_unless_present = "deny")]
    allow: bool,
    #[arg(long)]
    deny: bool,
    /// Lower values are evaluated first.
    #[arg(long, default_value_t = 100, allow_hyphen_values = true)]
    priority: i32,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConfigCommand {
    /// Print config file path.
    Path,
    /// Print effective merged config.
    Show,
    /// Validate configuration.
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or a request the catalog state refuses.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// The operation ran and failed; details were already printed.
    #[error("{0}")]
    Failed(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
            Self::Failed(_) => 4,
        }
    }
}

impl From<DeployError> for CliError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::InvalidConfig { .. }
            | DeployError::MissingConfig { .. }
            | DeployError::ConfigParse { .. }
            | DeployError::NotApproved { .. }
            | DeployError::EntryNotFound { .. }
            | DeployError::EntryBusy { .. }
            | DeployError::CatalogConflict { .. }
            | DeployError::InvalidState { .. }
            | DeployError::RollbackUnavailable { .. } => Self::User(err.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    if let Command::Config(args) = &cli.command {
        return run_config(cli, args);
    }

    let config = Config::load(cli.config.as_deref())?;
    let services = Services::open(config)?;
    let outcome = dispatch(cli, &services);
    services.close();
    outcome
}

fn dispatch(cli: &Cli, services: &Services) -> Result<(), CliError> {
    match &cli.command {
        Command::Daemon => {
            let signals = SignalHandler::new();
            run_daemon(services, &signals)?;
            Ok(())
        }
        Command::Catalog(args) => run_catalog(cli, services, args),
        Command::Approve(args) => run_approve(cli, services, args),
        Command::Install(args) => run_pipeline_job(cli, services, &args.code, JobKind::Install),
        Command::Uninstall(args) => run_pipeline_job(cli, services, &args.code, JobKind::Uninstall),
        Command::Check(args) => run_check(cli, services, args),
        Command::ApproveUpdate(args) => {
            let entry = services
                .updates
                .approve_update(&args.code, &actor(cli), Utc::now())?;
            emit_entry(cli, "approve-update", &entry)
        }
        Command::Update(args) => {
            let ctx = interactive_context(cli);
            let result = services.updates.install_update(&args.code, &ctx, Utc::now());
            emit_update_result(cli, "update", &result)
        }
        Command::Rollback(args) => {
            let ctx = interactive_context(cli);
            let result = services.updates.rollback(&args.code, &ctx);
            emit_update_result(cli, "rollback", &result)
        }
        Command::Policy(args) => run_policy(cli, services, args),
        Command::Sweep => {
            let cleared = services
                .updates
                .sweep_expired_approvals(&actor(cli), Utc::now())?;
            match output_mode(cli) {
                OutputMode::Human => {
                    if cleared.is_empty() {
                        println!("No expired update approvals.");
                    } else {
                        println!("Cleared {} expired approval(s):", cleared.len());
                        for code in &cleared {
                            println!("  {code}");
                        }
                    }
                }
                OutputMode::Json => {
                    write_json_line(&json!({ "command": "sweep", "cleared": cleared }))?;
                }
            }
            Ok(())
        }
        Command::Tick => {
            let scheduler = services.scheduler();
            let Some(report) = scheduler.tick(Utc::now())? else {
                return Err(CliError::Runtime("a scheduler tick is already running".to_string()));
            };
            match output_mode(cli) {
                OutputMode::Human => {
                    println!(
                        "Checked {} entr{}, {} update(s) found, {} approval(s) expired, {} update(s) dispatched.",
                        report.checked.len(),
                        if report.checked.len() == 1 { "y" } else { "ies" },
                        report.updates_found.len(),
                        report.expired.len(),
                        report.dispatched.len()
                    );
                    for (code, error) in &report.check_failures {
                        println!("  {} {code}: {error}", "check failed".red());
                    }
                    for result in &report.dispatched {
                        print_update_result(result);
                    }
                }
                OutputMode::Json => {
                    let mut payload = report.to_json();
                    payload["command"] = json!("tick");
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Command::Config(_) => Ok(()),
    }
}

fn actor(cli: &Cli) -> String {
    cli.actor
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "cli".to_string())
}

/// Run context whose progress goes to stderr in human mode.
fn interactive_context(cli: &Cli) -> RunContext {
    let ctx = RunContext::new(actor(cli));
    if output_mode(cli) == OutputMode::Human && io::stderr().is_terminal() {
        ctx.with_progress(Arc::new(|update: &ProgressUpdate| {
            eprint!(
                "\r{:>5.1}% {:<18} {:<40}",
                update.fraction * 100.0,
                update.stage.as_str(),
                update.message
            );
            let _ = io::stderr().flush();
        }))
    } else {
        ctx
    }
}

#[derive(Debug, Clone, Copy)]
enum JobKind {
    Install,
    Uninstall,
}

fn run_pipeline_job(cli: &Cli, services: &Services, code: &str, kind: JobKind) -> Result<(), CliError> {
    let pool = services.worker_pool()?;
    let ctx = interactive_context(cli);
    let handle = match kind {
        JobKind::Install => services.pipeline.submit_install(&pool, code, ctx)?,
        JobKind::Uninstall => services.pipeline.submit_uninstall(&pool, code, ctx)?,
    };
    let result = wait_with_interrupt(&handle)?;
    pool.shutdown();

    let label = match kind {
        JobKind::Install => "install",
        JobKind::Uninstall => "uninstall",
    };
    emit_installation_result(cli, label, &result)
}

/// Wait for a job, cancelling it on SIGINT/SIGTERM.
fn wait_with_interrupt(handle: &JobHandle<InstallationResult>) -> Result<InstallationResult, CliError> {
    let signals = SignalHandler::new();
    let mut cancelled = false;
    loop {
        if !cancelled && signals.should_shutdown() {
            eprintln!("\n[FDP-CLI] interrupt received, cancelling");
            handle.cancel();
            cancelled = true;
        }
        if let Some(result) = handle.wait_timeout(Duration::from_millis(200))? {
            return Ok(result);
        }
    }
}

fn emit_installation_result(cli: &Cli, command: &str, result: &InstallationResult) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            if io::stderr().is_terminal() {
                eprintln!();
            }
            if result.success {
                let version = result
                    .entry
                    .as_ref()
                    .and_then(|e| e.current_version.as_deref())
                    .unwrap_or("-");
                println!(
                    "{} {command} {} ({version})",
                    "ok".green().bold(),
                    result.attempt.entry_code
                );
                if result.restart_required {
                    println!("  {}", "restart required to finish".yellow());
                }
            } else {
                println!(
                    "{} {command} {} at stage {}",
                    "FAILED".red().bold(),
                    result.attempt.entry_code,
                    result.attempt.failed_at.unwrap_or(result.attempt.stage).as_str()
                );
                if let Some(message) = result.error_message() {
                    println!("  {message}");
                }
            }
        }
        OutputMode::Json => {
            let mut payload = result.to_json();
            payload["command"] = json!(command);
            write_json_line(&payload)?;
        }
    }
    if result.success {
        Ok(())
    } else {
        Err(CliError::Failed(format!("{command} failed")))
    }
}

fn print_update_result(result: &UpdateResult) {
    if result.success {
        println!(
            "{} {} {} -> {}",
            "ok".green().bold(),
            result.action,
            result.entry_code,
            result.new_version.as_deref().unwrap_or("-")
        );
        if result.restart_required {
            println!("  {}", "restart required to finish".yellow());
        }
    } else {
        println!(
            "{} {} {}: {}",
            "FAILED".red().bold(),
            result.action,
            result.entry_code,
            result.error_message().unwrap_or_default()
        );
    }
}

fn emit_update_result(cli: &Cli, command: &str, result: &UpdateResult) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            if io::stderr().is_terminal() {
                eprintln!();
            }
            print_update_result(result);
        }
        OutputMode::Json => {
            let mut payload = result.to_json();
            payload["command"] = json!(command);
            write_json_line(&payload)?;
        }
    }
    if result.success {
        Ok(())
    } else {
        Err(CliError::Failed(format!("{command} failed")))
    }
}

fn run_check(cli: &Cli, services: &Services, args: &CheckArgs) -> Result<(), CliError> {
    let now = Utc::now();
    let ctx = RunContext::new(actor(cli));
    let codes: Vec<String> = match &args.code {
        Some(code) => vec![code.clone()],
        None => services
            .catalog
            .query(CatalogQuery::DueForCheck, now)?
            .into_iter()
            .map(|entry| entry.code)
            .collect(),
    };

    let mut rows = Vec::with_capacity(codes.len());
    let mut failures = 0_usize;
    for code in &codes {
        match services.updates.check_for_update(code, &ctx, now) {
            Ok(result) => rows.push(json!({
                "entry": code,
                "update_found": result.update_found,
                "new_version": result.new_version,
                "message": result.message,
            })),
            Err(err) => {
                failures += 1;
                rows.push(json!({ "entry": code, "error_code": err.code(), "error": err.to_string() }));
            }
        }
    }

    match output_mode(cli) {
        OutputMode::Human => {
            if rows.is_empty() {
                println!("No entries are due for an update check.");
            }
            for row in &rows {
                let code = row["entry"].as_str().unwrap_or_default();
                if let Some(error) = row["error"].as_str() {
                    println!("{} {code}: {error}", "error".red());
                } else if row["update_found"].as_bool().unwrap_or(false) {
                    println!("{} {code}: {}", "update".yellow().bold(), row["message"].as_str().unwrap_or_default());
                } else {
                    println!("{} {code}: {}", "ok".green(), row["message"].as_str().unwrap_or_default());
                }
            }
        }
        OutputMode::Json => write_json_line(&json!({ "command": "check", "results": rows }))?,
    }

    if failures == 0 {
        Ok(())
    } else {
        Err(CliError::Failed(format!("{failures} update check(s) failed")))
    }
}

fn run_approve(cli: &Cli, services: &Services, args: &ApproveArgs) -> Result<(), CliError> {
    let admin = services.admin();
    let who = actor(cli);
    let entry = if args.revoke {
        admin.revoke_entry(&args.code, &who, Utc::now())?
    } else {
        admin.approve_entry(&args.code, &who, Utc::now())?
    };
    emit_entry(cli, if args.revoke { "revoke" } else { "approve" }, &entry)
}

fn run_catalog(cli: &Cli, services: &Services, args: &CatalogArgs) -> Result<(), CliError> {
    match &args.command {
        CatalogCommand::Add(add) => {
            let entry = build_entry(add);
            services.admin().add_entry(&entry, &actor(cli))?;
            emit_entry(cli, "catalog add", &entry)
        }
        CatalogCommand::List(list) => {
            let now = Utc::now();
            let entries = match list.filter {
                Some(query) => services.catalog.query(query, now)?,
                None => services.catalog.list()?,
            };
            match output_mode(cli) {
                OutputMode::Human => {
                    if entries.is_empty() {
                        println!("Catalog is empty.");
                    } else {
                        println!(
                            "{:<20} {:<16} {:<10} {:<12} {:<12} UPDATE",
                            "CODE", "KIND", "APPROVED", "INSTALLED", "VERSION"
                        );
                    }
                    for entry in &entries {
                        println!(
                            "{:<20} {:<16} {:<10} {:<12} {:<12} {}",
                            entry.code,
                            entry.kind.as_str(),
                            if entry.is_approved() { "yes" } else { "no" },
                            if entry.is_installed() { "yes" } else { "no" },
                            entry.current_version.as_deref().unwrap_or("-"),
                            update_summary(entry, now)
                        );
                    }
                }
                OutputMode::Json => {
                    let values = entries
                        .iter()
                        .map(serde_json::to_value)
                        .collect::<Result<Vec<Value>, _>>()?;
                    write_json_line(&json!({ "command": "catalog list", "entries": values }))?;
                }
            }
            Ok(())
        }
        CatalogCommand::Show(show) => {
            let entry = services.catalog.require(&show.code)?;
            emit_entry(cli, "catalog show", &entry)
        }
        CatalogCommand::Remove(remove) => {
            services.admin().remove_entry(&remove.code, &actor(cli))?;
            match output_mode(cli) {
                OutputMode::Human => println!("Removed {}.", remove.code),
                OutputMode::Json => write_json_line(&json!({
                    "command": "catalog remove",
                    "entry": remove.code,
                    "removed": true,
                }))?,
            }
            Ok(())
        }
        CatalogCommand::ResetFailures(reset) => {
            let entry = services
                .admin()
                .reset_failures(&reset.code, &actor(cli), Utc::now())?;
            emit_entry(cli, "catalog reset-failures", &entry)
        }
    }
}

fn update_summary(entry: &CatalogEntry, now: chrono::DateTime<Utc>) -> String {
    let Some(pending) = &entry.pending else {
        return "-".to_string();
    };
    let state = update_state(entry, now);
    format!("{} ({state:?})", pending.version)
}

fn build_entry(args: &AddEntryArgs) -> CatalogEntry {
    let mut entry = CatalogEntry::new(
        args.code.clone(),
        args.name.clone(),
        args.kind,
        args.url.clone(),
        Utc::now(),
    );
    entry.current_version.clone_from(&args.version);
    entry.checksum = args.sha256.as_ref().map(|c| c.trim().to_ascii_lowercase());
    entry.category.clone_from(&args.category);
    entry.update_check_url.clone_from(&args.update_url);
    entry.update_policy = args.update_policy;
    entry.update_check_interval_hours = args.check_hours;
    entry.approval_window_hours = args.approval_window_hours;
    entry.signature = SignatureRequirement {
        required: args.require_signature,
        expected_publisher: args.publisher.clone(),
        expected_thumbprint: args.thumbprint.clone(),
    };
    if !args.silent_args.is_empty() {
        entry.silent_args = Some(args.silent_args.clone());
    }
    entry.uninstall_command.clone_from(&args.uninstall_command);
    entry.install_dir.clone_from(&args.install_dir);
    entry.package_ref.clone_from(&args.package);
    entry
}

fn emit_entry(cli: &Cli, command: &str, entry: &CatalogEntry) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            let now = Utc::now();
            println!("{} ({})", entry.name.bold(), entry.code);
            println!("  kind:        {}", entry.kind);
            println!("  source:      {}", entry.download_url);
            println!(
                "  approved:    {}",
                entry
                    .approval
                    .as_ref()
                    .map_or_else(|| "no".to_string(), |a| format!("by {} at {}", a.approved_by, a.approved_at.to_rfc3339()))
            );
            println!(
                "  installed:   {}",
                entry
                    .installed_at
                    .map_or_else(|| "no".to_string(), |at| at.to_rfc3339())
            );
            println!("  version:     {}", entry.current_version.as_deref().unwrap_or("-"));
            println!("  updates:     {} ({})", entry.update_policy, update_summary(entry, now));
            if let Some(previous) = &entry.previous {
                println!("  rollback to: {}", previous.version);
            }
            if entry.failure_count > 0 {
                println!(
                    "  failures:    {} ({})",
                    entry.failure_count.to_string().red(),
                    entry.last_error.as_deref().unwrap_or("")
                );
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": command,
                "entry": serde_json::to_value(entry)?,
            }))?;
        }
    }
    Ok(())
}

fn run_policy(cli: &Cli, services: &Services, args: &PolicyArgs) -> Result<(), CliError> {
    let admin = services.admin();
    match &args.command {
        PolicyCommand::Add(add) => {
            let direction = if add.deny { Direction::Deny } else { Direction::Allow };
            let mut policy = SourcePolicy::new(add.pattern.clone(), direction, add.priority);
            policy.description.clone_from(&add.description);
            policy.id = admin.add_policy(&policy, &actor(cli))?;
            emit_policies(cli, "policy add", std::slice::from_ref(&policy))
        }
        PolicyCommand::List => {
            let mut policies = services.policies.list()?;
            policies.sort_by_key(|p| (p.priority, p.id));
            emit_policies(cli, "policy list", &policies)
        }
        PolicyCommand::Eval { url } => {
            let decision = services.policy_engine.evaluate(url)?;
            match output_mode(cli) {
                OutputMode::Human => match &decision {
                    PolicyDecision::Allowed { matched_policy } => println!(
                        "{} {url} ({})",
                        "allowed".green().bold(),
                        matched_policy.as_deref().unwrap_or("no rule matched")
                    ),
                    PolicyDecision::Denied {
                        reason,
                        matched_policy,
                    } => println!(
                        "{} {url}: {reason} ({})",
                        "denied".red().bold(),
                        matched_policy.as_deref().unwrap_or("-")
                    ),
                },
                OutputMode::Json => write_json_line(&json!({
                    "command": "policy eval",
                    "url": url,
                    "result": serde_json::to_value(&decision)?,
                }))?,
            }
            Ok(())
        }
        PolicyCommand::Remove { id } => {
            admin.remove_policy(*id, &actor(cli))?;
            match output_mode(cli) {
                OutputMode::Human => println!("Removed policy #{id}."),
                OutputMode::Json => write_json_line(&json!({
                    "command": "policy remove",
                    "id": id,
                    "removed": true,
                }))?,
            }
            Ok(())
        }
        PolicyCommand::Enable { id } | PolicyCommand::Disable { id } => {
            let active = matches!(args.command, PolicyCommand::Enable { .. });
            let policy = admin.set_policy_active(*id, active, &actor(cli))?;
            emit_policies(
                cli,
                if active { "policy enable" } else { "policy disable" },
                std::slice::from_ref(&policy),
            )
        }
    }
}

fn emit_policies(cli: &Cli, command: &str, policies: &[SourcePolicy]) -> Result<(), CliError> {
    match output_mode(cli) {
        OutputMode::Human => {
            if policies.is_empty() {
                println!("No source policies; every source is allowed.");
                return Ok(());
            }
            println!("{:>5} {:>8} {:<6} {:<7} PATTERN", "ID", "PRIORITY", "RULE", "ACTIVE");
            for policy in policies {
                let direction = match policy.direction {
                    Direction::Allow => policy.direction.as_str().green(),
                    Direction::Deny => policy.direction.as_str().red(),
                };
                println!(
                    "{:>5} {:>8} {:<6} {:<7} {}{}",
                    policy.id,
                    policy.priority,
                    direction,
                    if policy.active { "yes" } else { "no" },
                    policy.pattern,
                    policy
                        .description
                        .as_deref()
                        .map(|d| format!("  # {d}"))
                        .unwrap_or_default()
                );
            }
        }
        OutputMode::Json => {
            write_json_line(&json!({
                "command": command,
                "policies": serde_json::to_value(policies)?,
            }))?;
        }
    }
    Ok(())
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();
            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config path",
                    "path": path.to_string_lossy(),
                    "exists": exists,
                }))?,
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;
            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Runtime(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => write_json_line(&json!({
                    "command": "config show",
                    "config": serde_json::to_value(&config)?,
                }))?,
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;
                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": true,
                        "path": config.paths.config_file.to_string_lossy(),
                        "hash": hash,
                    }))?,
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => write_json_line(&json!({
                        "command": "config validate",
                        "valid": false,
                        "error": e.to_string(),
                    }))?,
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

fn parse_kind(raw: &str) -> Result<InstallerKind, String> {
    raw.parse().map_err(|e: DeployError| e.to_string())
}

fn parse_update_policy(raw: &str) -> Result<UpdatePolicy, String> {
    raw.parse().map_err(|e: DeployError| e.to_string())
}

fn parse_query(raw: &str) -> Result<CatalogQuery, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "approved" => Ok(CatalogQuery::Approved),
        "installed" => Ok(CatalogQuery::Installed),
        "pending" | "update-pending" => Ok(CatalogQuery::UpdatePending),
        "rollback" | "rollback-available" => Ok(CatalogQuery::RollbackAvailable),
        "due" | "due-for-check" => Ok(CatalogQuery::DueForCheck),
        "expired" | "expired-approval" => Ok(CatalogQuery::ExpiredApproval),
        other => Err(format!(
            "unknown filter {other:?}; expected approved, installed, pending, rollback, due or expired"
        )),
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("FDP_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
