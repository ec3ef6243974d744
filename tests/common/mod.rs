#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use fleet_deploy::catalog::entry::{Approval, CatalogEntry, InstallerKind};
use fleet_deploy::catalog::locks::EntryLocks;
use fleet_deploy::catalog::store::{CatalogRepository, MemoryCatalog, MemoryPolicies};
use fleet_deploy::core::config::{Config, InstallerTemplate};
use fleet_deploy::core::errors::{DeployError, Result};
use fleet_deploy::logger::audit::{AuditAction, AuditRecord, MemoryAuditSink};
use fleet_deploy::pipeline::cancel::CancellationToken;
use fleet_deploy::pipeline::download::{ArtifactFetcher, ByteProgress};
use fleet_deploy::runtime::{Collaborators, Services};
use fleet_deploy::updates::checker::UpdateFeed;
use fleet_deploy::verify::scan::{MalwareScanner, ScanReport};
use fleet_deploy::verify::signature::{SignatureInfo, SignatureInspector};

// ---------------------------------------------------------------------------
// CLI runner
// ---------------------------------------------------------------------------

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_fdeploy") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "fdeploy.exe" } else { "fdeploy" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve fdeploy binary path for integration test"),
    }
}

/// Run the CLI with `home` as its isolated HOME and data directory.
pub fn run_cli_case(case_name: &str, home: &Path, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("fdeploy-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("HOME", home)
        .env("FDP_PATHS_CATALOG_DB", home.join("catalog.sqlite3"))
        .env("FDP_PATHS_AUDIT_JSONL", home.join("audit.jsonl"))
        .env("FDP_PIPELINE_TEMP_ROOT", home.join("tmp"))
        .env("FDP_SCANNER_ENABLED", "false")
        .env_remove("FDP_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute fdeploy command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Serves registered artifacts from memory and counts every fetch.
#[derive(Default)]
pub struct CountingFetcher {
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
    calls: AtomicUsize,
}

impl CountingFetcher {
    pub fn serve(&self, url: &str, body: &[u8]) {
        self.artifacts.lock().insert(url.to_string(), body.to_vec());
    }

    pub fn withdraw(&self, url: &str) {
        self.artifacts.lock().remove(url);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ArtifactFetcher for CountingFetcher {
    fn fetch(
        &self,
        source: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: ByteProgress<'_>,
    ) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cancel.check("downloading")?;
        let body = self
            .artifacts
            .lock()
            .get(source)
            .cloned()
            .ok_or_else(|| DeployError::Network {
                url: source.to_string(),
                details: "404 not found".to_string(),
            })?;
        fs::write(dest, &body).map_err(|e| DeployError::io(dest, e))?;
        let len = body.len() as u64;
        progress(len / 2, Some(len));
        progress(len, Some(len));
        Ok(len)
    }
}

/// Returns a fixed signature report.
pub struct ScriptedInspector {
    info: Mutex<SignatureInfo>,
    calls: AtomicUsize,
}

impl ScriptedInspector {
    pub fn signed_by(signer: &str) -> Self {
        Self {
            info: Mutex::new(SignatureInfo {
                signed: true,
                valid: true,
                signer: Some(signer.to_string()),
                issuer: Some("CN=Example Root CA".to_string()),
                thumbprint: Some("AB12CD34".to_string()),
                ..SignatureInfo::default()
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, info: SignatureInfo) {
        *self.info.lock() = info;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SignatureInspector for ScriptedInspector {
    fn inspect(&self, _path: &Path, cancel: &CancellationToken) -> Result<SignatureInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cancel.check("signature")?;
        Ok(self.info.lock().clone())
    }
}

/// Returns a fixed scan report.
pub struct ScriptedScanner {
    report: Mutex<ScanReport>,
    calls: AtomicUsize,
}

impl ScriptedScanner {
    pub fn clean() -> Self {
        Self {
            report: Mutex::new(ScanReport {
                completed: true,
                scanner_id: "fake-av".to_string(),
                ..ScanReport::default()
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, report: ScanReport) {
        *self.report.lock() = report;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MalwareScanner for ScriptedScanner {
    fn scan(&self, _path: &Path, cancel: &CancellationToken) -> Result<ScanReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cancel.check("scanning")?;
        Ok(self.report.lock().clone())
    }
}

/// Update feed answering from a URL → body table.
#[derive(Default)]
pub struct StaticFeed {
    bodies: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl StaticFeed {
    pub fn publish(&self, url: &str, body: &str) {
        self.bodies.lock().insert(url.to_string(), body.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl UpdateFeed for StaticFeed {
    fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cancel.check("update check")?;
        self.bodies
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| DeployError::Network {
                url: url.to_string(),
                details: "connection refused".to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub const SIGNER: &str = "CN=Example Corp, O=Example Corp, C=US";

/// Shell exit status treated as "restart required"; Unix statuses are 8-bit,
/// so the scripts cannot return 3010 itself.
pub const SCRIPT_RESTART_CODE: i32 = 10;

pub struct Harness {
    pub services: Services,
    pub catalog: Arc<MemoryCatalog>,
    pub policies: Arc<MemoryPolicies>,
    pub audit: Arc<MemoryAuditSink>,
    pub fetcher: Arc<CountingFetcher>,
    pub inspector: Arc<ScriptedInspector>,
    pub scanner: Arc<ScriptedScanner>,
    pub feed: Arc<StaticFeed>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Installers run the downloaded artifact with `sh`.
    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let feed = Arc::new(StaticFeed::default());
        Self::build(tweak, Arc::clone(&feed) as Arc<dyn UpdateFeed>, feed)
    }

    /// Like [`Harness::with_config`] with a caller-supplied update feed.
    pub fn with_feed(feed: Arc<dyn UpdateFeed>) -> Self {
        Self::build(|_| {}, feed, Arc::new(StaticFeed::default()))
    }

    fn build(tweak: impl FnOnce(&mut Config), feed: Arc<dyn UpdateFeed>, static_feed: Arc<StaticFeed>) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut config = Config::default();
        config.pipeline.temp_root = dir.path().join("tmp");
        config.pipeline.restart_exit_codes = vec![3010, SCRIPT_RESTART_CODE];
        config.pipeline.install_timeout_secs = 30;
        config.pipeline.worker_threads = 2;
        config.installers.executable = InstallerTemplate {
            program: "sh".to_string(),
            args: vec!["{artifact}".to_string()],
            uninstall_program: String::new(),
            uninstall_args: Vec::new(),
        };
        config.installers.package_manager = InstallerTemplate {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "case {package} in org.example.*) exit 0;; *) exit 9;; esac".to_string(),
            ],
            uninstall_program: "sh".to_string(),
            uninstall_args: vec!["-c".to_string(), "exit 0".to_string()],
        };
        config.paths.catalog_db = dir.path().join("catalog.sqlite3");
        config.paths.audit_jsonl = dir.path().join("audit.jsonl");
        config.paths.lease_dir = dir.path().join("leases");
        tweak(&mut config);

        let catalog = Arc::new(MemoryCatalog::new());
        let policies = Arc::new(MemoryPolicies::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let fetcher = Arc::new(CountingFetcher::default());
        let inspector = Arc::new(ScriptedInspector::signed_by(SIGNER));
        let scanner = Arc::new(ScriptedScanner::clean());

        let parts = Collaborators {
            catalog: catalog.clone(),
            policies: policies.clone(),
            audit: audit.clone(),
            inspector: inspector.clone(),
            scanner: scanner.clone(),
            fetcher: fetcher.clone(),
            feed,
            locks: EntryLocks::with_lease_dir(config.paths.lease_dir.clone()),
        };
        let services = Services::assemble(config, parts).expect("assemble services");
        Self {
            services,
            catalog,
            policies,
            audit,
            fetcher,
            inspector,
            scanner,
            feed: static_feed,
            dir,
        }
    }

    pub fn temp_root(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }

    /// Run workspaces left behind under the temp root.
    pub fn leftover_workspaces(&self) -> usize {
        fs::read_dir(self.temp_root()).map_or(0, Iterator::count)
    }

    /// Serve `script` at the URL for `code`/`version` and return (url, sha256).
    pub fn publish_script(&self, code: &str, version: &str, script: &str) -> (String, String) {
        let url = artifact_url(code, version);
        self.fetcher.serve(&url, script.as_bytes());
        (url, sha256_hex(script.as_bytes()))
    }

    /// Approved executable entry whose installer is `script`.
    pub fn add_script_entry(&self, code: &str, version: &str, script: &str) -> CatalogEntry {
        let (url, digest) = self.publish_script(code, version, script);
        let mut entry = CatalogEntry::new(code, code.to_uppercase(), InstallerKind::Executable, url, Utc::now());
        entry.current_version = Some(version.to_string());
        entry.checksum = Some(digest);
        entry.approval = Some(Approval::new("admin", Utc::now()));
        self.catalog.insert(&entry).expect("insert entry");
        entry
    }

    pub fn entry(&self, code: &str) -> CatalogEntry {
        self.catalog.require(code).expect("entry exists")
    }

    pub fn records(&self, action: AuditAction) -> Vec<AuditRecord> {
        self.audit
            .records()
            .into_iter()
            .filter(|r| r.action == action)
            .collect()
    }
}

pub fn artifact_url(code: &str, version: &str) -> String {
    format!("https://dl.example.com/{code}/{code}-{version}.sh")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
