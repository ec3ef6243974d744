//! Artifact acquisition: per-run temp workspaces, curl downloads, local copies.

#![allow(missing_docs)]

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::{DeployError, Result};
use crate::core::network::ProxySettings;
use crate::core::paths::{SourceLocation, classify_source, source_file_name};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::process::{ProcessSpec, ProcessSupervisor};

const COPY_CHUNK: usize = 64 * 1024;
/// curl's "operation timed out" exit status.
const CURL_TIMEOUT_EXIT: i32 = 28;

/// Byte-count callback: `(downloaded, total)`.
pub type ByteProgress<'a> = &'a mut dyn FnMut(u64, Option<u64>);

/// Fetches an artifact to a local file.
pub trait ArtifactFetcher: Send + Sync {
    /// Write `source` to `dest` and return the number of bytes written.
    fn fetch(
        &self,
        source: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: ByteProgress<'_>,
    ) -> Result<u64>;
}

/// Private directory for one pipeline run, removed on drop.
#[derive(Debug)]
pub struct TempWorkspace {
    dir: PathBuf,
}

impl TempWorkspace {
    /// Create `<root>/run-<code>-<random>` with owner-only permissions.
    pub fn create(root: &Path, entry_code: &str) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| DeployError::io(root, e))?;
        let safe: String = entry_code
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        for _ in 0..8 {
            let dir = root.join(format!("run-{safe}-{:08x}", rand::random::<u32>()));
            match fs::create_dir(&dir) {
                Ok(()) => {
                    restrict_permissions(&dir)?;
                    return Ok(Self { dir });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(DeployError::io(&dir, e)),
            }
        }
        Err(DeployError::Runtime {
            details: format!("could not allocate a temp workspace under {}", root.display()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Destination path for the artifact fetched from `source`.
    #[must_use]
    pub fn artifact_path(&self, source: &str) -> PathBuf {
        self.dir.join(source_file_name(source))
    }
}

impl Drop for TempWorkspace {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir)
            && e.kind() != ErrorKind::NotFound
        {
            eprintln!(
                "[FDP-PIPELINE] failed to remove temp workspace {}: {e}",
                self.dir.display()
            );
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(|e| DeployError::io(dir, e))
}

#[cfg(not(unix))]
fn restrict_permissions(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Downloads over HTTP(S) with curl and stream-copies local or UNC sources.
#[derive(Debug, Clone)]
pub struct CurlFetcher {
    program: String,
    connect_timeout: Duration,
    max_time: Duration,
    proxy: ProxySettings,
    supervisor: ProcessSupervisor,
}

impl CurlFetcher {
    #[must_use]
    pub fn new(
        program: impl Into<String>,
        connect_timeout: Duration,
        max_time: Duration,
        proxy: ProxySettings,
        supervisor: ProcessSupervisor,
    ) -> Self {
        Self {
            program: program.into(),
            connect_timeout,
            max_time,
            proxy,
            supervisor,
        }
    }

    fn base_args(&self, url: &str) -> Vec<String> {
        let mut args = vec![
            "-fsSL".to_string(),
            "--connect-timeout".to_string(),
            self.connect_timeout.as_secs().to_string(),
            "--max-time".to_string(),
            self.max_time.as_secs().to_string(),
        ];
        match self.proxy.proxy_for(url) {
            Some(proxy) => {
                args.push("--proxy".to_string());
                args.push(proxy.to_string());
            }
            // Configured proxy, but this host is on the bypass list.
            None if self.proxy.url.is_some() => {
                args.push("--noproxy".to_string());
                args.push("*".to_string());
            }
            None => {}
        }
        args
    }

    /// Best-effort `Content-Length` from a HEAD request.
    fn probe_length(&self, url: &str, cancel: &CancellationToken) -> Option<u64> {
        let mut args = self.base_args(url);
        args.push("-I".to_string());
        args.push(url.to_string());
        let spec = ProcessSpec::new(
            self.program.clone(),
            args,
            self.connect_timeout * 2,
            "downloading",
        );
        let output = self.supervisor.run(&spec, cancel).ok()?;
        if output.exit_code != 0 {
            return None;
        }
        parse_content_length(&output.stdout)
    }

    /// GET `url` and return the body as text. Used for update feeds.
    pub fn fetch_text(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        let mut args = self.base_args(url);
        args.push(url.to_string());
        let spec = ProcessSpec::new(self.program.clone(), args, self.max_time, "checking");
        let output = self.supervisor.run(&spec, cancel).map_err(|e| self.launch_failure(url, e))?;
        self.check_exit(url, output.exit_code, &output.stderr)?;
        Ok(output.stdout)
    }

    fn check_exit(&self, url: &str, exit_code: i32, stderr: &str) -> Result<()> {
        match exit_code {
            0 => Ok(()),
            CURL_TIMEOUT_EXIT => Err(DeployError::ProcessTimeout {
                program: self.program.clone(),
                timeout: self.max_time,
            }),
            code => Err(DeployError::Network {
                url: url.to_string(),
                details: format!("{} exited with code {code}: {}", self.program, stderr.trim()),
            }),
        }
    }

    fn launch_failure(&self, url: &str, err: DeployError) -> DeployError {
        match err {
            DeployError::ProcessLaunch { details, .. } => DeployError::Network {
                url: url.to_string(),
                details: format!("{} unavailable: {details}", self.program),
            },
            other => other,
        }
    }

    fn fetch_remote(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: ByteProgress<'_>,
    ) -> Result<u64> {
        let total = self.probe_length(url, cancel);
        cancel.check("downloading")?;
        progress(0, total);

        let mut args = self.base_args(url);
        args.push("-o".to_string());
        args.push(dest.to_string_lossy().into_owned());
        args.push(url.to_string());
        let spec = ProcessSpec::new(
            self.program.clone(),
            args,
            self.max_time + self.connect_timeout,
            "downloading",
        );

        let mut last_seen = 0_u64;
        let output = self
            .supervisor
            .run_observed(&spec, cancel, &mut || {
                if let Ok(meta) = fs::metadata(dest)
                    && meta.len() != last_seen
                {
                    last_seen = meta.len();
                    progress(last_seen, total);
                }
            })
            .map_err(|e| self.launch_failure(url, e))?;
        self.check_exit(url, output.exit_code, &output.stderr)?;

        let written = fs::metadata(dest).map_err(|e| DeployError::io(dest, e))?.len();
        progress(written, total.or(Some(written)));
        Ok(written)
    }
}

impl ArtifactFetcher for CurlFetcher {
    fn fetch(
        &self,
        source: &str,
        dest: &Path,
        cancel: &CancellationToken,
        progress: ByteProgress<'_>,
    ) -> Result<u64> {
        match classify_source(source) {
            Some(SourceLocation::Remote(url)) => self.fetch_remote(&url, dest, cancel, progress),
            Some(SourceLocation::Local(path)) => copy_local(&path, dest, cancel, progress),
            None => Err(DeployError::SourceDenied {
                url: source.to_string(),
                reason: "unsupported source scheme".to_string(),
                policy: None,
            }),
        }
    }
}

/// Stream-copy a local or UNC file in fixed-size chunks, checking for cancellation.
pub fn copy_local(
    source: &Path,
    dest: &Path,
    cancel: &CancellationToken,
    progress: ByteProgress<'_>,
) -> Result<u64> {
    let input = File::open(source).map_err(|e| DeployError::io(source, e))?;
    let total = input.metadata().ok().map(|m| m.len());
    let mut reader = BufReader::with_capacity(COPY_CHUNK, input);
    let mut writer =
        BufWriter::new(File::create(dest).map_err(|e| DeployError::io(dest, e))?);
    let mut buf = vec![0_u8; COPY_CHUNK];
    let mut copied = 0_u64;
    progress(0, total);
    loop {
        cancel.check("downloading")?;
        let n = reader.read(&mut buf).map_err(|e| DeployError::io(source, e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| DeployError::io(dest, e))?;
        copied += n as u64;
        progress(copied, total);
    }
    writer.flush().map_err(|e| DeployError::io(dest, e))?;
    Ok(copied)
}

/// Last `Content-Length` header in a (possibly redirected) header dump.
fn parse_content_length(headers: &str) -> Option<u64> {
    headers
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<u64>().ok())
                .flatten()
        })
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_private_and_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = TempWorkspace::create(root.path(), "my app").unwrap();
            assert!(ws.path().is_dir());
            assert!(
                ws.path()
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("run-my_app-")
            );
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = fs::metadata(ws.path()).unwrap().permissions().mode();
                assert_eq!(mode & 0o777, 0o700);
            }
            fs::write(ws.artifact_path("https://x.test/dl/setup.exe?sig=1"), b"x").unwrap();
            assert!(ws.path().join("setup.exe").exists());
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn two_workspaces_never_share_a_directory() {
        let root = tempfile::tempdir().unwrap();
        let a = TempWorkspace::create(root.path(), "app").unwrap();
        let b = TempWorkspace::create(root.path(), "app").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn local_copy_reports_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dest = dir.path().join("dest.bin");
        fs::write(&src, vec![1_u8; COPY_CHUNK * 2 + 5]).unwrap();
        let mut seen = Vec::new();
        let n = copy_local(&src, &dest, &CancellationToken::new(), &mut |done, total| {
            seen.push((done, total));
        })
        .unwrap();
        assert_eq!(n, (COPY_CHUNK * 2 + 5) as u64);
        assert_eq!(fs::read(&dest).unwrap().len(), COPY_CHUNK * 2 + 5);
        assert_eq!(seen.last().copied(), Some((n, Some(n))));
    }

    #[test]
    fn cancelled_copy_stops() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"payload").unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = copy_local(&src, &dir.path().join("d"), &token, &mut |_, _| {}).unwrap_err();
        assert_eq!(err.code(), "FDP-4002");
    }

    #[test]
    fn fetcher_handles_file_urls_and_rejects_other_schemes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tool.msi");
        fs::write(&src, b"msi").unwrap();
        let fetcher = CurlFetcher::new(
            "curl",
            Duration::from_secs(5),
            Duration::from_secs(5),
            ProxySettings::default(),
            ProcessSupervisor::new(),
        );
        let dest = dir.path().join("out.msi");
        let url = format!("file://{}", src.display());
        let n = fetcher
            .fetch(&url, &dest, &CancellationToken::new(), &mut |_, _| {})
            .unwrap();
        assert_eq!(n, 3);

        let err = fetcher
            .fetch("ftp://x/y", &dest, &CancellationToken::new(), &mut |_, _| {})
            .unwrap_err();
        assert_eq!(err.code(), "FDP-2002");
    }

    #[test]
    fn content_length_uses_final_response() {
        let headers = "HTTP/1.1 302 Found\r\nContent-Length: 0\r\nLocation: x\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 1234\r\n";
        assert_eq!(parse_content_length(headers), Some(1234));
        assert_eq!(parse_content_length("HTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn proxy_flags_follow_no_proxy() {
        let fetcher = CurlFetcher::new(
            "curl",
            Duration::from_secs(5),
            Duration::from_secs(60),
            ProxySettings {
                url: Some("http://proxy:3128".to_string()),
                no_proxy: vec!["internal.corp".to_string()],
            },
            ProcessSupervisor::new(),
        );
        let args = fetcher.base_args("https://dl.vendor.com/a.exe");
        assert!(args.windows(2).any(|w| w[0] == "--proxy" && w[1] == "http://proxy:3128"));
        let args = fetcher.base_args("https://files.internal.corp/a.exe");
        assert!(args.windows(2).any(|w| w[0] == "--noproxy" && w[1] == "*"));
        assert!(args.windows(2).any(|w| w[0] == "--max-time" && w[1] == "60"));
    }
}
