//! Supervised external processes: timeout, cancellation, and captured output.
//!
//! Every external tool the pipeline runs (download tool, signature inspector,
//! malware scanner, installer) goes through `ProcessSupervisor::run`. The child
//! is polled with `try_wait`. On Unix each child leads its own process group;
//! on timeout or cancellation the whole group gets SIGTERM, a short grace
//! period, then SIGKILL, so helpers spawned by installer wrappers die with it.
//! Output pipes are drained on helper threads so a chatty child cannot block
//! on a full pipe.

#![allow(missing_docs)]

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::errors::{DeployError, Result};
use crate::pipeline::cancel::CancellationToken;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    /// Stage name reported when the run is cancelled.
    pub stage: String,
}

impl ProcessSpec {
    #[must_use]
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            timeout,
            stage: stage.into(),
        }
    }
}

/// Finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `-1` when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    #[must_use]
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Runs child processes under a deadline and a cancellation token.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSupervisor {
    poll_interval: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run to completion. Non-zero exits are returned, not turned into errors.
    pub fn run(&self, spec: &ProcessSpec, cancel: &CancellationToken) -> Result<ProcessOutput> {
        self.run_observed(spec, cancel, &mut || {})
    }

    /// Like `run`, calling `observe` on every poll (used for download progress).
    pub fn run_observed(
        &self,
        spec: &ProcessSpec,
        cancel: &CancellationToken,
        observe: &mut dyn FnMut(),
    ) -> Result<ProcessOutput> {
        cancel.check(&spec.stage)?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| DeployError::ProcessLaunch {
            program: spec.program.clone(),
            details: e.to_string(),
        })?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    terminate(&mut child);
                    return Err(DeployError::ProcessLaunch {
                        program: spec.program.clone(),
                        details: format!("wait failed: {e}"),
                    });
                }
            }
            if cancel.is_cancelled() {
                terminate(&mut child);
                return Err(DeployError::cancelled(spec.stage.clone()));
            }
            if started.elapsed() >= spec.timeout {
                terminate(&mut child);
                return Err(DeployError::ProcessTimeout {
                    program: spec.program.clone(),
                    timeout: spec.timeout,
                });
            }
            observe();
            thread::sleep(self.poll_interval);
        };

        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: collect(stdout),
            stderr: collect(stderr),
            duration: started.elapsed(),
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<String>> {
    let mut pipe = pipe?;
    thread::Builder::new()
        .name("fdp-pipe".to_string())
        .spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
        .ok()
}

fn collect(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// SIGTERM to the child's process group, grace period, then SIGKILL to the
/// group. Always reaps the child.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(child.id()) else {
        let _ = child.kill();
        let _ = child.wait();
        return;
    };
    let group = Pid::from_raw(raw);
    let _ = killpg(group, Signal::SIGTERM);
    let deadline = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            break;
        }
        thread::sleep(DEFAULT_POLL_INTERVAL);
    }
    // Stragglers that outlived the leader or ignored SIGTERM. ESRCH means none are left.
    let _ = killpg(group, Signal::SIGKILL);
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = TERMINATE_GRACE;
    let _ = child.kill();
    let _ = child.wait();
}
