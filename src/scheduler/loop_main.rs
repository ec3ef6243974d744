//! Periodic update driver.
//!
//! One tick runs three phases in order: update checks for due entries, the
//! approval-expiry sweep, then auto-update dispatch. Ticks are single-flight;
//! a tick requested while another is running is skipped, not queued.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Sender, bounded, select, tick};
use serde_json::{Value, json};

use crate::catalog::store::{CatalogQuery, CatalogRepository};
use crate::core::errors::{DeployError, Result};
use crate::pipeline::cancel::CancellationToken;
use crate::pipeline::runner::RunContext;
use crate::updates::service::{UpdateManager, UpdateResult};

/// Actor recorded on everything the scheduler does.
pub const SCHEDULER_ACTOR: &str = "system:scheduler";

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub checked: Vec<String>,
    pub updates_found: Vec<String>,
    pub check_failures: Vec<(String, String)>,
    pub expired: Vec<String>,
    pub dispatched: Vec<UpdateResult>,
}

impl TickReport {
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "checked": self.checked,
            "updates_found": self.updates_found,
            "check_failures": self
                .check_failures
                .iter()
                .map(|(code, error)| json!({ "entry": code, "error": error }))
                .collect::<Vec<_>>(),
            "expired": self.expired,
            "dispatched": self.dispatched.iter().map(UpdateResult::to_json).collect::<Vec<_>>(),
        })
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct UpdateScheduler {
    manager: Arc<UpdateManager>,
    catalog: Arc<dyn CatalogRepository>,
    in_flight: AtomicBool,
    cancel: CancellationToken,
}

impl UpdateScheduler {
    #[must_use]
    pub fn new(manager: Arc<UpdateManager>, catalog: Arc<dyn CatalogRepository>) -> Self {
        Self {
            manager,
            catalog,
            in_flight: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn is_ticking(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Cancel whatever the current tick is running and refuse further work.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run one tick. `Ok(None)` when another tick is already in flight.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Option<TickReport>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }
        let _in_flight = InFlight(&self.in_flight);
        let ctx = RunContext::new(SCHEDULER_ACTOR).with_cancel(self.cancel.clone());
        let mut report = TickReport::default();

        // Phase 1: update checks.
        for entry in self.catalog.query(CatalogQuery::DueForCheck, now)? {
            if self.cancel.is_cancelled() {
                return Ok(Some(report));
            }
            match self.manager.check_for_update(&entry.code, &ctx, now) {
                Ok(result) => {
                    if result.update_found {
                        report.updates_found.push(entry.code.clone());
                    }
                    report.checked.push(entry.code);
                }
                // Busy entries are checked on a later tick.
                Err(DeployError::EntryBusy { .. }) => {}
                Err(err) => {
                    eprintln!("[FDP-SCHEDULER] update check for {} failed: {err}", entry.code);
                    report.check_failures.push((entry.code, err.to_string()));
                }
            }
        }

        // Phase 2: approval expiry.
        report.expired = self.manager.sweep_expired_approvals(SCHEDULER_ACTOR, now)?;

        // Phase 3: auto-update dispatch.
        if !self.cancel.is_cancelled() {
            report.dispatched = self.manager.dispatch_auto_updates(&ctx, now)?;
        }
        Ok(Some(report))
    }

    /// Start the driver thread: one tick at start, then every `interval`.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> Result<SchedulerHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (trigger_tx, trigger_rx) = bounded::<()>(1);
        let scheduler = Arc::clone(self);
        let join = thread::Builder::new()
            .name("fdp-scheduler".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                scheduler.run_tick();
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => scheduler.run_tick(),
                        recv(trigger_rx) -> _ => scheduler.run_tick(),
                    }
                }
            })
            .map_err(|e| DeployError::Runtime {
                details: format!("failed to spawn scheduler thread: {e}"),
            })?;
        Ok(SchedulerHandle {
            scheduler: Arc::clone(self),
            stop_tx,
            trigger_tx,
            join: Some(join),
        })
    }

    fn run_tick(&self) {
        match self.tick(Utc::now()) {
            Ok(Some(report)) => eprintln!(
                "[FDP-SCHEDULER] tick: checked={} found={} expired={} dispatched={}",
                report.checked.len(),
                report.updates_found.len(),
                report.expired.len(),
                report.dispatched.len()
            ),
            Ok(None) => eprintln!("[FDP-SCHEDULER] previous tick still running, skipped"),
            Err(err) => eprintln!("[FDP-SCHEDULER] tick failed: {err}"),
        }
    }
}

/// Controls a running driver thread.
pub struct SchedulerHandle {
    scheduler: Arc<UpdateScheduler>,
    stop_tx: Sender<()>,
    trigger_tx: Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Ask for an immediate tick. Coalesces with an already pending request.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Cancel in-flight work, stop the thread and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.scheduler.cancel();
        let _ = self.stop_tx.try_send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
