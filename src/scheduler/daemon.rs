//! `fdeploy daemon`: run the update scheduler until a shutdown signal arrives.

#![allow(missing_docs)]

use std::thread;
use std::time::Duration;

use crate::core::errors::Result;
use crate::logger::audit::{AuditAction, AuditRecord};
use crate::runtime::Services;
use crate::scheduler::signals::{ShutdownCoordinator, SignalHandler};

const DAEMON_ACTOR: &str = "system:daemon";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Block until `signals` asks for shutdown, driving the scheduler meanwhile.
pub fn run_daemon(services: &Services, signals: &SignalHandler) -> Result<()> {
    let config_hash = services.config.stable_hash().unwrap_or_default();
    services.audit.log(AuditRecord::new(
        AuditAction::DaemonStart,
        DAEMON_ACTOR,
        format!(
            "fdeploy {} started (config {config_hash}, tick every {}s)",
            env!("CARGO_PKG_VERSION"),
            services.config.scheduler.tick_interval_secs
        ),
    ));

    let handle = if services.config.scheduler.enabled {
        let interval = Duration::from_secs(services.config.scheduler.tick_interval_secs.max(1));
        Some(services.scheduler().spawn(interval)?)
    } else {
        eprintln!("[FDP-DAEMON] scheduler disabled by config; waiting for shutdown");
        None
    };

    loop {
        if signals.should_shutdown() {
            eprintln!("[FDP-DAEMON] shutdown requested");
            break;
        }
        if signals.should_tick()
            && let Some(handle) = &handle
        {
            handle.trigger();
        }
        thread::sleep(POLL_INTERVAL);
    }

    let mut handle = handle;
    let mut stop_scheduler = || {
        if let Some(handle) = handle.take() {
            handle.stop();
        }
        true
    };
    let clean = ShutdownCoordinator::new().execute(&mut [("scheduler", &mut stop_scheduler)]);

    services.audit.log(AuditRecord::new(
        AuditAction::DaemonStop,
        DAEMON_ACTOR,
        if clean {
            "fdeploy stopped".to_string()
        } else {
            "fdeploy stopped with shutdown errors".to_string()
        },
    ));
    Ok(())
}
