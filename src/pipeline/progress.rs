//! Fractional progress reporting.
//!
//! A run's progress is split into fixed bands: 0-5% prepare, 5-60% download,
//! 60-70% verification, 70-95% execution, 95-100% commit. `ProgressReporter`
//! maps a position inside a band to the overall fraction and never reports a
//! value lower than one it already reported.

#![allow(missing_docs)]

use std::sync::Arc;

use parking_lot::Mutex;

use crate::pipeline::attempt::Stage;

/// Coarse phase of a run, each owning a slice of the 0..=1 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Prepare,
    Download,
    Verify,
    Execute,
    Commit,
}

impl Band {
    #[must_use]
    pub const fn range(self) -> (f64, f64) {
        match self {
            Self::Prepare => (0.0, 0.05),
            Self::Download => (0.05, 0.60),
            Self::Verify => (0.60, 0.70),
            Self::Execute => (0.70, 0.95),
            Self::Commit => (0.95, 1.0),
        }
    }

    /// Overall fraction for position `within` (0..=1) inside this band.
    #[must_use]
    pub fn at(self, within: f64) -> f64 {
        let (lo, hi) = self.range();
        let within = if within.is_finite() {
            within.clamp(0.0, 1.0)
        } else {
            0.0
        };
        (hi - lo).mul_add(within, lo)
    }
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub entry_code: String,
    pub stage: Stage,
    pub fraction: f64,
    pub message: String,
}

/// Caller-supplied progress destination.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: &ProgressUpdate) {
        self(update);
    }
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn report(&self, _update: &ProgressUpdate) {}
}

/// Keeps every update; used by tests and by callers that poll.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl RecordingProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<ProgressUpdate> {
        self.updates.lock().last().cloned()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, update: &ProgressUpdate) {
        self.updates.lock().push(update.clone());
    }
}

/// Per-run reporter enforcing monotonic fractions.
pub struct ProgressReporter {
    entry_code: String,
    sink: Arc<dyn ProgressSink>,
    last: f64,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(entry_code: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            entry_code: entry_code.into(),
            sink,
            last: 0.0,
        }
    }

    /// Report a position inside `band`. Returns the fraction actually sent.
    pub fn report(&mut self, stage: Stage, band: Band, within: f64, message: impl Into<String>) -> f64 {
        self.last = self.last.max(band.at(within));
        self.sink.report(&ProgressUpdate {
            entry_code: self.entry_code.clone(),
            stage,
            fraction: self.last,
            message: message.into(),
        });
        self.last
    }

    /// Byte-count progress inside the download band. Unknown totals stay at the band start.
    pub fn bytes(&mut self, downloaded: u64, total: Option<u64>) -> f64 {
        let within = match total {
            Some(total) if total > 0 => {
                #[allow(clippy::cast_precision_loss)]
                let ratio = downloaded as f64 / total as f64;
                ratio
            }
            _ => 0.0,
        };
        let message = total.map_or_else(
            || format!("{downloaded} bytes"),
            |total| format!("{downloaded}/{total} bytes"),
        );
        self.report(Stage::Downloading, Band::Download, within, message)
    }

    #[must_use]
    pub const fn current(&self) -> f64 {
        self.last
    }
}
