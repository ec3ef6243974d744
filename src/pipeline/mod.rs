//! Installation pipeline: supervised processes, downloads, installers, progress, workers.

pub mod attempt;
pub mod cancel;
pub mod download;
pub mod installer;
pub mod pool;
pub mod process;
pub mod progress;
pub mod runner;
