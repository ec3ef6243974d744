//! Core types: errors, configuration, paths, network settings.

pub mod config;
pub mod errors;
pub mod network;
pub mod paths;
