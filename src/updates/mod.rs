//! Update lifecycle: feed parsing, state transitions, and the update manager.

pub mod checker;
pub mod service;
pub mod state;
