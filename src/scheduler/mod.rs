//! Update scheduler and the long-running daemon around it.

#[cfg(feature = "daemon")]
pub mod daemon;
pub mod loop_main;
#[cfg(feature = "daemon")]
pub mod signals;
