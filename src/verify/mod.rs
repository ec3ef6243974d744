//! Integrity verifiers and the gate chain that composes them.

pub mod checksum;
pub mod gate;
pub mod scan;
pub mod signature;
