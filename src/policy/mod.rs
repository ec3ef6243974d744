//! Download-source trust decisions.

pub mod source;
