//! CLI command implementations for indexsync.

pub mod inspect;
pub mod run;
