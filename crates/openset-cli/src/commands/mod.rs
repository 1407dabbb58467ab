//! CLI command handlers
//!
//! Handlers return the process exit code: 0 on success, 1 on error.

pub mod probe;
pub mod run;
