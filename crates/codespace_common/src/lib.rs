//! Codespace Common - shared types, configuration and errors
//!
//! Used by the `codespaced` daemon and the `codespacectl` CLI.

pub mod audit_log;
pub mod config;
pub mod error;
pub mod types;

pub use config::CodespaceConfig;
pub use error::{CodespaceError, CodespaceResult, EXIT_FAILURE, EXIT_SUCCESS};
pub use types::*;
