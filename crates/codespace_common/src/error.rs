//! Error types for Codespace.

use crate::types::{LifecycleState, TriggerKind};
use thiserror::Error;

/// Exit code for success (also used when the user declines a confirmation)
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code for any action that was not completed as requested
pub const EXIT_FAILURE: i32 = 1;

#[derive(Error, Debug)]
pub enum CodespaceError {
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Invalid service: {0}")]
    InvalidService(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rollback trigger '{0}' is disabled")]
    TriggerDisabled(TriggerKind),

    #[error("Rollback is disabled in configuration")]
    RollbackDisabled,

    #[error("Trigger '{kind}' cannot be evaluated with {context} input")]
    TriggerMismatch {
        kind: TriggerKind,
        context: &'static str,
    },

    #[error("Invalid lifecycle transition for '{environment}': {from} -> {to}")]
    InvalidTransition {
        environment: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Monitoring failure: {0}")]
    Monitoring(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CodespaceError {
    /// Validation errors are reported locally and never touch a resource.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CodespaceError::InvalidAction(_)
                | CodespaceError::InvalidService(_)
                | CodespaceError::MissingParameter(_)
                | CodespaceError::UnknownService(_)
                | CodespaceError::InvalidEnvironment(_)
                | CodespaceError::TriggerMismatch { .. }
        )
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, CodespaceError::Unauthorized(_))
    }

    /// Every error maps to "not completed as requested".
    pub fn exit_code(&self) -> i32 {
        EXIT_FAILURE
    }
}

pub type CodespaceResult<T> = std::result::Result<T, CodespaceError>;
