//! Error taxonomy for combat commands

use thiserror::Error;

/// Errors returned by every combat command
///
/// All variants except `Transport` guarantee that no state changed.
/// `Transport` means the command committed locally but persisting or
/// publishing it failed, so remote viewers may be stale until they re-fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CombatError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl CombatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CombatError::Validation(msg.into())
    }

    pub fn transition(msg: impl Into<String>) -> Self {
        CombatError::InvalidTransition(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CombatError::NotFound(what.into())
    }

    /// Short machine-readable kind, used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            CombatError::Validation(_) => "validation",
            CombatError::InvalidTransition(_) => "invalid_transition",
            CombatError::PermissionDenied(_) => "permission_denied",
            CombatError::NotFound(_) => "not_found",
            CombatError::Transport(_) => "transport",
        }
    }

    /// Whether the failure happened after a local commit
    pub fn is_partial_success(&self) -> bool {
        matches!(self, CombatError::Transport(_))
    }
}
