use thiserror::Error;

/// Failures surfaced by the runners and the coordinator. `Cancelled` is not a
/// failure: a newer execution superseded this one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("Only {executable} commands are allowed")]
    Validation { executable: String },

    #[error("invalid resource name '{0}'")]
    InvalidName(String),

    #[error("failed to parse command: {0}")]
    InvalidCommand(String),

    #[error("Command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("{0}")]
    Transport(String),

    #[error("execution was cancelled")]
    Cancelled,

    #[error("stream '{0}' is already active")]
    StreamConflict(String),

    #[error("stream '{0}' not found")]
    StreamNotFound(String),
}

impl ExecError {
    pub fn transport(error: impl std::fmt::Display) -> Self {
        Self::Transport(error.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
