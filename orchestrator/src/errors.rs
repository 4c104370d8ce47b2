//! Error types for the orchestrator

use thiserror::Error;

/// Main error type for dockhand
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Host or engine unreachable. Never retried silently.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Rejected before any side effect.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A command exited non-zero. `output_tail` carries the last captured
    /// lines so the failure renders directly in an operator log stream.
    #[error("Command `{command}` failed with exit code {exit_code}: {output_tail}")]
    ExecutionError {
        command: String,
        exit_code: i32,
        output_tail: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    /// A deploy failed after mutating state; both outcomes are kept.
    #[error("Deployment failed: {cause} (rollback: {rollback})")]
    PartialFailure { cause: String, rollback: String },

    #[error("Missing capabilities: {0}")]
    MissingCapabilities(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// True when the error means the addressed instance or record is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound(_))
    }
}
