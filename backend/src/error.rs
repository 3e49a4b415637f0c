//! Application error types and result alias.

use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed coordinates or event, rejected before any work starts
    #[error("Validation error: {0}")]
    Validation(String),

    /// The repository (or a store) has no such project/version
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Network or repository hiccup worth retrying
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Conflict error (e.g., duplicate schedule name)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the refresh orchestrator to decide between
/// retrying, failing terminally and rejecting outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    TransientIo,
    Internal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) | AppError::Config(_) | AppError::Json(_) => {
                ErrorKind::Validation
            }
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::TransientIo(_) | AppError::Storage(_) | AppError::Io(_) => {
                ErrorKind::TransientIo
            }
            AppError::Conflict(_) | AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a failed attempt with this error should be requeued.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }

    /// Short machine-readable code, used in event responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::TransientIo(_) => "TRANSIENT_IO",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Io(_) => "IO_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
