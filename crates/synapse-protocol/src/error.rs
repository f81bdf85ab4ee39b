//! Error types for the agent core protocol.

use thiserror::Error;

/// Errors that can cross a port boundary.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid project: {0}")]
    InvalidProject(String),
    #[error("security violation: {0}")]
    Security(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Convenience result type for port operations.
pub type KernelResult<T> = Result<T, KernelError>;
