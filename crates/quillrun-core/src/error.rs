//! Core domain errors.

use thiserror::Error;

/// Core domain errors for Quillrun.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Errors reported by an external collaborator (unit store, job services,
/// batch store), independent of the transport used to reach it.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The collaborator could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The collaborator answered with an error.
    #[error("service error: {0}")]
    Rejected(String),

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A streaming channel broke mid-stream.
    #[error("stream error: {0}")]
    Stream(String),
}
