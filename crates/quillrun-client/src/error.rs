//! Error types for the API client.

use thiserror::Error;

use quillrun_core::ServiceError;

/// Errors that can occur when talking to the writing backend.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to establish connection.
    #[error("connection failed: {0}")]
    Connection(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {path}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<ClientError> for ServiceError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Connection(msg) => ServiceError::Connection(msg),
            ClientError::Http(e) if e.is_connect() || e.is_timeout() => {
                ServiceError::Connection(e.to_string())
            }
            ClientError::Http(e) if e.is_decode() => ServiceError::Serialization(e.to_string()),
            ClientError::Http(e) => ServiceError::Rejected(e.to_string()),
            ClientError::NotFound(msg) => ServiceError::NotFound(msg),
            err @ ClientError::Status { .. } => ServiceError::Rejected(err.to_string()),
            ClientError::Serialization(msg) => ServiceError::Serialization(msg),
        }
    }
}
