//! Error types for the Keel collaborator clients

use keel_core::collab::CollaboratorError;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to a collaborator
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Remote returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the remote
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_)) || matches!(self, Self::ApiError { status: 404, .. })
    }

    /// Check if the remote refused a write made against a stale revision
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ApiError { status: 409 | 422, .. })
    }
}

impl From<ClientError> for CollaboratorError {
    fn from(err: ClientError) -> Self {
        if err.is_not_found() {
            return CollaboratorError::NotFound(err.to_string());
        }
        if err.is_conflict() {
            return CollaboratorError::Conflict(err.to_string());
        }
        match err {
            ClientError::ApiError { status, message } if status < 500 => {
                CollaboratorError::Rejected { status, message }
            }
            other => CollaboratorError::Unavailable(other.to_string()),
        }
    }
}
