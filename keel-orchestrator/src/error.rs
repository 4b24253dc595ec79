//! Engine error types
//!
//! One error enum per layer, aggregated into [`EngineError`] at the service
//! boundary. Messages never include secret material.

use keel_core::collab::CollaboratorError;
use thiserror::Error;

/// Errors from the config store gateway
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A transaction handle from another backend was passed in
    #[error("transaction handle does not belong to this store")]
    ForeignTransaction,

    /// A row could not be mapped onto the domain model
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A uniqueness rule rejected the write
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Variable resolution failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("unresolved variables: {}", .0.join(", "))]
    Unresolved(Vec<String>),

    #[error("resolved document is not valid JSON: {0}")]
    InvalidDocument(String),
}

/// Composition failure; nothing is persisted when this is returned
#[derive(Debug, Error)]
pub enum ComposerError {
    #[error("template error: {0}")]
    Template(String),

    #[error("merge error at {path}: {message}")]
    Merge { path: String, message: String },

    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),
}

impl ComposerError {
    pub fn merge(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Merge {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ComposerErrorKind {
        match self {
            ComposerError::Template(_) => ComposerErrorKind::TemplateError,
            ComposerError::Merge { .. } => ComposerErrorKind::MergeError,
            ComposerError::Resolution(_) => ComposerErrorKind::ResolutionError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposerErrorKind {
    TemplateError,
    MergeError,
    ResolutionError,
}

/// Release journal failure
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("release journal database error: {0}")]
    Database(#[from] StoreError),

    #[error("release counter for pipeline {pipeline_id} is still duplicated after {attempts} attempts")]
    Duplicate { pipeline_id: i64, attempts: u32 },

    #[error("trigger cancelled before the release was committed")]
    Cancelled,
}

/// Manifest publishing failure
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("gitops commit failed: {0}")]
    Git(#[source] CollaboratorError),

    #[error("chart push failed: {0}")]
    Registry(#[source] CollaboratorError),

    #[error("could not render values file: {0}")]
    Render(String),

    #[error("publish bookkeeping failed: {0}")]
    Store(#[from] StoreError),
}

impl PublishError {
    /// Message recorded on the GIT_COMMIT_FAILED timeline entry
    pub fn provider_message(&self) -> String {
        match self {
            PublishError::Git(e) | PublishError::Registry(e) => match e {
                CollaboratorError::NotFound(m)
                | CollaboratorError::Conflict(m)
                | CollaboratorError::Unavailable(m) => m.clone(),
                CollaboratorError::Rejected { message, .. } => message.clone(),
            },
            PublishError::Render(m) => m.clone(),
            PublishError::Store(e) => e.to_string(),
        }
    }
}

/// Top-level engine error surfaced to callers and the transport
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Composer(#[from] ComposerError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    /// An ordered timeline tag arrived before its predecessor
    #[error("timeline protocol violation: {0}")]
    ProtocolViolation(String),

    /// Event handling failed; the transport should redeliver
    #[error("reconcile error: {0}")]
    Reconcile(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ResolutionError> for EngineError {
    fn from(err: ResolutionError) -> Self {
        EngineError::Composer(ComposerError::Resolution(err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composer_error_kinds() {
        assert_eq!(
            ComposerError::Template("x".into()).kind(),
            ComposerErrorKind::TemplateError
        );
        assert_eq!(
            ComposerError::merge("$.a", "bad").kind(),
            ComposerErrorKind::MergeError
        );
        let err: ComposerError = ResolutionError::Unresolved(vec!["a".into()]).into();
        assert_eq!(err.kind(), ComposerErrorKind::ResolutionError);
    }

    #[test]
    fn test_provider_message_unwraps_collaborator_error() {
        let err = PublishError::Git(CollaboratorError::Conflict("repo locked".to_string()));
        assert_eq!(err.provider_message(), "repo locked");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_unresolved_message_lists_names() {
        let err = ResolutionError::Unresolved(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "unresolved variables: a, b");
    }
}
