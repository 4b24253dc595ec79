//! Collaborator interfaces
//!
//! Narrow contracts for the systems the engine talks to but does not own:
//! the GitOps provider, the chart registry, the cluster API, the notification
//! dispatcher and the user directory. HTTP implementations live in
//! `keel-client`; the engine ships in-process fakes for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::catalog::User;
use crate::dto::event::CdEvent;

/// Errors reported by collaborators
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    /// Referenced remote object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure (e.g. non-fast-forward push)
    #[error("conflict: {0}")]
    Conflict(String),

    /// The remote rejected the request
    #[error("rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The remote could not be reached or answered garbage
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl CollaboratorError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

// =============================================================================
// GitOps
// =============================================================================

/// Author attached to a values commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

/// A values file to commit into a GitOps repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuesCommit {
    pub repo_name: String,
    pub file_path: String,
    pub content: String,
    pub message: String,
    pub author: CommitAuthor,
}

/// Commit as reported by the provider; `time` may be missing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommit {
    pub hash: String,
    pub time: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait GitOpsClient: Send + Sync {
    /// Ensures the repository exists, creating it if absent; returns its URL
    async fn ensure_repo(&self, name: &str) -> Result<String, CollaboratorError>;

    /// Commits a values file. A concurrent push surfaces as `Conflict`.
    async fn commit_values(&self, commit: &ValuesCommit) -> Result<GitCommit, CollaboratorError>;
}

// =============================================================================
// Chart Registry
// =============================================================================

/// A packaged chart ready for upload
#[derive(Debug, Clone)]
pub struct ChartBundle {
    pub name: String,
    pub version: String,
    pub bytes: Vec<u8>,

    /// `sha256:<hex>` of `bytes`
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushIdentity {
    pub digest: String,
    pub commit_time: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ChartRegistry: Send + Sync {
    async fn push(&self, bundle: &ChartBundle) -> Result<PushIdentity, CollaboratorError>;
}

// =============================================================================
// Cluster
// =============================================================================

/// Coordinates of a namespaced cluster resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub cluster_id: i64,
    pub group: String,
    pub kind: String,
    pub version: String,
    pub namespace: String,
    pub name: String,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Reads a live resource manifest; `Ok(None)` when it does not exist
    async fn get_resource(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<serde_json::Value>, CollaboratorError>;
}

// =============================================================================
// Notifier & User Directory
// =============================================================================

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn write_cd_event(&self, event: &CdEvent) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_by_id_include_deleted(&self, id: i64) -> Result<Option<User>, CollaboratorError>;
}
