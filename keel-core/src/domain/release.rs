//! Release override domain types
//!
//! A release override is the durable record of one accepted deployment
//! attempt. Its counter is dense and strictly increasing per pipeline.

use serde::{Deserialize, Serialize};

use crate::domain::catalog::DeploymentStrategy;

/// One accepted deployment attempt on a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseOverride {
    pub id: i64,
    pub pipeline_id: i64,
    pub env_override_id: i64,
    pub artifact_id: i64,
    pub workflow_id: i64,

    /// Monotonic per-pipeline release counter
    pub counter: i64,

    pub status: ReleaseStatus,
    pub deployment_type: DeploymentType,
    pub strategy: DeploymentStrategy,
    pub commit_hash: Option<String>,
    pub commit_time: Option<chrono::DateTime<chrono::Utc>>,

    /// Final composed values, stored for audit
    pub merged_values: Option<serde_json::Value>,

    pub created_by: i64,
    pub created_on: chrono::DateTime<chrono::Utc>,
    pub updated_by: i64,
    pub updated_on: chrono::DateTime<chrono::Utc>,
}

/// Input for a new release override row; the counter is assigned by the journal
#[derive(Debug, Clone)]
pub struct NewRelease {
    pub pipeline_id: i64,
    pub env_override_id: i64,
    pub artifact_id: i64,
    pub workflow_id: i64,
    pub deployment_type: DeploymentType,
    pub strategy: DeploymentStrategy,
    pub user_id: i64,
    pub time: chrono::DateTime<chrono::Utc>,
}

/// Outcome of a release override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseStatus {
    New,
    Success,
    Failed,
    TimedOut,
}

impl ReleaseStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReleaseStatus::New)
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseStatus::New => write!(f, "NEW"),
            ReleaseStatus::Success => write!(f, "SUCCESS"),
            ReleaseStatus::Failed => write!(f, "FAILED"),
            ReleaseStatus::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Kind of release requested by a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", from = "String")]
pub enum DeploymentType {
    #[default]
    Deploy,
    Stop,
    Start,
}

impl std::fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentType::Deploy => write!(f, "DEPLOY"),
            DeploymentType::Stop => write!(f, "STOP"),
            DeploymentType::Start => write!(f, "START"),
        }
    }
}

impl From<String> for DeploymentType {
    /// Unknown values fall back to a plain deploy
    fn from(s: String) -> Self {
        match s.as_str() {
            "STOP" => DeploymentType::Stop,
            "START" => DeploymentType::Start,
            _ => DeploymentType::Deploy,
        }
    }
}

/// Identity of a published manifest: a git commit or a chart bundle digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitIdentity {
    pub commit_hash: String,
    pub commit_time: chrono::DateTime<chrono::Utc>,
}
