//! Runner domain model
//!
//! A runner is one execution of one stage of a release override.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::catalog::DeployTarget;

/// The (pipeline, artifact) pair whose id identifies a trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i64,
    pub pipeline_id: i64,
    pub artifact_id: i64,
    pub created_on: DateTime<Utc>,
}

/// A single execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: i64,
    pub workflow_id: i64,
    pub release_override_id: Option<i64>,
    pub stage: WorkflowStage,
    pub status: RunnerStatus,
    pub deploy_target: DeployTarget,
    pub started_on: DateTime<Utc>,
    pub finished_on: Option<DateTime<Utc>>,
    pub triggered_by: i64,
    pub message: Option<String>,
}

/// Input for a new runner row
#[derive(Debug, Clone)]
pub struct NewRunner {
    pub workflow_id: i64,
    pub release_override_id: Option<i64>,
    pub stage: WorkflowStage,
    pub status: RunnerStatus,
    pub deploy_target: DeployTarget,
    pub started_on: DateTime<Utc>,
    pub triggered_by: i64,
}

/// Stage a runner executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStage {
    Pre,
    Deploy,
    Post,
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStage::Pre => write!(f, "PRE"),
            WorkflowStage::Deploy => write!(f, "DEPLOY"),
            WorkflowStage::Post => write!(f, "POST"),
        }
    }
}

/// Status of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    /// Accepted, waiting for a stage executor
    Queued,

    /// Release persisted, manifest not yet published
    Initiated,

    /// Manifest published, waiting for the CD agent
    InProgress,

    Succeeded,
    Failed,
    TimedOut,
}

impl RunnerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerStatus::Succeeded | RunnerStatus::Failed | RunnerStatus::TimedOut
        )
    }

    fn rank(&self) -> u8 {
        match self {
            RunnerStatus::Queued => 0,
            RunnerStatus::Initiated => 1,
            RunnerStatus::InProgress => 2,
            RunnerStatus::Succeeded | RunnerStatus::Failed | RunnerStatus::TimedOut => 3,
        }
    }

    /// Runners only move forward; terminal states are final
    pub fn can_transition_to(&self, next: RunnerStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerStatus::Queued => write!(f, "QUEUED"),
            RunnerStatus::Initiated => write!(f, "INITIATED"),
            RunnerStatus::InProgress => write!(f, "IN_PROGRESS"),
            RunnerStatus::Succeeded => write!(f, "SUCCEEDED"),
            RunnerStatus::Failed => write!(f, "FAILED"),
            RunnerStatus::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(RunnerStatus::Queued.can_transition_to(RunnerStatus::Initiated));
        assert!(RunnerStatus::Initiated.can_transition_to(RunnerStatus::InProgress));
        assert!(RunnerStatus::InProgress.can_transition_to(RunnerStatus::Succeeded));
        assert!(RunnerStatus::InProgress.can_transition_to(RunnerStatus::TimedOut));
        assert!(RunnerStatus::Initiated.can_transition_to(RunnerStatus::Failed));
    }

    #[test]
    fn test_no_backward_or_terminal_transitions() {
        assert!(!RunnerStatus::InProgress.can_transition_to(RunnerStatus::Initiated));
        assert!(!RunnerStatus::InProgress.can_transition_to(RunnerStatus::InProgress));
        assert!(!RunnerStatus::Succeeded.can_transition_to(RunnerStatus::Failed));
        assert!(!RunnerStatus::TimedOut.can_transition_to(RunnerStatus::Succeeded));
    }
}
