//! Timeline domain types
//!
//! Timeline entries are the append-only progress log of a runner. Tags fall
//! into three classes: terminal tags (at most one per runner), ordered tags
//! (GIT_COMMIT -> KUBECTL_APPLY_STARTED -> KUBECTL_APPLY_SYNCED) and unordered
//! markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::release::ReleaseStatus;
use crate::domain::runner::RunnerStatus;

/// A single timeline entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: i64,
    pub runner_id: i64,
    pub status: TimelineStatus,
    pub detail: String,
    pub status_time: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
}

/// Input for a new timeline entry
#[derive(Debug, Clone)]
pub struct NewTimelineEntry {
    pub runner_id: i64,
    pub status: TimelineStatus,
    pub detail: String,
    pub status_time: DateTime<Utc>,
}

/// Timeline status tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimelineStatus {
    DeploymentInitiated,
    GitCommit,
    GitCommitFailed,
    ArgocdSyncCompleted,
    KubectlApplyStarted,
    KubectlApplySynced,
    AppHealthy,
    Failed,
    FetchTimedOut,
    DeploymentSuperseded,
}

impl TimelineStatus {
    pub const TERMINAL: [TimelineStatus; 5] = [
        TimelineStatus::AppHealthy,
        TimelineStatus::Failed,
        TimelineStatus::FetchTimedOut,
        TimelineStatus::GitCommitFailed,
        TimelineStatus::DeploymentSuperseded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineStatus::DeploymentInitiated => "DEPLOYMENT_INITIATED",
            TimelineStatus::GitCommit => "GIT_COMMIT",
            TimelineStatus::GitCommitFailed => "GIT_COMMIT_FAILED",
            TimelineStatus::ArgocdSyncCompleted => "ARGOCD_SYNC_COMPLETED",
            TimelineStatus::KubectlApplyStarted => "KUBECTL_APPLY_STARTED",
            TimelineStatus::KubectlApplySynced => "KUBECTL_APPLY_SYNCED",
            TimelineStatus::AppHealthy => "APP_HEALTHY",
            TimelineStatus::Failed => "FAILED",
            TimelineStatus::FetchTimedOut => "FETCH_TIMED_OUT",
            TimelineStatus::DeploymentSuperseded => "DEPLOYMENT_SUPERSEDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEPLOYMENT_INITIATED" => Some(TimelineStatus::DeploymentInitiated),
            "GIT_COMMIT" => Some(TimelineStatus::GitCommit),
            "GIT_COMMIT_FAILED" => Some(TimelineStatus::GitCommitFailed),
            "ARGOCD_SYNC_COMPLETED" => Some(TimelineStatus::ArgocdSyncCompleted),
            "KUBECTL_APPLY_STARTED" => Some(TimelineStatus::KubectlApplyStarted),
            "KUBECTL_APPLY_SYNCED" => Some(TimelineStatus::KubectlApplySynced),
            "APP_HEALTHY" => Some(TimelineStatus::AppHealthy),
            "FAILED" => Some(TimelineStatus::Failed),
            "FETCH_TIMED_OUT" => Some(TimelineStatus::FetchTimedOut),
            "DEPLOYMENT_SUPERSEDED" => Some(TimelineStatus::DeploymentSuperseded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Position in the ordered progression, if the tag takes part in it
    pub fn order(&self) -> Option<u8> {
        match self {
            TimelineStatus::GitCommit => Some(1),
            TimelineStatus::KubectlApplyStarted => Some(2),
            TimelineStatus::KubectlApplySynced => Some(3),
            TimelineStatus::AppHealthy => Some(4),
            _ => None,
        }
    }

    /// Tag that must already be recorded before this one may be appended
    pub fn predecessor(&self) -> Option<TimelineStatus> {
        match self {
            TimelineStatus::KubectlApplyStarted => Some(TimelineStatus::GitCommit),
            TimelineStatus::KubectlApplySynced => Some(TimelineStatus::KubectlApplyStarted),
            TimelineStatus::AppHealthy => Some(TimelineStatus::KubectlApplySynced),
            _ => None,
        }
    }

    /// Runner status implied by appending this tag
    pub fn runner_status(&self) -> Option<RunnerStatus> {
        match self {
            TimelineStatus::GitCommit => Some(RunnerStatus::InProgress),
            TimelineStatus::AppHealthy => Some(RunnerStatus::Succeeded),
            TimelineStatus::Failed
            | TimelineStatus::GitCommitFailed
            | TimelineStatus::DeploymentSuperseded => Some(RunnerStatus::Failed),
            TimelineStatus::FetchTimedOut => Some(RunnerStatus::TimedOut),
            _ => None,
        }
    }

    /// Release status implied by a terminal tag
    pub fn release_status(&self) -> Option<ReleaseStatus> {
        match self {
            TimelineStatus::AppHealthy => Some(ReleaseStatus::Success),
            TimelineStatus::Failed
            | TimelineStatus::GitCommitFailed
            | TimelineStatus::DeploymentSuperseded => Some(ReleaseStatus::Failed),
            TimelineStatus::FetchTimedOut => Some(ReleaseStatus::TimedOut),
            _ => None,
        }
    }
}

impl std::fmt::Display for TimelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_tags() {
        assert!(TimelineStatus::AppHealthy.is_terminal());
        assert!(TimelineStatus::FetchTimedOut.is_terminal());
        assert!(TimelineStatus::GitCommitFailed.is_terminal());
        assert!(!TimelineStatus::GitCommit.is_terminal());
        assert!(!TimelineStatus::ArgocdSyncCompleted.is_terminal());
    }

    #[test]
    fn test_terminal_tags_imply_terminal_runner_status() {
        for tag in TimelineStatus::TERMINAL {
            let status = tag.runner_status().unwrap();
            assert!(status.is_terminal(), "{} -> {}", tag, status);
            assert!(tag.release_status().is_some());
        }
    }

    #[test]
    fn test_ordered_chain() {
        assert_eq!(
            TimelineStatus::KubectlApplySynced.predecessor(),
            Some(TimelineStatus::KubectlApplyStarted)
        );
        assert!(TimelineStatus::GitCommit.order() < TimelineStatus::KubectlApplyStarted.order());
        assert_eq!(TimelineStatus::DeploymentInitiated.order(), None);
    }

    #[test]
    fn test_parse_matches_as_str() {
        for tag in [
            TimelineStatus::DeploymentInitiated,
            TimelineStatus::GitCommit,
            TimelineStatus::KubectlApplyStarted,
            TimelineStatus::KubectlApplySynced,
            TimelineStatus::ArgocdSyncCompleted,
            TimelineStatus::FetchTimedOut,
        ] {
            assert_eq!(TimelineStatus::parse(tag.as_str()), Some(tag));
        }
    }
}
