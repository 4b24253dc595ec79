//! Application status events published by the CD agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::status::HealthStatus;

/// Snapshot of a CD-agent application after a reconcile pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerEvent {
    /// CD-agent application name
    pub name: String,
    pub namespace: String,
    pub cluster_id: i64,
    pub sync: SyncInfo,
    #[serde(default)]
    pub operation_state: Option<OperationState>,
    pub health: HealthInfo,
    #[serde(default)]
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl ReconcilerEvent {
    /// Time the event describes; falls back to the latest sync time
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        self.reconciled_at
            .or(self.sync.finished_at)
            .or(self.sync.started_at)
    }

    pub fn phase(&self) -> Option<OperationPhase> {
        self.operation_state.as_ref().map(|s| s.phase)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    /// Git commit hash or chart bundle digest the agent observed
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    /// Commit time of `revision`, when the agent knows it
    #[serde(default)]
    pub committed_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationState {
    pub phase: OperationPhase,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationPhase {
    Running,
    Succeeded,
    Failed,
    Error,
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthInfo {
    pub status: HealthStatus,
    #[serde(default)]
    pub message: Option<String>,
}
