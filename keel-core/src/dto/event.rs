//! CD events handed to the notifier

use serde::{Deserialize, Serialize};

use crate::domain::release::DeploymentType;
use crate::domain::runner::WorkflowStage;

/// Notification-worthy moment in a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdEvent {
    pub kind: CdEventKind,
    pub app_id: i64,
    pub env_id: i64,
    pub pipeline_id: i64,
    pub runner_id: i64,
    pub stage: WorkflowStage,
    pub deployment_type: DeploymentType,
    pub triggered_by: i64,
    pub correlation_id: String,
    pub time: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CdEventKind {
    Trigger,
    Success,
    Fail,
}
