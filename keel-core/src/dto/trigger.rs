//! Trigger DTOs

use serde::{Deserialize, Serialize};

use crate::domain::catalog::DeploymentStrategy;
use crate::domain::release::{CommitIdentity, DeploymentType, ReleaseOverride};
use crate::domain::runner::Runner;

/// Request to deploy an artifact through a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub pipeline_id: i64,
    pub app_id: i64,
    pub ci_artifact_id: i64,

    #[serde(default)]
    pub additional_override: Option<serde_json::Value>,

    #[serde(default)]
    pub strategy: Option<DeploymentStrategy>,

    #[serde(default)]
    pub cd_workflow_type: CdWorkflowType,

    #[serde(default)]
    pub deployment_with_config: DeploymentWithConfig,

    #[serde(default)]
    pub wfr_id_for_specific_trigger: Option<i64>,

    #[serde(default)]
    pub deployment_type: DeploymentType,

    #[serde(default)]
    pub force_trigger: bool,

    pub user_id: i64,
}

impl TriggerRequest {
    /// A plain deploy of an artifact with the last saved configuration
    pub fn deploy(pipeline_id: i64, app_id: i64, ci_artifact_id: i64, user_id: i64) -> Self {
        Self {
            pipeline_id,
            app_id,
            ci_artifact_id,
            additional_override: None,
            strategy: None,
            cd_workflow_type: CdWorkflowType::Deploy,
            deployment_with_config: DeploymentWithConfig::LastSaved,
            wfr_id_for_specific_trigger: None,
            deployment_type: DeploymentType::Deploy,
            force_trigger: false,
            user_id,
        }
    }
}

/// Stage requested by a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CdWorkflowType {
    Pre,
    #[default]
    Deploy,
    Post,
}

/// Which configuration a trigger deploys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentWithConfig {
    /// The currently saved environment override and config payloads
    #[default]
    LastSaved,

    /// The configuration shipped by an earlier runner
    SpecificTrigger,
}

/// Result of an accepted trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerOutcome {
    pub release: Option<ReleaseOverride>,
    pub runner: Runner,
    pub commit: Option<CommitIdentity>,

    /// Provider message when publishing failed
    pub publish_error: Option<String>,
}
