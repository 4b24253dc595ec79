//! Deployment history
//!
//! Snapshot of what a deploy runner actually shipped, read back when a
//! pipeline re-deploys the configuration of a specific earlier trigger.

use serde::{Deserialize, Serialize};

use crate::domain::catalog::DeploymentStrategy;
use crate::domain::config::ConfigItem;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistory {
    pub id: i64,
    pub pipeline_id: i64,
    pub runner_id: i64,
    pub chart_ref_id: i64,

    /// Resolved environment override (or base defaults) used as merge layer 1
    pub template: serde_json::Value,

    pub strategy: DeploymentStrategy,
    pub strategy_config: Option<serde_json::Value>,
    pub config_maps: Vec<ConfigItem>,

    /// Secret items with data masked
    pub secrets: Vec<ConfigItem>,

    pub variable_snapshot: std::collections::BTreeMap<String, String>,
    pub deployed_on: chrono::DateTime<chrono::Utc>,
    pub deployed_by: i64,
}
