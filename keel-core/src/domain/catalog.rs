//! Catalog domain types
//!
//! Applications, environments, pipelines and artifacts. The engine reads these
//! rows but never owns their lifecycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An application registered in the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub project_id: i64,
    pub display_name: Option<String>,
}

/// A deployment target (cluster + namespace)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: i64,
    pub name: String,
    pub cluster_id: i64,
    pub cluster_name: String,
    pub namespace: String,
    pub is_prod: bool,
}

/// Binding of an application to an environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub app_id: i64,
    pub env_id: i64,
    pub name: String,

    /// Name of the application object watched by the CD agent
    pub deployment_app_name: String,

    pub default_strategy: DeploymentStrategy,
    pub deploy_target: DeployTarget,

    /// Docker registry whose pull secret is injected into the values
    pub registry_id: Option<String>,

    /// Pin the image by digest instead of tag
    pub use_digest: bool,

    pub deleted: bool,
}

impl Pipeline {
    /// Default CD-agent application name for an (app, env) pair
    pub fn default_deployment_app_name(app_name: &str, env_name: &str) -> String {
        format!("{}-{}", app_name, env_name)
    }
}

/// How a pipeline delivers the composed values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployTarget {
    /// Commit a values file to a GitOps repository
    Gitops,

    /// Push a rendered chart bundle to a chart registry
    ChartPush,
}

impl std::fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployTarget::Gitops => write!(f, "GITOPS"),
            DeployTarget::ChartPush => write!(f, "CHART_PUSH"),
        }
    }
}

/// Rollout strategy for a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeploymentStrategy {
    #[serde(rename = "ROLLING")]
    Rolling,
    #[serde(rename = "BLUE-GREEN")]
    BlueGreen,
    #[serde(rename = "CANARY")]
    Canary,
    #[serde(rename = "RECREATE")]
    Recreate,
}

impl DeploymentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStrategy::Rolling => "ROLLING",
            DeploymentStrategy::BlueGreen => "BLUE-GREEN",
            DeploymentStrategy::Canary => "CANARY",
            DeploymentStrategy::Recreate => "RECREATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ROLLING" => Some(DeploymentStrategy::Rolling),
            "BLUE-GREEN" => Some(DeploymentStrategy::BlueGreen),
            "CANARY" => Some(DeploymentStrategy::Canary),
            "RECREATE" => Some(DeploymentStrategy::Recreate),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strategy patch configured on a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub pipeline_id: i64,
    pub strategy: DeploymentStrategy,
    pub config: serde_json::Value,
    pub default: bool,
}

/// An immutable container image produced by CI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub image: String,
    pub image_digest: Option<String>,

    /// Source repository URL -> commit hash
    pub material_info: BTreeMap<String, String>,

    pub registry_id: Option<String>,
    pub created_on: chrono::DateTime<chrono::Utc>,
}

/// Database migration job settings attached to a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbMigrationConfig {
    pub pipeline_id: i64,
    pub git_repo_url: String,
    pub git_user: String,
    pub git_auth_token: String,
    pub script_location: String,
    pub db_type: String,
    pub db_user_name: String,
    pub db_password: String,
    pub db_host: String,
    pub db_port: String,
    pub db_name: String,
    pub active: bool,
}

/// Application label, optionally propagated into deployments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppLabel {
    pub key: String,
    pub value: String,
    pub propagate: bool,
}

/// A user known to the directory (deleted users included)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub active: bool,
}

impl User {
    /// Display name derived from the local part of the email
    pub fn display_name(&self) -> &str {
        self.email.split('@').next().unwrap_or(&self.email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_round_trip_names() {
        for strategy in [
            DeploymentStrategy::Rolling,
            DeploymentStrategy::BlueGreen,
            DeploymentStrategy::Canary,
            DeploymentStrategy::Recreate,
        ] {
            assert_eq!(DeploymentStrategy::parse(strategy.as_str()), Some(strategy));
        }
        assert_eq!(DeploymentStrategy::parse("blue-green"), None);
    }

    #[test]
    fn test_strategy_serde_uses_hyphenated_name() {
        let json = serde_json::to_string(&DeploymentStrategy::BlueGreen).unwrap();
        assert_eq!(json, "\"BLUE-GREEN\"");
    }

    #[test]
    fn test_user_display_name() {
        let user = User {
            id: 1,
            email: "jane.doe@example.com".to_string(),
            active: true,
        };
        assert_eq!(user.display_name(), "jane.doe");
    }
}
