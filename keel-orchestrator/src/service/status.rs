//! Status Projector
//!
//! Projects the raw reconciler health of an (app, env) into the status shown
//! to consumers. A running STOP release reports hibernation instead of health.

use keel_core::domain::release::DeploymentType;
use keel_core::domain::status::{HealthStatus, ProjectedStatus};

use crate::error::Result;
use crate::repository::Stores;

#[derive(Clone)]
pub struct StatusProjector {
    stores: Stores,
}

impl StatusProjector {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn project(&self, app_id: i64, env_id: i64) -> Result<ProjectedStatus> {
        let health = self
            .stores
            .app_status
            .find(app_id, env_id)
            .await?
            .map(|s| s.status)
            .unwrap_or(HealthStatus::Unknown);

        let Some(pipeline) = self
            .stores
            .catalog
            .find_pipeline_by_app_env(app_id, env_id)
            .await?
        else {
            return Ok(ProjectedStatus::Health(health));
        };

        let Some(runner) = self
            .stores
            .workflows
            .find_latest_non_failed_deploy_runner(pipeline.id)
            .await?
        else {
            return Ok(ProjectedStatus::Health(health));
        };

        let deployment_type = match runner.release_override_id {
            Some(id) => self
                .stores
                .releases
                .find_by_id(id)
                .await?
                .map(|r| r.deployment_type),
            None => None,
        };

        Ok(project_health(health, deployment_type.unwrap_or_default()))
    }
}

/// Hibernation mapping for a stopped release
pub fn project_health(health: HealthStatus, deployment_type: DeploymentType) -> ProjectedStatus {
    if deployment_type != DeploymentType::Stop {
        return ProjectedStatus::Health(health);
    }
    match health {
        HealthStatus::Healthy | HealthStatus::Missing => ProjectedStatus::Hibernating,
        _ => ProjectedStatus::PartialHibernation,
    }
}
