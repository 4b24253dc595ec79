//! Catalog Repository
//!
//! Handles all database reads of applications, environments, pipelines and
//! artifacts.

use async_trait::async_trait;
use keel_core::domain::catalog::{
    AppLabel, Application, Artifact, DbMigrationConfig, DeployTarget, DeploymentStrategy,
    Environment, Pipeline, StrategyConfig,
};

use super::{PgStore, corrupt};
use crate::error::StoreError;
use crate::repository::CatalogRepository;

#[async_trait]
impl CatalogRepository for PgStore {
    async fn find_application(&self, id: i64) -> Result<Option<Application>, StoreError> {
        let row = sqlx::query_as::<_, ApplicationRow>(
            r#"
            SELECT id, name, project_id, display_name
            FROM applications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_environment(&self, id: i64) -> Result<Option<Environment>, StoreError> {
        let row = sqlx::query_as::<_, EnvironmentRow>(
            r#"
            SELECT id, name, cluster_id, cluster_name, namespace, is_prod
            FROM environments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_pipeline(&self, id: i64) -> Result<Option<Pipeline>, StoreError> {
        let row = sqlx::query_as::<_, PipelineRow>(
            r#"
            SELECT id, app_id, env_id, name, deployment_app_name, default_strategy,
                   deploy_target, registry_id, use_digest, deleted
            FROM pipelines
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Pipeline::try_from).transpose()
    }

    async fn find_pipeline_by_app_env(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<Pipeline>, StoreError> {
        let row = sqlx::query_as::<_, PipelineRow>(
            r#"
            SELECT id, app_id, env_id, name, deployment_app_name, default_strategy,
                   deploy_target, registry_id, use_digest, deleted
            FROM pipelines
            WHERE app_id = $1 AND env_id = $2 AND deleted = FALSE
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(app_id)
        .bind(env_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Pipeline::try_from).transpose()
    }

    async fn find_pipelines_by_deployment_app_name(
        &self,
        name: &str,
    ) -> Result<Vec<Pipeline>, StoreError> {
        let rows = sqlx::query_as::<_, PipelineRow>(
            r#"
            SELECT id, app_id, env_id, name, deployment_app_name, default_strategy,
                   deploy_target, registry_id, use_digest, deleted
            FROM pipelines
            WHERE deployment_app_name = $1 AND deleted = FALSE
            ORDER BY id ASC
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Pipeline::try_from).collect()
    }

    async fn find_artifact(&self, id: i64) -> Result<Option<Artifact>, StoreError> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT id, image, image_digest, material_info, registry_id, created_on
            FROM artifacts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Artifact::try_from).transpose()
    }

    async fn find_strategy(
        &self,
        pipeline_id: i64,
        strategy: DeploymentStrategy,
    ) -> Result<Option<StrategyConfig>, StoreError> {
        let row = sqlx::query_as::<_, StrategyRow>(
            r#"
            SELECT pipeline_id, strategy, config, is_default
            FROM pipeline_strategies
            WHERE pipeline_id = $1 AND strategy = $2
            "#,
        )
        .bind(pipeline_id)
        .bind(strategy.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(StrategyConfig::try_from).transpose()
    }

    async fn find_db_migration_config(
        &self,
        pipeline_id: i64,
    ) -> Result<Option<DbMigrationConfig>, StoreError> {
        let row = sqlx::query_as::<_, DbMigrationRow>(
            r#"
            SELECT pipeline_id, git_repo_url, git_user, git_auth_token, script_location,
                   db_type, db_user_name, db_password, db_host, db_port, db_name, active
            FROM db_migration_configs
            WHERE pipeline_id = $1 AND active = TRUE
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_app_labels(&self, app_id: i64) -> Result<Vec<AppLabel>, StoreError> {
        let rows = sqlx::query_as::<_, LabelRow>(
            r#"
            SELECT key, value, propagate
            FROM app_labels
            WHERE app_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn find_pull_secret(
        &self,
        registry_id: &str,
        cluster_id: i64,
    ) -> Result<Option<String>, StoreError> {
        // a cluster-specific binding wins over the registry-wide one
        let name = sqlx::query_scalar::<_, String>(
            r#"
            SELECT secret_name
            FROM registry_pull_secrets
            WHERE registry_id = $1 AND (cluster_id = $2 OR cluster_id IS NULL)
            ORDER BY cluster_id NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(registry_id)
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(name)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

pub(super) fn target_to_string(target: DeployTarget) -> &'static str {
    match target {
        DeployTarget::Gitops => "GITOPS",
        DeployTarget::ChartPush => "CHART_PUSH",
    }
}

pub(super) fn string_to_target(s: &str) -> Result<DeployTarget, StoreError> {
    match s {
        "GITOPS" => Ok(DeployTarget::Gitops),
        "CHART_PUSH" => Ok(DeployTarget::ChartPush),
        other => Err(corrupt("deploy_target", other)),
    }
}

pub(super) fn parse_strategy(s: &str) -> Result<DeploymentStrategy, StoreError> {
    DeploymentStrategy::parse(s).ok_or_else(|| corrupt("strategy", s))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ApplicationRow {
    id: i64,
    name: String,
    project_id: i64,
    display_name: Option<String>,
}

impl From<ApplicationRow> for Application {
    fn from(row: ApplicationRow) -> Self {
        Application {
            id: row.id,
            name: row.name,
            project_id: row.project_id,
            display_name: row.display_name,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    id: i64,
    name: String,
    cluster_id: i64,
    cluster_name: String,
    namespace: String,
    is_prod: bool,
}

impl From<EnvironmentRow> for Environment {
    fn from(row: EnvironmentRow) -> Self {
        Environment {
            id: row.id,
            name: row.name,
            cluster_id: row.cluster_id,
            cluster_name: row.cluster_name,
            namespace: row.namespace,
            is_prod: row.is_prod,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: i64,
    app_id: i64,
    env_id: i64,
    name: String,
    deployment_app_name: String,
    default_strategy: String,
    deploy_target: String,
    registry_id: Option<String>,
    use_digest: bool,
    deleted: bool,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = StoreError;

    fn try_from(row: PipelineRow) -> Result<Self, Self::Error> {
        Ok(Pipeline {
            id: row.id,
            app_id: row.app_id,
            env_id: row.env_id,
            name: row.name,
            deployment_app_name: row.deployment_app_name,
            default_strategy: parse_strategy(&row.default_strategy)?,
            deploy_target: string_to_target(&row.deploy_target)?,
            registry_id: row.registry_id,
            use_digest: row.use_digest,
            deleted: row.deleted,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: i64,
    image: String,
    image_digest: Option<String>,
    material_info: serde_json::Value,
    registry_id: Option<String>,
    created_on: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<ArtifactRow> for Artifact {
    type Error = StoreError;

    fn try_from(row: ArtifactRow) -> Result<Self, Self::Error> {
        Ok(Artifact {
            id: row.id,
            image: row.image,
            image_digest: row.image_digest,
            material_info: serde_json::from_value(row.material_info)?,
            registry_id: row.registry_id,
            created_on: row.created_on,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StrategyRow {
    pipeline_id: i64,
    strategy: String,
    config: serde_json::Value,
    is_default: bool,
}

impl TryFrom<StrategyRow> for StrategyConfig {
    type Error = StoreError;

    fn try_from(row: StrategyRow) -> Result<Self, Self::Error> {
        Ok(StrategyConfig {
            pipeline_id: row.pipeline_id,
            strategy: parse_strategy(&row.strategy)?,
            config: row.config,
            default: row.is_default,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DbMigrationRow {
    pipeline_id: i64,
    git_repo_url: String,
    git_user: String,
    git_auth_token: String,
    script_location: String,
    db_type: String,
    db_user_name: String,
    db_password: String,
    db_host: String,
    db_port: String,
    db_name: String,
    active: bool,
}

impl From<DbMigrationRow> for DbMigrationConfig {
    fn from(row: DbMigrationRow) -> Self {
        DbMigrationConfig {
            pipeline_id: row.pipeline_id,
            git_repo_url: row.git_repo_url,
            git_user: row.git_user,
            git_auth_token: row.git_auth_token,
            script_location: row.script_location,
            db_type: row.db_type,
            db_user_name: row.db_user_name,
            db_password: row.db_password,
            db_host: row.db_host,
            db_port: row.db_port,
            db_name: row.db_name,
            active: row.active,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LabelRow {
    key: String,
    value: String,
    propagate: bool,
}

impl From<LabelRow> for AppLabel {
    fn from(row: LabelRow) -> Self {
        AppLabel {
            key: row.key,
            value: row.value,
            propagate: row.propagate,
        }
    }
}
