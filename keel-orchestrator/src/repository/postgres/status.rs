//! Status Repository
//!
//! Handles database operations related to app status, deployment history,
//! scoped variables and the user directory.

use std::collections::BTreeMap;

use async_trait::async_trait;
use keel_core::collab::{CollaboratorError, UserDirectory};
use keel_core::domain::catalog::User;
use keel_core::domain::history::DeploymentHistory;
use keel_core::domain::status::{AppStatus, HealthStatus};
use keel_core::domain::variable::{ScopedVariable, VariableScope};

use super::PgStore;
use super::catalog::parse_strategy;
use crate::error::StoreError;
use crate::repository::{AppStatusRepository, HistoryRepository, VariableRepository};

#[async_trait]
impl AppStatusRepository for PgStore {
    async fn upsert(&self, status: &AppStatus) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO app_status (app_id, env_id, release_id, status, settled, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (app_id, env_id) DO UPDATE
            SET release_id = EXCLUDED.release_id,
                status = EXCLUDED.status,
                settled = EXCLUDED.settled,
                updated_at = EXCLUDED.updated_at
            WHERE (NOT app_status.settled OR app_status.release_id < EXCLUDED.release_id)
              AND (app_status.updated_at < EXCLUDED.updated_at
                   OR (app_status.updated_at = EXCLUDED.updated_at
                       AND (app_status.status <> EXCLUDED.status
                            OR app_status.settled <> EXCLUDED.settled)))
            "#,
        )
        .bind(status.app_id)
        .bind(status.env_id)
        .bind(status.release_id)
        .bind(status.status.as_str())
        .bind(status.settled)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, app_id: i64, env_id: i64) -> Result<Option<AppStatus>, StoreError> {
        let row = sqlx::query_as::<_, AppStatusRow>(
            r#"
            SELECT app_id, env_id, release_id, status, settled, updated_at
            FROM app_status
            WHERE app_id = $1 AND env_id = $2
            "#,
        )
        .bind(app_id)
        .bind(env_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }
}

#[async_trait]
impl HistoryRepository for PgStore {
    async fn save(&self, history: &DeploymentHistory) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO deployment_histories (pipeline_id, runner_id, chart_ref_id, template,
                                              strategy, strategy_config, config_maps, secrets,
                                              variable_snapshot, deployed_on, deployed_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(history.pipeline_id)
        .bind(history.runner_id)
        .bind(history.chart_ref_id)
        .bind(&history.template)
        .bind(history.strategy.as_str())
        .bind(&history.strategy_config)
        .bind(serde_json::to_value(&history.config_maps)?)
        .bind(serde_json::to_value(&history.secrets)?)
        .bind(serde_json::to_value(&history.variable_snapshot)?)
        .bind(history.deployed_on)
        .bind(history.deployed_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn find_by_pipeline_and_runner(
        &self,
        pipeline_id: i64,
        runner_id: i64,
    ) -> Result<Option<DeploymentHistory>, StoreError> {
        let row = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, pipeline_id, runner_id, chart_ref_id, template, strategy,
                   strategy_config, config_maps, secrets, variable_snapshot,
                   deployed_on, deployed_by
            FROM deployment_histories
            WHERE pipeline_id = $1 AND runner_id = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(pipeline_id)
        .bind(runner_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeploymentHistory::try_from).transpose()
    }
}

#[async_trait]
impl VariableRepository for PgStore {
    async fn find_by_names(&self, names: &[String]) -> Result<Vec<ScopedVariable>, StoreError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, VariableRow>(
            r#"
            SELECT name, value, sensitive, app_id, env_id, cluster_id
            FROM scoped_variables
            WHERE name = ANY($1)
            "#,
        )
        .bind(names)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn get_by_id_include_deleted(&self, id: i64) -> Result<Option<User>, CollaboratorError> {
        let row = sqlx::query_as::<_, UserRow>("SELECT id, email, active FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;

        Ok(row.map(|r| r.into()))
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct AppStatusRow {
    app_id: i64,
    env_id: i64,
    release_id: i64,
    status: String,
    settled: bool,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<AppStatusRow> for AppStatus {
    fn from(row: AppStatusRow) -> Self {
        AppStatus {
            app_id: row.app_id,
            env_id: row.env_id,
            release_id: row.release_id,
            status: HealthStatus::parse(&row.status),
            settled: row.settled,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    pipeline_id: i64,
    runner_id: i64,
    chart_ref_id: i64,
    template: serde_json::Value,
    strategy: String,
    strategy_config: Option<serde_json::Value>,
    config_maps: serde_json::Value,
    secrets: serde_json::Value,
    variable_snapshot: serde_json::Value,
    deployed_on: chrono::DateTime<chrono::Utc>,
    deployed_by: i64,
}

impl TryFrom<HistoryRow> for DeploymentHistory {
    type Error = StoreError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let variable_snapshot: BTreeMap<String, String> =
            serde_json::from_value(row.variable_snapshot)?;

        Ok(DeploymentHistory {
            id: row.id,
            pipeline_id: row.pipeline_id,
            runner_id: row.runner_id,
            chart_ref_id: row.chart_ref_id,
            template: row.template,
            strategy: parse_strategy(&row.strategy)?,
            strategy_config: row.strategy_config,
            config_maps: serde_json::from_value(row.config_maps)?,
            secrets: serde_json::from_value(row.secrets)?,
            variable_snapshot,
            deployed_on: row.deployed_on,
            deployed_by: row.deployed_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VariableRow {
    name: String,
    value: serde_json::Value,
    sensitive: bool,
    app_id: Option<i64>,
    env_id: Option<i64>,
    cluster_id: Option<i64>,
}

impl From<VariableRow> for ScopedVariable {
    fn from(row: VariableRow) -> Self {
        ScopedVariable {
            name: row.name,
            value: row.value,
            sensitive: row.sensitive,
            scope: VariableScope {
                app_id: row.app_id,
                env_id: row.env_id,
                cluster_id: row.cluster_id,
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    active: bool,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            active: row.active,
        }
    }
}
