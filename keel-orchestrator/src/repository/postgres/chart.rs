//! Chart Repository
//!
//! Handles all database operations related to chart references, app charts,
//! environment overrides and config payloads.

use async_trait::async_trait;
use keel_core::domain::chart::{AppChart, ChartRef, EnvOverride, NewEnvOverride, OverrideStatus};
use keel_core::domain::config::ConfigPayload;

use super::{PgStore, conn, corrupt, is_unique_violation};
use crate::error::StoreError;
use crate::repository::{ChartRepo, ConfigPayloadRepository, EnvOverrideRepository, Transaction};

#[async_trait]
impl ChartRepo for PgStore {
    async fn find_chart_ref(&self, id: i64) -> Result<Option<ChartRef>, StoreError> {
        let row = sqlx::query_as::<_, ChartRefRow>(
            r#"
            SELECT id, name, version, image_descriptor_template, app_metrics_supported
            FROM chart_refs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_app_chart(&self, id: i64) -> Result<Option<AppChart>, StoreError> {
        let row = sqlx::query_as::<_, AppChartRow>(
            r#"
            SELECT id, app_id, chart_ref_id, default_values, chart_location, git_repo_url,
                   latest, created_on
            FROM app_charts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_latest_app_chart(&self, app_id: i64) -> Result<Option<AppChart>, StoreError> {
        let row = sqlx::query_as::<_, AppChartRow>(
            r#"
            SELECT id, app_id, chart_ref_id, default_values, chart_location, git_repo_url,
                   latest, created_on
            FROM app_charts
            WHERE app_id = $1 AND latest = TRUE
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_app_chart_for_env(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<AppChart>, StoreError> {
        let row = sqlx::query_as::<_, AppChartRow>(
            r#"
            SELECT c.id, c.app_id, c.chart_ref_id, c.default_values, c.chart_location,
                   c.git_repo_url, c.latest, c.created_on
            FROM app_charts c
            INNER JOIN env_overrides o ON o.chart_id = c.id
            WHERE o.app_id = $1 AND o.env_id = $2 AND o.latest = TRUE AND o.active = TRUE
            LIMIT 1
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
impl EnvOverrideRepository for PgStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<EnvOverride>, StoreError> {
        let row = sqlx::query_as::<_, EnvOverrideRow>(
            r#"
            SELECT id, app_id, env_id, chart_id, env_values, namespace, is_override,
                   latest, status, active
            FROM env_overrides
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EnvOverride::try_from).transpose()
    }

    async fn find_latest(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<EnvOverride>, StoreError> {
        let row = sqlx::query_as::<_, EnvOverrideRow>(
            r#"
            SELECT id, app_id, env_id, chart_id, env_values, namespace, is_override,
                   latest, status, active
            FROM env_overrides
            WHERE app_id = $1 AND env_id = $2 AND latest = TRUE AND active = TRUE
            "#,
        )
        .bind(app_id)
        .bind(env_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EnvOverride::try_from).transpose()
    }

    async fn find_by_chart(
        &self,
        app_id: i64,
        env_id: i64,
        chart_id: i64,
    ) -> Result<Option<EnvOverride>, StoreError> {
        let row = sqlx::query_as::<_, EnvOverrideRow>(
            r#"
            SELECT id, app_id, env_id, chart_id, env_values, namespace, is_override,
                   latest, status, active
            FROM env_overrides
            WHERE app_id = $1 AND env_id = $2 AND chart_id = $3
            "#,
        )
        .bind(app_id)
        .bind(env_id)
        .bind(chart_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EnvOverride::try_from).transpose()
    }

    async fn save_if_absent(
        &self,
        tx: &mut dyn Transaction,
        new: &NewEnvOverride,
    ) -> Result<EnvOverride, StoreError> {
        let conn = conn(tx)?;

        let inserted = sqlx::query_as::<_, EnvOverrideRow>(
            r#"
            INSERT INTO env_overrides (app_id, env_id, chart_id, env_values, namespace,
                                       is_override, latest, status, active, created_by,
                                       created_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'NEW', TRUE, $8, NOW())
            ON CONFLICT (app_id, env_id, chart_id) DO NOTHING
            RETURNING id, app_id, env_id, chart_id, env_values, namespace, is_override,
                      latest, status, active
            "#,
        )
        .bind(new.app_id)
        .bind(new.env_id)
        .bind(new.chart_id)
        .bind(&new.values)
        .bind(&new.namespace)
        .bind(new.is_override)
        .bind(new.latest)
        .bind(new.created_by)
        .fetch_optional(&mut *conn)
        .await;

        let inserted = match inserted {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Conflict(format!(
                    "a latest environment override already exists for app {} env {}",
                    new.app_id, new.env_id
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(row) = inserted {
            return row.try_into();
        }

        // a concurrent first deploy won the insert
        let existing = sqlx::query_as::<_, EnvOverrideRow>(
            r#"
            SELECT id, app_id, env_id, chart_id, env_values, namespace, is_override,
                   latest, status, active
            FROM env_overrides
            WHERE app_id = $1 AND env_id = $2 AND chart_id = $3
            "#,
        )
        .bind(new.app_id)
        .bind(new.env_id)
        .bind(new.chart_id)
        .fetch_one(&mut *conn)
        .await?;

        existing.try_into()
    }
}

#[async_trait]
impl ConfigPayloadRepository for PgStore {
    async fn find_app_level(&self, app_id: i64) -> Result<Option<ConfigPayload>, StoreError> {
        let row = sqlx::query_as::<_, ConfigPayloadRow>(
            r#"
            SELECT id, app_id, env_id, config_maps, secrets
            FROM config_payloads
            WHERE app_id = $1 AND env_id IS NULL
            "#,
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ConfigPayload::try_from).transpose()
    }

    async fn find_env_level(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<ConfigPayload>, StoreError> {
        let row = sqlx::query_as::<_, ConfigPayloadRow>(
            r#"
            SELECT id, app_id, env_id, config_maps, secrets
            FROM config_payloads
            WHERE app_id = $1 AND env_id = $2
            "#,
        )
        .bind(app_id)
        .bind(env_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ConfigPayload::try_from).transpose()
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn string_to_override_status(s: &str) -> Result<OverrideStatus, StoreError> {
    match s {
        "NEW" => Ok(OverrideStatus::New),
        "SUCCESS" => Ok(OverrideStatus::Success),
        "ERROR" => Ok(OverrideStatus::Error),
        other => Err(corrupt("env_overrides.status", other)),
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ChartRefRow {
    id: i64,
    name: String,
    version: String,
    image_descriptor_template: String,
    app_metrics_supported: bool,
}

impl From<ChartRefRow> for ChartRef {
    fn from(row: ChartRefRow) -> Self {
        ChartRef {
            id: row.id,
            name: row.name,
            version: row.version,
            image_descriptor_template: row.image_descriptor_template,
            app_metrics_supported: row.app_metrics_supported,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AppChartRow {
    id: i64,
    app_id: i64,
    chart_ref_id: i64,
    default_values: serde_json::Value,
    chart_location: String,
    git_repo_url: Option<String>,
    latest: bool,
    created_on: chrono::DateTime<chrono::Utc>,
}

impl From<AppChartRow> for AppChart {
    fn from(row: AppChartRow) -> Self {
        AppChart {
            id: row.id,
            app_id: row.app_id,
            chart_ref_id: row.chart_ref_id,
            values: row.default_values,
            chart_location: row.chart_location,
            git_repo_url: row.git_repo_url,
            latest: row.latest,
            created_on: row.created_on,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EnvOverrideRow {
    id: i64,
    app_id: i64,
    env_id: i64,
    chart_id: i64,
    env_values: serde_json::Value,
    namespace: String,
    is_override: bool,
    latest: bool,
    status: String,
    active: bool,
}

impl TryFrom<EnvOverrideRow> for EnvOverride {
    type Error = StoreError;

    fn try_from(row: EnvOverrideRow) -> Result<Self, Self::Error> {
        Ok(EnvOverride {
            id: row.id,
            app_id: row.app_id,
            env_id: row.env_id,
            chart_id: row.chart_id,
            values: row.env_values,
            namespace: row.namespace,
            is_override: row.is_override,
            latest: row.latest,
            status: string_to_override_status(&row.status)?,
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ConfigPayloadRow {
    id: i64,
    app_id: i64,
    env_id: Option<i64>,
    config_maps: serde_json::Value,
    secrets: serde_json::Value,
}

impl TryFrom<ConfigPayloadRow> for ConfigPayload {
    type Error = StoreError;

    fn try_from(row: ConfigPayloadRow) -> Result<Self, Self::Error> {
        Ok(ConfigPayload {
            id: row.id,
            app_id: row.app_id,
            env_id: row.env_id,
            config_maps: serde_json::from_value(row.config_maps)?,
            secrets: serde_json::from_value(row.secrets)?,
        })
    }
}
