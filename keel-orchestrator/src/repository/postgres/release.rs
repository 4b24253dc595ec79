//! Release Repository
//!
//! Handles all database operations related to release overrides.

use async_trait::async_trait;
use keel_core::domain::release::{
    CommitIdentity, DeploymentType, NewRelease, ReleaseOverride, ReleaseStatus,
};

use super::catalog::parse_strategy;
use super::{PgStore, conn, corrupt};
use crate::error::StoreError;
use crate::repository::{ReleaseRepository, Transaction};

const RELEASE_COLUMNS: &str = "id, pipeline_id, env_override_id, artifact_id, workflow_id, \
     counter, status, deployment_type, strategy, commit_hash, commit_time, merged_values, \
     created_by, created_on, updated_by, updated_on";

#[async_trait]
impl ReleaseRepository for PgStore {
    async fn current_counter(
        &self,
        tx: &mut dyn Transaction,
        pipeline_id: i64,
    ) -> Result<i64, StoreError> {
        let conn = conn(tx)?;

        // concurrent triggers on one pipeline queue up behind this row lock
        sqlx::query("SELECT id FROM pipelines WHERE id = $1 FOR UPDATE")
            .bind(pipeline_id)
            .fetch_optional(&mut *conn)
            .await?;

        let counter = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(counter), 0) FROM release_overrides WHERE pipeline_id = $1",
        )
        .bind(pipeline_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok(counter)
    }

    async fn insert(
        &self,
        tx: &mut dyn Transaction,
        new: &NewRelease,
        counter: i64,
    ) -> Result<ReleaseOverride, StoreError> {
        let conn = conn(tx)?;

        let row = sqlx::query_as::<_, ReleaseRow>(&format!(
            r#"
            INSERT INTO release_overrides (pipeline_id, env_override_id, artifact_id,
                                           workflow_id, counter, status, deployment_type,
                                           strategy, created_by, created_on, updated_by,
                                           updated_on)
            VALUES ($1, $2, $3, $4, $5, 'NEW', $6, $7, $8, $9, $8, $9)
            RETURNING {}
            "#,
            RELEASE_COLUMNS
        ))
        .bind(new.pipeline_id)
        .bind(new.env_override_id)
        .bind(new.artifact_id)
        .bind(new.workflow_id)
        .bind(counter)
        .bind(new.deployment_type.to_string())
        .bind(new.strategy.as_str())
        .bind(new.user_id)
        .bind(new.time)
        .fetch_one(conn)
        .await?;

        row.try_into()
    }

    async fn update_counter(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
        counter: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE release_overrides
            SET counter = $1, updated_on = NOW()
            WHERE id = $2
            "#,
        )
        .bind(counter)
        .bind(id)
        .execute(conn(tx)?)
        .await?;

        Ok(())
    }

    async fn finalize(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
        status: ReleaseStatus,
        commit: Option<&CommitIdentity>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE release_overrides
            SET status = $1,
                commit_hash = COALESCE($2, commit_hash),
                commit_time = COALESCE($3, commit_time),
                updated_on = NOW()
            WHERE id = $4 AND status = 'NEW'
            "#,
        )
        .bind(status_to_string(status))
        .bind(commit.map(|c| c.commit_hash.clone()))
        .bind(commit.map(|c| c.commit_time))
        .bind(id)
        .execute(conn(tx)?)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_pipeline_and_counter(
        &self,
        pipeline_id: i64,
        counter: i64,
    ) -> Result<Vec<ReleaseOverride>, StoreError> {
        let rows = sqlx::query_as::<_, ReleaseRow>(&format!(
            r#"
            SELECT {}
            FROM release_overrides
            WHERE pipeline_id = $1 AND counter = $2
            ORDER BY id ASC
            "#,
            RELEASE_COLUMNS
        ))
        .bind(pipeline_id)
        .bind(counter)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReleaseOverride::try_from).collect()
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<ReleaseOverride>, StoreError> {
        let row = sqlx::query_as::<_, ReleaseRow>(&format!(
            "SELECT {} FROM release_overrides WHERE id = $1",
            RELEASE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReleaseOverride::try_from).transpose()
    }

    async fn find_latest_by_app_env(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<ReleaseOverride>, StoreError> {
        let row = sqlx::query_as::<_, ReleaseRow>(&format!(
            r#"
            SELECT {}
            FROM release_overrides
            WHERE pipeline_id = (
                SELECT id FROM pipelines
                WHERE app_id = $1 AND env_id = $2 AND deleted = FALSE
                ORDER BY id DESC
                LIMIT 1
            )
            ORDER BY counter DESC, id DESC
            LIMIT 1
            "#,
            RELEASE_COLUMNS
        ))
        .bind(app_id)
        .bind(env_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReleaseOverride::try_from).transpose()
    }

    async fn find_by_commit_hash(
        &self,
        pipeline_id: i64,
        commit_hash: &str,
    ) -> Result<Option<ReleaseOverride>, StoreError> {
        let row = sqlx::query_as::<_, ReleaseRow>(&format!(
            r#"
            SELECT {}
            FROM release_overrides
            WHERE pipeline_id = $1 AND commit_hash = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
            RELEASE_COLUMNS
        ))
        .bind(pipeline_id)
        .bind(commit_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReleaseOverride::try_from).transpose()
    }

    async fn list_by_pipeline(&self, pipeline_id: i64) -> Result<Vec<ReleaseOverride>, StoreError> {
        let rows = sqlx::query_as::<_, ReleaseRow>(&format!(
            r#"
            SELECT {}
            FROM release_overrides
            WHERE pipeline_id = $1
            ORDER BY counter ASC, id ASC
            "#,
            RELEASE_COLUMNS
        ))
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReleaseOverride::try_from).collect()
    }

    async fn save_merged_values(
        &self,
        id: i64,
        values: &serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE release_overrides SET merged_values = $1 WHERE id = $2")
            .bind(values)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn status_to_string(status: ReleaseStatus) -> &'static str {
    match status {
        ReleaseStatus::New => "NEW",
        ReleaseStatus::Success => "SUCCESS",
        ReleaseStatus::Failed => "FAILED",
        ReleaseStatus::TimedOut => "TIMED_OUT",
    }
}

fn string_to_status(s: &str) -> Result<ReleaseStatus, StoreError> {
    match s {
        "NEW" => Ok(ReleaseStatus::New),
        "SUCCESS" => Ok(ReleaseStatus::Success),
        "FAILED" => Ok(ReleaseStatus::Failed),
        "TIMED_OUT" => Ok(ReleaseStatus::TimedOut),
        other => Err(corrupt("release_overrides.status", other)),
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ReleaseRow {
    id: i64,
    pipeline_id: i64,
    env_override_id: i64,
    artifact_id: i64,
    workflow_id: i64,
    counter: i64,
    status: String,
    deployment_type: String,
    strategy: String,
    commit_hash: Option<String>,
    commit_time: Option<chrono::DateTime<chrono::Utc>>,
    merged_values: Option<serde_json::Value>,
    created_by: i64,
    created_on: chrono::DateTime<chrono::Utc>,
    updated_by: i64,
    updated_on: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<ReleaseRow> for ReleaseOverride {
    type Error = StoreError;

    fn try_from(row: ReleaseRow) -> Result<Self, Self::Error> {
        Ok(ReleaseOverride {
            id: row.id,
            pipeline_id: row.pipeline_id,
            env_override_id: row.env_override_id,
            artifact_id: row.artifact_id,
            workflow_id: row.workflow_id,
            counter: row.counter,
            status: string_to_status(&row.status)?,
            deployment_type: DeploymentType::from(row.deployment_type),
            strategy: parse_strategy(&row.strategy)?,
            commit_hash: row.commit_hash,
            commit_time: row.commit_time,
            merged_values: row.merged_values,
            created_by: row.created_by,
            created_on: row.created_on,
            updated_by: row.updated_by,
            updated_on: row.updated_on,
        })
    }
}
