//! Workflow Repository
//!
//! Handles all database operations related to CD workflows and their runners.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::domain::runner::{NewRunner, Runner, RunnerStatus, Workflow, WorkflowStage};

use super::catalog::{string_to_target, target_to_string};
use super::{PgStore, conn, corrupt};
use crate::error::StoreError;
use crate::repository::{Transaction, WorkflowRepository};

const RUNNER_COLUMNS: &str = "id, workflow_id, release_override_id, stage, status, deploy_target, \
     started_on, finished_on, triggered_by, message";

#[async_trait]
impl WorkflowRepository for PgStore {
    async fn create_workflow(
        &self,
        tx: &mut dyn Transaction,
        pipeline_id: i64,
        artifact_id: i64,
        time: DateTime<Utc>,
    ) -> Result<Workflow, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO cd_workflows (pipeline_id, artifact_id, created_on)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(pipeline_id)
        .bind(artifact_id)
        .bind(time)
        .fetch_one(conn(tx)?)
        .await?;

        Ok(Workflow {
            id,
            pipeline_id,
            artifact_id,
            created_on: time,
        })
    }

    async fn find_workflow(&self, id: i64) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            "SELECT id, pipeline_id, artifact_id, created_on FROM cd_workflows WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn create_runner(
        &self,
        tx: &mut dyn Transaction,
        new: &NewRunner,
    ) -> Result<Runner, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO cd_workflow_runners (workflow_id, release_override_id, stage, status,
                                             deploy_target, started_on, triggered_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(new.workflow_id)
        .bind(new.release_override_id)
        .bind(stage_to_string(new.stage))
        .bind(status_to_string(new.status))
        .bind(target_to_string(new.deploy_target))
        .bind(new.started_on)
        .bind(new.triggered_by)
        .fetch_one(conn(tx)?)
        .await?;

        Ok(Runner {
            id,
            workflow_id: new.workflow_id,
            release_override_id: new.release_override_id,
            stage: new.stage,
            status: new.status,
            deploy_target: new.deploy_target,
            started_on: new.started_on,
            finished_on: None,
            triggered_by: new.triggered_by,
            message: None,
        })
    }

    async fn find_runner(&self, id: i64) -> Result<Option<Runner>, StoreError> {
        let row = sqlx::query_as::<_, RunnerRow>(&format!(
            "SELECT {} FROM cd_workflow_runners WHERE id = $1",
            RUNNER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Runner::try_from).transpose()
    }

    async fn lock_runner(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
    ) -> Result<Option<Runner>, StoreError> {
        let row = sqlx::query_as::<_, RunnerRow>(&format!(
            "SELECT {} FROM cd_workflow_runners WHERE id = $1 FOR UPDATE",
            RUNNER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(conn(tx)?)
        .await?;

        row.map(Runner::try_from).transpose()
    }

    async fn find_latest_runner(
        &self,
        workflow_id: i64,
        stage: WorkflowStage,
    ) -> Result<Option<Runner>, StoreError> {
        let row = sqlx::query_as::<_, RunnerRow>(&format!(
            r#"
            SELECT {}
            FROM cd_workflow_runners
            WHERE workflow_id = $1 AND stage = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
            RUNNER_COLUMNS
        ))
        .bind(workflow_id)
        .bind(stage_to_string(stage))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Runner::try_from).transpose()
    }

    async fn find_latest_non_failed_deploy_runner(
        &self,
        pipeline_id: i64,
    ) -> Result<Option<Runner>, StoreError> {
        let row = sqlx::query_as::<_, RunnerRow>(
            r#"
            SELECT r.id, r.workflow_id, r.release_override_id, r.stage, r.status,
                   r.deploy_target, r.started_on, r.finished_on, r.triggered_by, r.message
            FROM cd_workflow_runners r
            INNER JOIN cd_workflows w ON w.id = r.workflow_id
            WHERE w.pipeline_id = $1 AND r.stage = 'DEPLOY' AND r.status <> 'FAILED'
            ORDER BY r.id DESC
            LIMIT 1
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Runner::try_from).transpose()
    }

    async fn list_active_deploy_runners(
        &self,
        pipeline_id: Option<i64>,
    ) -> Result<Vec<Runner>, StoreError> {
        let rows = sqlx::query_as::<_, RunnerRow>(
            r#"
            SELECT r.id, r.workflow_id, r.release_override_id, r.stage, r.status,
                   r.deploy_target, r.started_on, r.finished_on, r.triggered_by, r.message
            FROM cd_workflow_runners r
            INNER JOIN cd_workflows w ON w.id = r.workflow_id
            WHERE r.stage = 'DEPLOY'
              AND r.status NOT IN ('SUCCEEDED', 'FAILED', 'TIMED_OUT')
              AND r.release_override_id IS NOT NULL
              AND ($1::BIGINT IS NULL OR w.pipeline_id = $1)
            ORDER BY r.id ASC
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Runner::try_from).collect()
    }

    async fn update_runner_status(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
        status: RunnerStatus,
        finished_on: Option<DateTime<Utc>>,
        message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE cd_workflow_runners
            SET status = $1,
                finished_on = COALESCE($2, finished_on),
                message = COALESCE($3, message)
            WHERE id = $4 AND status NOT IN ('SUCCEEDED', 'FAILED', 'TIMED_OUT')
            "#,
        )
        .bind(status_to_string(status))
        .bind(finished_on)
        .bind(message)
        .bind(id)
        .execute(conn(tx)?)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn stage_to_string(stage: WorkflowStage) -> &'static str {
    match stage {
        WorkflowStage::Pre => "PRE",
        WorkflowStage::Deploy => "DEPLOY",
        WorkflowStage::Post => "POST",
    }
}

fn string_to_stage(s: &str) -> Result<WorkflowStage, StoreError> {
    match s {
        "PRE" => Ok(WorkflowStage::Pre),
        "DEPLOY" => Ok(WorkflowStage::Deploy),
        "POST" => Ok(WorkflowStage::Post),
        other => Err(corrupt("cd_workflow_runners.stage", other)),
    }
}

fn status_to_string(status: RunnerStatus) -> &'static str {
    match status {
        RunnerStatus::Queued => "QUEUED",
        RunnerStatus::Initiated => "INITIATED",
        RunnerStatus::InProgress => "IN_PROGRESS",
        RunnerStatus::Succeeded => "SUCCEEDED",
        RunnerStatus::Failed => "FAILED",
        RunnerStatus::TimedOut => "TIMED_OUT",
    }
}

fn string_to_status(s: &str) -> Result<RunnerStatus, StoreError> {
    match s {
        "QUEUED" => Ok(RunnerStatus::Queued),
        "INITIATED" => Ok(RunnerStatus::Initiated),
        "IN_PROGRESS" => Ok(RunnerStatus::InProgress),
        "SUCCEEDED" => Ok(RunnerStatus::Succeeded),
        "FAILED" => Ok(RunnerStatus::Failed),
        "TIMED_OUT" => Ok(RunnerStatus::TimedOut),
        other => Err(corrupt("cd_workflow_runners.status", other)),
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: i64,
    pipeline_id: i64,
    artifact_id: i64,
    created_on: DateTime<Utc>,
}

impl From<WorkflowRow> for Workflow {
    fn from(row: WorkflowRow) -> Self {
        Workflow {
            id: row.id,
            pipeline_id: row.pipeline_id,
            artifact_id: row.artifact_id,
            created_on: row.created_on,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunnerRow {
    id: i64,
    workflow_id: i64,
    release_override_id: Option<i64>,
    stage: String,
    status: String,
    deploy_target: String,
    started_on: DateTime<Utc>,
    finished_on: Option<DateTime<Utc>>,
    triggered_by: i64,
    message: Option<String>,
}

impl TryFrom<RunnerRow> for Runner {
    type Error = StoreError;

    fn try_from(row: RunnerRow) -> Result<Self, Self::Error> {
        Ok(Runner {
            id: row.id,
            workflow_id: row.workflow_id,
            release_override_id: row.release_override_id,
            stage: string_to_stage(&row.stage)?,
            status: string_to_status(&row.status)?,
            deploy_target: string_to_target(&row.deploy_target)?,
            started_on: row.started_on,
            finished_on: row.finished_on,
            triggered_by: row.triggered_by,
            message: row.message,
        })
    }
}
