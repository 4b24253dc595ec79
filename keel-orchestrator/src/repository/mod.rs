//! Repository Module
//!
//! Config store gateway. One repository trait per aggregate, with a
//! PostgreSQL implementation for production and an in-memory implementation
//! for development and tests. Mutating operations that must be atomic take a
//! [`Transaction`] handle obtained from the [`TransactionManager`].
//!
//! Reads return `Ok(None)` for not-found and `Err` for read failures.

pub mod memory;
pub mod postgres;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::collab::UserDirectory;
use keel_core::domain::catalog::{
    AppLabel, Application, Artifact, DbMigrationConfig, DeploymentStrategy, Environment, Pipeline,
    StrategyConfig,
};
use keel_core::domain::chart::{AppChart, ChartRef, EnvOverride, NewEnvOverride};
use keel_core::domain::config::ConfigPayload;
use keel_core::domain::history::DeploymentHistory;
use keel_core::domain::release::{CommitIdentity, NewRelease, ReleaseOverride, ReleaseStatus};
use keel_core::domain::runner::{NewRunner, Runner, RunnerStatus, Workflow, WorkflowStage};
use keel_core::domain::status::AppStatus;
use keel_core::domain::timeline::{NewTimelineEntry, TimelineEntry};
use keel_core::domain::variable::ScopedVariable;

use crate::error::StoreError;

pub use memory::MemoryStore;

// =============================================================================
// Transactions
// =============================================================================

/// An open store transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;

    /// Backend-specific handle, downcast by the owning repository
    fn as_any(&mut self) -> &mut dyn Any;
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

// =============================================================================
// Catalog
// =============================================================================

/// Read access to catalog rows owned by the wider control plane
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    async fn find_application(&self, id: i64) -> Result<Option<Application>, StoreError>;

    async fn find_environment(&self, id: i64) -> Result<Option<Environment>, StoreError>;

    async fn find_pipeline(&self, id: i64) -> Result<Option<Pipeline>, StoreError>;

    async fn find_pipeline_by_app_env(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<Pipeline>, StoreError>;

    /// Non-deleted pipelines bound to a CD-agent application name
    async fn find_pipelines_by_deployment_app_name(
        &self,
        name: &str,
    ) -> Result<Vec<Pipeline>, StoreError>;

    async fn find_artifact(&self, id: i64) -> Result<Option<Artifact>, StoreError>;

    async fn find_strategy(
        &self,
        pipeline_id: i64,
        strategy: DeploymentStrategy,
    ) -> Result<Option<StrategyConfig>, StoreError>;

    async fn find_db_migration_config(
        &self,
        pipeline_id: i64,
    ) -> Result<Option<DbMigrationConfig>, StoreError>;

    async fn find_app_labels(&self, app_id: i64) -> Result<Vec<AppLabel>, StoreError>;

    /// Name of the image pull secret a registry requires on a cluster
    async fn find_pull_secret(
        &self,
        registry_id: &str,
        cluster_id: i64,
    ) -> Result<Option<String>, StoreError>;
}

// =============================================================================
// Charts & Overrides
// =============================================================================

#[async_trait]
pub trait ChartRepo: Send + Sync {
    async fn find_chart_ref(&self, id: i64) -> Result<Option<ChartRef>, StoreError>;

    async fn find_app_chart(&self, id: i64) -> Result<Option<AppChart>, StoreError>;

    /// Latest app chart of an application
    async fn find_latest_app_chart(&self, app_id: i64) -> Result<Option<AppChart>, StoreError>;

    /// App chart referenced by the latest environment override of (app, env)
    async fn find_app_chart_for_env(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<AppChart>, StoreError>;
}

#[async_trait]
pub trait EnvOverrideRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<EnvOverride>, StoreError>;

    async fn find_latest(&self, app_id: i64, env_id: i64)
    -> Result<Option<EnvOverride>, StoreError>;

    async fn find_by_chart(
        &self,
        app_id: i64,
        env_id: i64,
        chart_id: i64,
    ) -> Result<Option<EnvOverride>, StoreError>;

    /// Inserts unless a row for (app, env, chart) exists; returns the stored row.
    /// Idempotent under concurrent first deploys.
    async fn save_if_absent(
        &self,
        tx: &mut dyn Transaction,
        new: &NewEnvOverride,
    ) -> Result<EnvOverride, StoreError>;
}

#[async_trait]
pub trait ConfigPayloadRepository: Send + Sync {
    async fn find_app_level(&self, app_id: i64) -> Result<Option<ConfigPayload>, StoreError>;

    async fn find_env_level(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<ConfigPayload>, StoreError>;
}

// =============================================================================
// Releases
// =============================================================================

#[async_trait]
pub trait ReleaseRepository: Send + Sync {
    /// Highest counter of a pipeline (0 when none); serializes concurrent
    /// increments on the pipeline for the rest of the transaction
    async fn current_counter(
        &self,
        tx: &mut dyn Transaction,
        pipeline_id: i64,
    ) -> Result<i64, StoreError>;

    async fn insert(
        &self,
        tx: &mut dyn Transaction,
        new: &NewRelease,
        counter: i64,
    ) -> Result<ReleaseOverride, StoreError>;

    async fn update_counter(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
        counter: i64,
    ) -> Result<(), StoreError>;

    /// Sets status and commit identity unless the release is already terminal;
    /// returns whether a row changed
    async fn finalize(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
        status: ReleaseStatus,
        commit: Option<&CommitIdentity>,
    ) -> Result<bool, StoreError>;

    /// Rows with a given (pipeline, counter), ordered by id
    async fn find_by_pipeline_and_counter(
        &self,
        pipeline_id: i64,
        counter: i64,
    ) -> Result<Vec<ReleaseOverride>, StoreError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<ReleaseOverride>, StoreError>;

    /// Release with the highest counter on the (app, env) pipeline
    async fn find_latest_by_app_env(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<ReleaseOverride>, StoreError>;

    async fn find_by_commit_hash(
        &self,
        pipeline_id: i64,
        commit_hash: &str,
    ) -> Result<Option<ReleaseOverride>, StoreError>;

    async fn list_by_pipeline(&self, pipeline_id: i64) -> Result<Vec<ReleaseOverride>, StoreError>;

    async fn save_merged_values(
        &self,
        id: i64,
        values: &serde_json::Value,
    ) -> Result<(), StoreError>;
}

// =============================================================================
// Workflows & Runners
// =============================================================================

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn create_workflow(
        &self,
        tx: &mut dyn Transaction,
        pipeline_id: i64,
        artifact_id: i64,
        time: DateTime<Utc>,
    ) -> Result<Workflow, StoreError>;

    async fn find_workflow(&self, id: i64) -> Result<Option<Workflow>, StoreError>;

    async fn create_runner(
        &self,
        tx: &mut dyn Transaction,
        new: &NewRunner,
    ) -> Result<Runner, StoreError>;

    async fn find_runner(&self, id: i64) -> Result<Option<Runner>, StoreError>;

    /// Reads a runner and holds its row lock until the transaction ends
    async fn lock_runner(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
    ) -> Result<Option<Runner>, StoreError>;

    async fn find_latest_runner(
        &self,
        workflow_id: i64,
        stage: WorkflowStage,
    ) -> Result<Option<Runner>, StoreError>;

    /// Latest deploy-stage runner of a pipeline whose status is not FAILED
    async fn find_latest_non_failed_deploy_runner(
        &self,
        pipeline_id: i64,
    ) -> Result<Option<Runner>, StoreError>;

    /// Non-terminal deploy-stage runners, optionally restricted to one pipeline
    async fn list_active_deploy_runners(
        &self,
        pipeline_id: Option<i64>,
    ) -> Result<Vec<Runner>, StoreError>;

    /// Moves a runner to `status` unless it is already terminal; returns
    /// whether a row changed
    async fn update_runner_status(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
        status: RunnerStatus,
        finished_on: Option<DateTime<Utc>>,
        message: Option<&str>,
    ) -> Result<bool, StoreError>;
}

// =============================================================================
// Timeline
// =============================================================================

#[async_trait]
pub trait TimelineRepository: Send + Sync {
    /// Entries of a runner ordered by status time, then insertion
    async fn find_by_runner(&self, runner_id: i64) -> Result<Vec<TimelineEntry>, StoreError>;

    async fn list_for_runner(
        &self,
        tx: &mut dyn Transaction,
        runner_id: i64,
    ) -> Result<Vec<TimelineEntry>, StoreError>;

    /// Saves the entry unless (runner, status) exists or a terminal entry is
    /// already present; `None` when nothing was written
    async fn insert_if_absent(
        &self,
        tx: &mut dyn Transaction,
        entry: &NewTimelineEntry,
    ) -> Result<Option<TimelineEntry>, StoreError>;
}

// =============================================================================
// App Status, History, Variables
// =============================================================================

#[async_trait]
pub trait AppStatusRepository: Send + Sync {
    /// Last-writer-wins upsert by `updated_at`, refused while the row is
    /// settled for the same or a newer release; returns whether the row changed
    async fn upsert(&self, status: &AppStatus) -> Result<bool, StoreError>;

    async fn find(&self, app_id: i64, env_id: i64) -> Result<Option<AppStatus>, StoreError>;
}

#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn save(&self, history: &DeploymentHistory) -> Result<i64, StoreError>;

    async fn find_by_pipeline_and_runner(
        &self,
        pipeline_id: i64,
        runner_id: i64,
    ) -> Result<Option<DeploymentHistory>, StoreError>;
}

#[async_trait]
pub trait VariableRepository: Send + Sync {
    /// Stored variables with any of the given names
    async fn find_by_names(&self, names: &[String]) -> Result<Vec<ScopedVariable>, StoreError>;
}

// =============================================================================
// Store Bundle
// =============================================================================

/// All repositories the engine needs, behind trait objects
#[derive(Clone)]
pub struct Stores {
    pub transactions: Arc<dyn TransactionManager>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub charts: Arc<dyn ChartRepo>,
    pub env_overrides: Arc<dyn EnvOverrideRepository>,
    pub config_payloads: Arc<dyn ConfigPayloadRepository>,
    pub releases: Arc<dyn ReleaseRepository>,
    pub workflows: Arc<dyn WorkflowRepository>,
    pub timelines: Arc<dyn TimelineRepository>,
    pub app_status: Arc<dyn AppStatusRepository>,
    pub history: Arc<dyn HistoryRepository>,
    pub variables: Arc<dyn VariableRepository>,
    pub users: Arc<dyn UserDirectory>,
}

impl Stores {
    /// Every repository served by one in-memory store
    pub fn in_memory(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            transactions: store.clone(),
            catalog: store.clone(),
            charts: store.clone(),
            env_overrides: store.clone(),
            config_payloads: store.clone(),
            releases: store.clone(),
            workflows: store.clone(),
            timelines: store.clone(),
            app_status: store.clone(),
            history: store.clone(),
            variables: store.clone(),
            users: store,
        }
    }

    /// Every repository served by PostgreSQL
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let store = Arc::new(postgres::PgStore::new(pool));
        Self {
            transactions: store.clone(),
            catalog: store.clone(),
            charts: store.clone(),
            env_overrides: store.clone(),
            config_payloads: store.clone(),
            releases: store.clone(),
            workflows: store.clone(),
            timelines: store.clone(),
            app_status: store.clone(),
            history: store.clone(),
            variables: store.clone(),
            users: store,
        }
    }
}

