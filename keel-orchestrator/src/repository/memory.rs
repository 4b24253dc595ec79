//! In-memory store
//!
//! Backs every repository trait with a single mutex-guarded state. A
//! transaction holds the mutex for its whole lifetime, so transactions are
//! serialized; an uncommitted transaction restores its snapshot on drop.
//! Used for development (`STORAGE_BACKEND=memory`) and tests.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::collab::{CollaboratorError, UserDirectory};
use keel_core::domain::catalog::{
    AppLabel, Application, Artifact, DbMigrationConfig, DeploymentStrategy, Environment, Pipeline,
    StrategyConfig, User,
};
use keel_core::domain::chart::{AppChart, ChartRef, EnvOverride, NewEnvOverride, OverrideStatus};
use keel_core::domain::config::ConfigPayload;
use keel_core::domain::history::DeploymentHistory;
use keel_core::domain::release::{CommitIdentity, NewRelease, ReleaseOverride, ReleaseStatus};
use keel_core::domain::runner::{NewRunner, Runner, RunnerStatus, Workflow, WorkflowStage};
use keel_core::domain::status::AppStatus;
use keel_core::domain::timeline::{NewTimelineEntry, TimelineEntry};
use keel_core::domain::variable::ScopedVariable;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    AppStatusRepository, CatalogRepository, ChartRepo, ConfigPayloadRepository,
    EnvOverrideRepository, HistoryRepository, ReleaseRepository, TimelineRepository, Transaction,
    TransactionManager, VariableRepository, WorkflowRepository,
};
use crate::error::StoreError;

/// Registry pull secret binding; `cluster_id = None` applies to every cluster
#[derive(Debug, Clone)]
pub struct PullSecretBinding {
    pub registry_id: String,
    pub cluster_id: Option<i64>,
    pub secret_name: String,
}

/// Complete in-memory state, exposed for seeding and assertions
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub next_id: i64,
    pub applications: BTreeMap<i64, Application>,
    pub environments: BTreeMap<i64, Environment>,
    pub pipelines: BTreeMap<i64, Pipeline>,
    pub artifacts: BTreeMap<i64, Artifact>,
    pub strategies: Vec<StrategyConfig>,
    pub db_migrations: BTreeMap<i64, DbMigrationConfig>,
    pub labels: BTreeMap<i64, Vec<AppLabel>>,
    pub pull_secrets: Vec<PullSecretBinding>,
    pub users: BTreeMap<i64, User>,
    pub chart_refs: BTreeMap<i64, ChartRef>,
    pub app_charts: BTreeMap<i64, AppChart>,
    pub env_overrides: BTreeMap<i64, EnvOverride>,
    pub config_payloads: Vec<ConfigPayload>,
    pub variables: Vec<ScopedVariable>,
    pub workflows: BTreeMap<i64, Workflow>,
    pub runners: BTreeMap<i64, Runner>,
    pub releases: BTreeMap<i64, ReleaseOverride>,
    pub timeline: Vec<TimelineEntry>,
    pub app_status: BTreeMap<(i64, i64), AppStatus>,
    pub history: BTreeMap<i64, DeploymentHistory>,
}

impl MemoryState {
    /// Allocates a fresh id; seeded rows should use ids below 1000
    pub fn next_id(&mut self) -> i64 {
        if self.next_id < 1000 {
            self.next_id = 1000;
        }
        self.next_id += 1;
        self.next_id
    }

    fn pipeline_of_runner(&self, runner: &Runner) -> Option<i64> {
        self.workflows
            .get(&runner.workflow_id)
            .map(|w| w.pipeline_id)
    }

    fn sorted_timeline(&self, runner_id: i64) -> Vec<TimelineEntry> {
        let mut entries: Vec<TimelineEntry> = self
            .timeline
            .iter()
            .filter(|e| e.runner_id == runner_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.status_time.cmp(&b.status_time).then(a.id.cmp(&b.id)));
        entries
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutates the state directly, outside any transaction
    pub async fn seed<F>(&self, f: F)
    where
        F: FnOnce(&mut MemoryState),
    {
        let mut state = self.state.lock().await;
        f(&mut state);
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

// =============================================================================
// Transactions
// =============================================================================

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self;
        tx.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        // the snapshot is restored on drop
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

fn tx_state(tx: &mut dyn Transaction) -> Result<&mut MemoryState, StoreError> {
    tx.as_any()
        .downcast_mut::<MemoryTransaction>()
        .map(|t| &mut *t.guard)
        .ok_or(StoreError::ForeignTransaction)
}

#[async_trait]
impl TransactionManager for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            snapshot: Some(snapshot),
        }))
    }
}

// =============================================================================
// Catalog
// =============================================================================

#[async_trait]
impl CatalogRepository for MemoryStore {
    async fn find_application(&self, id: i64) -> Result<Option<Application>, StoreError> {
        Ok(self.state.lock().await.applications.get(&id).cloned())
    }

    async fn find_environment(&self, id: i64) -> Result<Option<Environment>, StoreError> {
        Ok(self.state.lock().await.environments.get(&id).cloned())
    }

    async fn find_pipeline(&self, id: i64) -> Result<Option<Pipeline>, StoreError> {
        Ok(self.state.lock().await.pipelines.get(&id).cloned())
    }

    async fn find_pipeline_by_app_env(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<Pipeline>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .pipelines
            .values()
            .find(|p| p.app_id == app_id && p.env_id == env_id && !p.deleted)
            .cloned())
    }

    async fn find_pipelines_by_deployment_app_name(
        &self,
        name: &str,
    ) -> Result<Vec<Pipeline>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .pipelines
            .values()
            .filter(|p| p.deployment_app_name == name && !p.deleted)
            .cloned()
            .collect())
    }

    async fn find_artifact(&self, id: i64) -> Result<Option<Artifact>, StoreError> {
        Ok(self.state.lock().await.artifacts.get(&id).cloned())
    }

    async fn find_strategy(
        &self,
        pipeline_id: i64,
        strategy: DeploymentStrategy,
    ) -> Result<Option<StrategyConfig>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .strategies
            .iter()
            .find(|s| s.pipeline_id == pipeline_id && s.strategy == strategy)
            .cloned())
    }

    async fn find_db_migration_config(
        &self,
        pipeline_id: i64,
    ) -> Result<Option<DbMigrationConfig>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .db_migrations
            .get(&pipeline_id)
            .filter(|c| c.active)
            .cloned())
    }

    async fn find_app_labels(&self, app_id: i64) -> Result<Vec<AppLabel>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.labels.get(&app_id).cloned().unwrap_or_default())
    }

    async fn find_pull_secret(
        &self,
        registry_id: &str,
        cluster_id: i64,
    ) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        let exact = state
            .pull_secrets
            .iter()
            .find(|b| b.registry_id == registry_id && b.cluster_id == Some(cluster_id));
        let any = state
            .pull_secrets
            .iter()
            .find(|b| b.registry_id == registry_id && b.cluster_id.is_none());
        Ok(exact.or(any).map(|b| b.secret_name.clone()))
    }
}

// =============================================================================
// Charts & Overrides
// =============================================================================

#[async_trait]
impl ChartRepo for MemoryStore {
    async fn find_chart_ref(&self, id: i64) -> Result<Option<ChartRef>, StoreError> {
        Ok(self.state.lock().await.chart_refs.get(&id).cloned())
    }

    async fn find_app_chart(&self, id: i64) -> Result<Option<AppChart>, StoreError> {
        Ok(self.state.lock().await.app_charts.get(&id).cloned())
    }

    async fn find_latest_app_chart(&self, app_id: i64) -> Result<Option<AppChart>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .app_charts
            .values()
            .filter(|c| c.app_id == app_id && c.latest)
            .max_by_key(|c| c.id)
            .cloned())
    }

    async fn find_app_chart_for_env(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<AppChart>, StoreError> {
        let state = self.state.lock().await;
        let chart_id = state
            .env_overrides
            .values()
            .find(|o| o.app_id == app_id && o.env_id == env_id && o.latest && o.active)
            .map(|o| o.chart_id);
        Ok(chart_id.and_then(|id| state.app_charts.get(&id).cloned()))
    }
}

#[async_trait]
impl EnvOverrideRepository for MemoryStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<EnvOverride>, StoreError> {
        Ok(self.state.lock().await.env_overrides.get(&id).cloned())
    }

    async fn find_latest(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<EnvOverride>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .env_overrides
            .values()
            .find(|o| o.app_id == app_id && o.env_id == env_id && o.latest && o.active)
            .cloned())
    }

    async fn find_by_chart(
        &self,
        app_id: i64,
        env_id: i64,
        chart_id: i64,
    ) -> Result<Option<EnvOverride>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .env_overrides
            .values()
            .find(|o| o.app_id == app_id && o.env_id == env_id && o.chart_id == chart_id)
            .cloned())
    }

    async fn save_if_absent(
        &self,
        tx: &mut dyn Transaction,
        new: &NewEnvOverride,
    ) -> Result<EnvOverride, StoreError> {
        let state = tx_state(tx)?;

        if let Some(existing) = state.env_overrides.values().find(|o| {
            o.app_id == new.app_id && o.env_id == new.env_id && o.chart_id == new.chart_id
        }) {
            return Ok(existing.clone());
        }

        if new.latest
            && state
                .env_overrides
                .values()
                .any(|o| o.app_id == new.app_id && o.env_id == new.env_id && o.latest)
        {
            return Err(StoreError::Conflict(format!(
                "a latest environment override already exists for app {} env {}",
                new.app_id, new.env_id
            )));
        }

        let id = state.next_id();
        let row = EnvOverride {
            id,
            app_id: new.app_id,
            env_id: new.env_id,
            chart_id: new.chart_id,
            values: new.values.clone(),
            namespace: new.namespace.clone(),
            is_override: new.is_override,
            latest: new.latest,
            status: OverrideStatus::New,
            active: true,
        };
        state.env_overrides.insert(id, row.clone());
        Ok(row)
    }
}

#[async_trait]
impl ConfigPayloadRepository for MemoryStore {
    async fn find_app_level(&self, app_id: i64) -> Result<Option<ConfigPayload>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .config_payloads
            .iter()
            .find(|p| p.app_id == app_id && p.env_id.is_none())
            .cloned())
    }

    async fn find_env_level(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<ConfigPayload>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .config_payloads
            .iter()
            .find(|p| p.app_id == app_id && p.env_id == Some(env_id))
            .cloned())
    }
}

// =============================================================================
// Releases
// =============================================================================

#[async_trait]
impl ReleaseRepository for MemoryStore {
    async fn current_counter(
        &self,
        tx: &mut dyn Transaction,
        pipeline_id: i64,
    ) -> Result<i64, StoreError> {
        let state = tx_state(tx)?;
        Ok(state
            .releases
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .map(|r| r.counter)
            .max()
            .unwrap_or(0))
    }

    async fn insert(
        &self,
        tx: &mut dyn Transaction,
        new: &NewRelease,
        counter: i64,
    ) -> Result<ReleaseOverride, StoreError> {
        let state = tx_state(tx)?;
        let id = state.next_id();
        let release = ReleaseOverride {
            id,
            pipeline_id: new.pipeline_id,
            env_override_id: new.env_override_id,
            artifact_id: new.artifact_id,
            workflow_id: new.workflow_id,
            counter,
            status: ReleaseStatus::New,
            deployment_type: new.deployment_type,
            strategy: new.strategy,
            commit_hash: None,
            commit_time: None,
            merged_values: None,
            created_by: new.user_id,
            created_on: new.time,
            updated_by: new.user_id,
            updated_on: new.time,
        };
        state.releases.insert(id, release.clone());
        Ok(release)
    }

    async fn update_counter(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
        counter: i64,
    ) -> Result<(), StoreError> {
        let state = tx_state(tx)?;
        if let Some(release) = state.releases.get_mut(&id) {
            release.counter = counter;
            release.updated_on = Utc::now();
        }
        Ok(())
    }

    async fn finalize(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
        status: ReleaseStatus,
        commit: Option<&CommitIdentity>,
    ) -> Result<bool, StoreError> {
        let state = tx_state(tx)?;
        let Some(release) = state.releases.get_mut(&id) else {
            return Ok(false);
        };
        if release.status.is_terminal() {
            return Ok(false);
        }

        release.status = status;
        if let Some(commit) = commit {
            release.commit_hash = Some(commit.commit_hash.clone());
            release.commit_time = Some(commit.commit_time);
        }
        release.updated_on = Utc::now();
        Ok(true)
    }

    async fn find_by_pipeline_and_counter(
        &self,
        pipeline_id: i64,
        counter: i64,
    ) -> Result<Vec<ReleaseOverride>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .releases
            .values()
            .filter(|r| r.pipeline_id == pipeline_id && r.counter == counter)
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<ReleaseOverride>, StoreError> {
        Ok(self.state.lock().await.releases.get(&id).cloned())
    }

    async fn find_latest_by_app_env(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> Result<Option<ReleaseOverride>, StoreError> {
        let state = self.state.lock().await;
        let Some(pipeline) = state
            .pipelines
            .values()
            .find(|p| p.app_id == app_id && p.env_id == env_id && !p.deleted)
        else {
            return Ok(None);
        };
        Ok(state
            .releases
            .values()
            .filter(|r| r.pipeline_id == pipeline.id)
            .max_by_key(|r| (r.counter, r.id))
            .cloned())
    }

    async fn find_by_commit_hash(
        &self,
        pipeline_id: i64,
        commit_hash: &str,
    ) -> Result<Option<ReleaseOverride>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .releases
            .values()
            .filter(|r| {
                r.pipeline_id == pipeline_id && r.commit_hash.as_deref() == Some(commit_hash)
            })
            .max_by_key(|r| r.id)
            .cloned())
    }

    async fn list_by_pipeline(&self, pipeline_id: i64) -> Result<Vec<ReleaseOverride>, StoreError> {
        let state = self.state.lock().await;
        let mut releases: Vec<ReleaseOverride> = state
            .releases
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        releases.sort_by_key(|r| (r.counter, r.id));
        Ok(releases)
    }

    async fn save_merged_values(
        &self,
        id: i64,
        values: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(release) = state.releases.get_mut(&id) {
            release.merged_values = Some(values.clone());
        }
        Ok(())
    }
}

// =============================================================================
// Workflows & Runners
// =============================================================================

#[async_trait]
impl WorkflowRepository for MemoryStore {
    async fn create_workflow(
        &self,
        tx: &mut dyn Transaction,
        pipeline_id: i64,
        artifact_id: i64,
        time: DateTime<Utc>,
    ) -> Result<Workflow, StoreError> {
        let state = tx_state(tx)?;
        let id = state.next_id();
        let workflow = Workflow {
            id,
            pipeline_id,
            artifact_id,
            created_on: time,
        };
        state.workflows.insert(id, workflow.clone());
        Ok(workflow)
    }

    async fn find_workflow(&self, id: i64) -> Result<Option<Workflow>, StoreError> {
        Ok(self.state.lock().await.workflows.get(&id).cloned())
    }

    async fn create_runner(
        &self,
        tx: &mut dyn Transaction,
        new: &NewRunner,
    ) -> Result<Runner, StoreError> {
        let state = tx_state(tx)?;
        let id = state.next_id();
        let runner = Runner {
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
        };
        state.runners.insert(id, runner.clone());
        Ok(runner)
    }

    async fn find_runner(&self, id: i64) -> Result<Option<Runner>, StoreError> {
        Ok(self.state.lock().await.runners.get(&id).cloned())
    }

    async fn lock_runner(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
    ) -> Result<Option<Runner>, StoreError> {
        let state = tx_state(tx)?;
        Ok(state.runners.get(&id).cloned())
    }

    async fn find_latest_runner(
        &self,
        workflow_id: i64,
        stage: WorkflowStage,
    ) -> Result<Option<Runner>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runners
            .values()
            .filter(|r| r.workflow_id == workflow_id && r.stage == stage)
            .max_by_key(|r| r.id)
            .cloned())
    }

    async fn find_latest_non_failed_deploy_runner(
        &self,
        pipeline_id: i64,
    ) -> Result<Option<Runner>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runners
            .values()
            .filter(|r| {
                r.stage == WorkflowStage::Deploy
                    && r.status != RunnerStatus::Failed
                    && state.pipeline_of_runner(r) == Some(pipeline_id)
            })
            .max_by_key(|r| r.id)
            .cloned())
    }

    async fn list_active_deploy_runners(
        &self,
        pipeline_id: Option<i64>,
    ) -> Result<Vec<Runner>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runners
            .values()
            .filter(|r| {
                r.stage == WorkflowStage::Deploy
                    && !r.status.is_terminal()
                    && r.release_override_id.is_some()
                    && pipeline_id.is_none_or(|p| state.pipeline_of_runner(r) == Some(p))
            })
            .cloned()
            .collect())
    }

    async fn update_runner_status(
        &self,
        tx: &mut dyn Transaction,
        id: i64,
        status: RunnerStatus,
        finished_on: Option<DateTime<Utc>>,
        message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let state = tx_state(tx)?;
        let Some(runner) = state.runners.get_mut(&id) else {
            return Ok(false);
        };
        if runner.status.is_terminal() {
            return Ok(false);
        }

        runner.status = status;
        if finished_on.is_some() {
            runner.finished_on = finished_on;
        }
        if let Some(message) = message {
            runner.message = Some(message.to_string());
        }
        Ok(true)
    }
}

// =============================================================================
// Timeline
// =============================================================================

#[async_trait]
impl TimelineRepository for MemoryStore {
    async fn find_by_runner(&self, runner_id: i64) -> Result<Vec<TimelineEntry>, StoreError> {
        Ok(self.state.lock().await.sorted_timeline(runner_id))
    }

    async fn list_for_runner(
        &self,
        tx: &mut dyn Transaction,
        runner_id: i64,
    ) -> Result<Vec<TimelineEntry>, StoreError> {
        Ok(tx_state(tx)?.sorted_timeline(runner_id))
    }

    async fn insert_if_absent(
        &self,
        tx: &mut dyn Transaction,
        entry: &NewTimelineEntry,
    ) -> Result<Option<TimelineEntry>, StoreError> {
        let state = tx_state(tx)?;
        let conflict = state.timeline.iter().any(|e| {
            e.runner_id == entry.runner_id
                && (e.status == entry.status
                    || (e.status.is_terminal() && entry.status.is_terminal()))
        });
        if conflict {
            return Ok(None);
        }

        let id = state.next_id();
        let row = TimelineEntry {
            id,
            runner_id: entry.runner_id,
            status: entry.status,
            detail: entry.detail.clone(),
            status_time: entry.status_time,
            created_on: Utc::now(),
        };
        state.timeline.push(row.clone());
        Ok(Some(row))
    }
}

// =============================================================================
// App Status, History, Variables, Users
// =============================================================================

#[async_trait]
impl AppStatusRepository for MemoryStore {
    async fn upsert(&self, status: &AppStatus) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let key = (status.app_id, status.env_id);
        if let Some(existing) = state.app_status.get(&key) {
            if !existing.accepts(status) {
                return Ok(false);
            }
        }
        state.app_status.insert(key, status.clone());
        Ok(true)
    }

    async fn find(&self, app_id: i64, env_id: i64) -> Result<Option<AppStatus>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .app_status
            .get(&(app_id, env_id))
            .cloned())
    }
}

#[async_trait]
impl HistoryRepository for MemoryStore {
    async fn save(&self, history: &DeploymentHistory) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let mut row = history.clone();
        row.id = id;
        state.history.insert(id, row);
        Ok(id)
    }

    async fn find_by_pipeline_and_runner(
        &self,
        pipeline_id: i64,
        runner_id: i64,
    ) -> Result<Option<DeploymentHistory>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .values()
            .find(|h| h.pipeline_id == pipeline_id && h.runner_id == runner_id)
            .cloned())
    }
}

#[async_trait]
impl VariableRepository for MemoryStore {
    async fn find_by_names(&self, names: &[String]) -> Result<Vec<ScopedVariable>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .variables
            .iter()
            .filter(|v| names.contains(&v.name))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn get_by_id_include_deleted(&self, id: i64) -> Result<Option<User>, CollaboratorError> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }
}
