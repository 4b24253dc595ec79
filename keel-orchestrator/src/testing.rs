//! Test support
//!
//! In-process fake collaborators and a seeded in-memory catalog for unit and
//! integration tests. The fakes record what they were asked to do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use keel_core::collab::{
    ChartBundle, ChartRegistry, ClusterClient, CollaboratorError, GitCommit, GitOpsClient,
    Notifier, PushIdentity, ResourceKey, ValuesCommit,
};
use keel_core::domain::catalog::{
    Application, Artifact, DeployTarget, DeploymentStrategy, Environment, Pipeline, User,
};
use keel_core::domain::chart::{AppChart, ChartRef, EnvOverride, OverrideStatus};
use keel_core::domain::release::{DeploymentType, ReleaseOverride, ReleaseStatus};
use keel_core::domain::runner::{Runner, RunnerStatus, Workflow, WorkflowStage};
use keel_core::domain::status::HealthStatus;
use keel_core::domain::timeline::{TimelineEntry, TimelineStatus};
use keel_core::dto::event::CdEvent;
use keel_core::dto::reconciler::{
    HealthInfo, OperationPhase, OperationState, ReconcilerEvent, SyncInfo,
};
use serde_json::{Value, json};

use crate::config::EngineConfig;
use crate::repository::{MemoryStore, Stores};
use crate::service::composer::ComposeSource;
use crate::service::publisher::PublishTarget;
use crate::service::{Collaborators, Engine};

pub const APP_ID: i64 = 1;
pub const ENV_ID: i64 = 2;
pub const PIPELINE_ID: i64 = 3;
pub const ARTIFACT_ID: i64 = 5;
pub const USER_ID: i64 = 7;
pub const CLUSTER_ID: i64 = 1;
pub const CHART_REF_ID: i64 = 10;
pub const APP_CHART_ID: i64 = 11;
pub const ENV_OVERRIDE_ID: i64 = 12;

pub const APP_NAME: &str = "payments";
pub const ENV_NAME: &str = "prod";
pub const NAMESPACE: &str = "payments";
pub const PIPELINE_NAME: &str = "payments-prod-cd";
pub const DEPLOYMENT_APP_NAME: &str = "payments-prod";
pub const REGISTRY_ID: &str = "ecr-main";
pub const IMAGE: &str = "registry.local:5000/payments:1.4.2";

/// Commit of the release created by [`in_progress_runner`]
pub const COMMIT_HASH: &str = "abc123";

pub const DESCRIPTOR_TEMPLATE: &str = r#"{"server":{"deployment":{"image_tag":"{{.Tag}}","image":"{{.Name}}"}},"pipelineName":"{{.PipelineName}}","releaseVersion":"{{.ReleaseVersion}}","deploymentType":"{{.DeploymentType}}","app":"{{.App}}","env":"{{.Env}}","appMetrics":{{.AppMetrics}}}"#;

// =============================================================================
// Fake Collaborators
// =============================================================================

#[derive(Default)]
struct GitOpsState {
    repos: Vec<String>,
    commits: Vec<ValuesCommit>,
    attempts: u32,
    conflicts_left: u32,
    failure: Option<CollaboratorError>,
}

/// GitOps provider that keeps commits in memory
#[derive(Default)]
pub struct FakeGitOps {
    state: Mutex<GitOpsState>,
}

impl FakeGitOps {
    /// Rejects the first `n` commits as non-fast-forward
    pub fn with_conflicts(n: u32) -> Self {
        let fake = Self::default();
        fake.lock().conflicts_left = n;
        fake
    }

    /// Fails every commit with `error`
    pub fn failing(error: CollaboratorError) -> Self {
        let fake = Self::default();
        fake.lock().failure = Some(error);
        fake
    }

    pub fn commits(&self) -> Vec<ValuesCommit> {
        self.lock().commits.clone()
    }

    pub fn repos(&self) -> Vec<String> {
        self.lock().repos.clone()
    }

    /// Commit calls, including rejected ones
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GitOpsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl GitOpsClient for FakeGitOps {
    async fn ensure_repo(&self, name: &str) -> Result<String, CollaboratorError> {
        let mut state = self.lock();
        if !state.repos.iter().any(|r| r == name) {
            state.repos.push(name.to_string());
        }
        Ok(format!("https://git.local/keel/{}.git", name))
    }

    async fn commit_values(&self, commit: &ValuesCommit) -> Result<GitCommit, CollaboratorError> {
        let mut state = self.lock();
        state.attempts += 1;

        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        if state.conflicts_left > 0 {
            state.conflicts_left -= 1;
            return Err(CollaboratorError::Conflict("non-fast-forward".to_string()));
        }

        state.commits.push(commit.clone());
        Ok(GitCommit {
            hash: format!("{:040x}", 0xc0ffee_u64 + state.commits.len() as u64),
            time: Some(Utc::now()),
        })
    }
}

/// Chart registry that accepts every bundle
#[derive(Default)]
pub struct FakeRegistry {
    pushed: Mutex<Vec<ChartBundle>>,
}

impl FakeRegistry {
    pub fn pushed(&self) -> Vec<ChartBundle> {
        self.pushed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ChartRegistry for FakeRegistry {
    async fn push(&self, bundle: &ChartBundle) -> Result<PushIdentity, CollaboratorError> {
        self.pushed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(bundle.clone());
        Ok(PushIdentity {
            digest: bundle.digest.clone(),
            commit_time: Some(Utc::now()),
        })
    }
}

/// Cluster serving HPAs by name
#[derive(Default)]
pub struct FakeCluster {
    hpas: Mutex<HashMap<String, Value>>,
}

impl FakeCluster {
    pub fn put_hpa(&self, name: &str, manifest: Value) {
        self.hpas
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), manifest);
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_resource(&self, key: &ResourceKey) -> Result<Option<Value>, CollaboratorError> {
        if key.kind != "HorizontalPodAutoscaler" {
            return Ok(None);
        }
        Ok(self
            .hpas
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key.name)
            .cloned())
    }
}

/// Notifier that keeps every event
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<CdEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<CdEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn write_cd_event(&self, event: &CdEvent) -> Result<(), CollaboratorError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// One set of fakes, kept around for assertions
#[derive(Clone, Default)]
pub struct Fakes {
    pub gitops: Arc<FakeGitOps>,
    pub registry: Arc<FakeRegistry>,
    pub cluster: Arc<FakeCluster>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Fakes {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            gitops: self.gitops.clone(),
            registry: self.registry.clone(),
            cluster: self.cluster.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

// =============================================================================
// Engines
// =============================================================================

pub fn engine(store: &MemoryStore) -> Engine {
    engine_with(store, Default::default(), EngineConfig::default())
}

pub fn engine_with(store: &MemoryStore, gitops: Arc<FakeGitOps>, config: EngineConfig) -> Engine {
    let fakes = Fakes {
        gitops,
        ..Default::default()
    };
    engine_with_fakes(store, &fakes, config)
}

pub fn engine_with_fakes(store: &MemoryStore, fakes: &Fakes, config: EngineConfig) -> Engine {
    Engine::new(
        Stores::in_memory(store.clone()),
        fakes.collaborators(),
        config,
    )
}

// =============================================================================
// Catalog
// =============================================================================

pub fn artifact(id: i64, image: &str) -> Artifact {
    Artifact {
        id,
        image: image.to_string(),
        image_digest: Some(format!("sha256:{:064x}", id)),
        material_info: Default::default(),
        registry_id: Some(REGISTRY_ID.to_string()),
        created_on: Utc::now(),
    }
}

/// One application deployed to one environment through a GitOps pipeline
pub async fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .seed(|s| {
            s.applications.insert(
                APP_ID,
                Application {
                    id: APP_ID,
                    name: APP_NAME.to_string(),
                    project_id: 1,
                    display_name: None,
                },
            );
            s.environments.insert(
                ENV_ID,
                Environment {
                    id: ENV_ID,
                    name: ENV_NAME.to_string(),
                    cluster_id: CLUSTER_ID,
                    cluster_name: "default-cluster".to_string(),
                    namespace: NAMESPACE.to_string(),
                    is_prod: true,
                },
            );
            s.pipelines.insert(
                PIPELINE_ID,
                Pipeline {
                    id: PIPELINE_ID,
                    app_id: APP_ID,
                    env_id: ENV_ID,
                    name: PIPELINE_NAME.to_string(),
                    deployment_app_name: DEPLOYMENT_APP_NAME.to_string(),
                    default_strategy: DeploymentStrategy::Rolling,
                    deploy_target: DeployTarget::Gitops,
                    registry_id: None,
                    use_digest: false,
                    deleted: false,
                },
            );
            s.artifacts.insert(ARTIFACT_ID, artifact(ARTIFACT_ID, IMAGE));
            s.users.insert(
                USER_ID,
                User {
                    id: USER_ID,
                    email: "jane.doe@example.com".to_string(),
                    active: true,
                },
            );
            s.chart_refs.insert(
                CHART_REF_ID,
                ChartRef {
                    id: CHART_REF_ID,
                    name: "reference-chart".to_string(),
                    version: "4.18.0".to_string(),
                    image_descriptor_template: DESCRIPTOR_TEMPLATE.to_string(),
                    app_metrics_supported: false,
                },
            );
            s.app_charts.insert(
                APP_CHART_ID,
                AppChart {
                    id: APP_CHART_ID,
                    app_id: APP_ID,
                    chart_ref_id: CHART_REF_ID,
                    values: json!({"replicaCount": 1, "service": {"port": 8080}}),
                    chart_location: "reference-chart_4-18-0".to_string(),
                    git_repo_url: None,
                    latest: true,
                    created_on: Utc::now(),
                },
            );
            s.env_overrides.insert(
                ENV_OVERRIDE_ID,
                EnvOverride {
                    id: ENV_OVERRIDE_ID,
                    app_id: APP_ID,
                    env_id: ENV_ID,
                    chart_id: APP_CHART_ID,
                    values: json!({"replicaCount": 2}),
                    namespace: NAMESPACE.to_string(),
                    is_override: true,
                    latest: true,
                    status: OverrideStatus::Success,
                    active: true,
                },
            );
        })
        .await;
    store
}

/// Catalog rows of the seeded pipeline
pub struct Fixture {
    pub app: Application,
    pub env: Environment,
    pub pipeline: Pipeline,
    pub artifact: Artifact,
    pub chart_ref: ChartRef,
    pub app_chart: AppChart,
    pub env_override: EnvOverride,
}

impl Fixture {
    pub async fn load(store: &MemoryStore) -> Self {
        let state = store.snapshot().await;
        Self {
            app: seeded(state.applications.get(&APP_ID), "application"),
            env: seeded(state.environments.get(&ENV_ID), "environment"),
            pipeline: seeded(state.pipelines.get(&PIPELINE_ID), "pipeline"),
            artifact: seeded(state.artifacts.get(&ARTIFACT_ID), "artifact"),
            chart_ref: seeded(state.chart_refs.get(&CHART_REF_ID), "chart ref"),
            app_chart: seeded(state.app_charts.get(&APP_CHART_ID), "app chart"),
            env_override: seeded(state.env_overrides.get(&ENV_OVERRIDE_ID), "environment override"),
        }
    }

    pub fn target<'a>(&'a self, release: &'a ReleaseOverride) -> PublishTarget<'a> {
        PublishTarget {
            app: &self.app,
            env: &self.env,
            pipeline: &self.pipeline,
            app_chart: &self.app_chart,
            chart_ref: &self.chart_ref,
            release,
            user_id: USER_ID,
        }
    }

    pub fn compose_source(&self) -> ComposeSource {
        ComposeSource {
            app: self.app.clone(),
            env: self.env.clone(),
            pipeline: self.pipeline.clone(),
            artifact: self.artifact.clone(),
            chart_ref: self.chart_ref.clone(),
            app_chart: self.app_chart.clone(),
            env_override: self.env_override.clone(),
            strategy: self.pipeline.default_strategy,
            deployment_type: DeploymentType::Deploy,
            additional_override: None,
            pinned: None,
        }
    }
}

fn seeded<T: Clone>(row: Option<&T>, what: &str) -> T {
    match row {
        Some(row) => row.clone(),
        None => panic!("seeded {} missing", what),
    }
}

pub async fn compose_source(store: &MemoryStore) -> ComposeSource {
    Fixture::load(store).await.compose_source()
}

// =============================================================================
// Runners
// =============================================================================

/// A release with an INITIATED deploy runner, as left by a trigger right
/// before publishing
pub async fn initiated_runner(store: &MemoryStore) -> (i64, i64) {
    let mut ids = (0, 0);
    store
        .seed(|s| {
            let now = Utc::now();
            let started = now - Duration::minutes(2);

            let workflow_id = s.next_id();
            s.workflows.insert(
                workflow_id,
                Workflow {
                    id: workflow_id,
                    pipeline_id: PIPELINE_ID,
                    artifact_id: ARTIFACT_ID,
                    created_on: started,
                },
            );

            let counter = s
                .releases
                .values()
                .filter(|r| r.pipeline_id == PIPELINE_ID)
                .map(|r| r.counter)
                .max()
                .unwrap_or(0)
                + 1;
            let release_id = s.next_id();
            s.releases.insert(
                release_id,
                ReleaseOverride {
                    id: release_id,
                    pipeline_id: PIPELINE_ID,
                    env_override_id: ENV_OVERRIDE_ID,
                    artifact_id: ARTIFACT_ID,
                    workflow_id,
                    counter,
                    status: ReleaseStatus::New,
                    deployment_type: DeploymentType::Deploy,
                    strategy: DeploymentStrategy::Rolling,
                    commit_hash: None,
                    commit_time: None,
                    merged_values: None,
                    created_by: USER_ID,
                    created_on: started,
                    updated_by: USER_ID,
                    updated_on: started,
                },
            );

            let runner_id = s.next_id();
            s.runners.insert(
                runner_id,
                Runner {
                    id: runner_id,
                    workflow_id,
                    release_override_id: Some(release_id),
                    stage: WorkflowStage::Deploy,
                    status: RunnerStatus::Initiated,
                    deploy_target: DeployTarget::Gitops,
                    started_on: started,
                    finished_on: None,
                    triggered_by: USER_ID,
                    message: None,
                },
            );
            ids = (runner_id, release_id);
        })
        .await;
    ids
}

/// A release committed as [`COMMIT_HASH`] with an IN_PROGRESS runner
/// waiting for the CD agent
pub async fn in_progress_runner(store: &MemoryStore) -> (i64, i64) {
    let (runner_id, release_id) = initiated_runner(store).await;
    store
        .seed(|s| {
            let committed = Utc::now() - Duration::seconds(90);
            if let Some(release) = s.releases.get_mut(&release_id) {
                release.commit_hash = Some(COMMIT_HASH.to_string());
                release.commit_time = Some(committed);
            }
            if let Some(runner) = s.runners.get_mut(&runner_id) {
                runner.status = RunnerStatus::InProgress;
            }
            let id = s.next_id();
            s.timeline.push(TimelineEntry {
                id,
                runner_id,
                status: TimelineStatus::GitCommit,
                detail: format!("Committed {}", COMMIT_HASH),
                status_time: committed,
                created_on: committed,
            });
        })
        .await;
    (runner_id, release_id)
}

// =============================================================================
// Reconciler Events
// =============================================================================

/// Event for the seeded application at [`COMMIT_HASH`], synced from `at`
pub fn event(
    health: HealthStatus,
    phase: Option<OperationPhase>,
    at: chrono::DateTime<Utc>,
) -> ReconcilerEvent {
    ReconcilerEvent {
        name: DEPLOYMENT_APP_NAME.to_string(),
        namespace: NAMESPACE.to_string(),
        cluster_id: CLUSTER_ID,
        sync: SyncInfo {
            revision: COMMIT_HASH.to_string(),
            started_at: Some(at),
            finished_at: None,
            committed_time: None,
        },
        operation_state: phase.map(|phase| OperationState {
            phase,
            message: String::new(),
        }),
        health: HealthInfo {
            status: health,
            message: None,
        },
        reconciled_at: Some(at),
    }
}
