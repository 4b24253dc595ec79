//! End-to-end deployment scenarios against the in-memory store and fake
//! collaborators.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use keel_core::collab::CollaboratorError;
use keel_core::domain::catalog::DeploymentStrategy;
use keel_core::domain::release::{DeploymentType, ReleaseStatus};
use keel_core::domain::runner::RunnerStatus;
use keel_core::domain::status::{HealthStatus, ProjectedStatus};
use keel_core::domain::timeline::TimelineStatus;
use keel_core::dto::reconciler::{OperationPhase, ReconcilerEvent};
use keel_core::dto::trigger::{TriggerOutcome, TriggerRequest};
use keel_orchestrator::config::EngineConfig;
use keel_orchestrator::context::TriggerContext;
use keel_orchestrator::repository::MemoryStore;
use keel_orchestrator::service::Engine;
use keel_orchestrator::service::ingress::IngressOutcome;
use keel_orchestrator::testing::{self, FakeGitOps};
use serde_json::json;

fn deploy_request() -> TriggerRequest {
    TriggerRequest::deploy(
        testing::PIPELINE_ID,
        testing::APP_ID,
        testing::ARTIFACT_ID,
        testing::USER_ID,
    )
}

async fn tags(store: &MemoryStore, runner_id: i64) -> Vec<TimelineStatus> {
    let mut entries: Vec<_> = store
        .snapshot()
        .await
        .timeline
        .into_iter()
        .filter(|e| e.runner_id == runner_id)
        .collect();
    entries.sort_by_key(|e| (e.status_time, e.id));
    entries.into_iter().map(|e| e.status).collect()
}

/// Event for the committed revision of a trigger
fn event_for(
    outcome: &TriggerOutcome,
    health: HealthStatus,
    phase: Option<OperationPhase>,
    at: DateTime<Utc>,
) -> ReconcilerEvent {
    let mut evt = testing::event(health, phase, at);
    if let Some(commit) = &outcome.commit {
        evt.sync.revision = commit.commit_hash.clone();
    }
    evt
}

/// Started, synced and healthy events, the way a CD agent reports a
/// successful rollout
async fn roll_out(engine: &Engine, outcome: &TriggerOutcome, t: DateTime<Utc>) {
    let started = event_for(
        outcome,
        HealthStatus::Progressing,
        Some(OperationPhase::Running),
        t + Duration::seconds(1),
    );

    let mut synced = event_for(
        outcome,
        HealthStatus::Progressing,
        Some(OperationPhase::Succeeded),
        t + Duration::seconds(1),
    );
    synced.sync.finished_at = Some(t + Duration::seconds(30));
    synced.reconciled_at = Some(t + Duration::seconds(30));

    let mut healthy = synced.clone();
    healthy.health.status = HealthStatus::Healthy;
    healthy.reconciled_at = Some(t + Duration::seconds(90));

    for evt in [started, synced, healthy] {
        engine.ingress.handle(&TriggerContext::new(), &evt).await.unwrap();
    }
}

#[tokio::test]
async fn test_first_deploy_succeeds() {
    let store = testing::seeded_store().await;
    let engine = testing::engine(&store);
    let mut req = deploy_request();
    req.strategy = Some(DeploymentStrategy::Rolling);

    let outcome = engine
        .trigger
        .trigger(&TriggerContext::new(), &req)
        .await
        .unwrap();
    roll_out(&engine, &outcome, Utc::now()).await;

    let state = store.snapshot().await;
    let release = outcome.release.as_ref().unwrap();
    assert_eq!(state.releases[&release.id].counter, 1);
    assert_eq!(state.releases[&release.id].status, ReleaseStatus::Success);
    assert_eq!(state.runners[&outcome.runner.id].status, RunnerStatus::Succeeded);

    assert_eq!(
        tags(&store, outcome.runner.id).await,
        vec![
            TimelineStatus::DeploymentInitiated,
            TimelineStatus::GitCommit,
            TimelineStatus::KubectlApplyStarted,
            TimelineStatus::KubectlApplySynced,
            TimelineStatus::AppHealthy,
        ]
    );
    assert_eq!(
        engine
            .status
            .project(testing::APP_ID, testing::ENV_ID)
            .await
            .unwrap(),
        ProjectedStatus::Health(HealthStatus::Healthy)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_triggers_get_distinct_counters() {
    let store = testing::seeded_store().await;
    let engine = testing::engine(&store);
    let req = deploy_request();

    let ctx_a = TriggerContext::new();
    let ctx_b = TriggerContext::new();
    let (a, b) = tokio::join!(
        engine.trigger.trigger(&ctx_a, &req),
        engine.trigger.trigger(&ctx_b, &req),
    );
    a.unwrap();
    b.unwrap();

    let state = store.snapshot().await;
    let mut counters: Vec<i64> = state
        .releases
        .values()
        .filter(|r| r.pipeline_id == testing::PIPELINE_ID)
        .map(|r| r.counter)
        .collect();
    counters.sort();
    assert_eq!(counters, vec![1, 2]);
}

#[tokio::test]
async fn test_git_commit_failure_fails_runner() {
    let store = testing::seeded_store().await;
    let gitops = Arc::new(FakeGitOps::failing(CollaboratorError::Rejected {
        status: 423,
        message: "repo locked".to_string(),
    }));
    let engine = testing::engine_with(&store, gitops, EngineConfig::default());

    let outcome = engine
        .trigger
        .trigger(&TriggerContext::new(), &deploy_request())
        .await
        .unwrap();
    assert_eq!(outcome.publish_error.as_deref(), Some("repo locked"));

    // The agent never saw a commit, but keeps reporting the application
    let evt = testing::event(
        HealthStatus::Progressing,
        Some(OperationPhase::Running),
        Utc::now(),
    );
    let handled = engine
        .ingress
        .handle(&TriggerContext::new(), &evt)
        .await
        .unwrap();
    assert_ne!(
        handled,
        IngressOutcome::Applied {
            appended: vec![TimelineStatus::KubectlApplyStarted]
        }
    );

    let timeline = tags(&store, outcome.runner.id).await;
    assert!(timeline.contains(&TimelineStatus::GitCommitFailed));
    assert!(!timeline.iter().any(|t| matches!(
        t,
        TimelineStatus::KubectlApplyStarted | TimelineStatus::KubectlApplySynced
    )));
    let state = store.snapshot().await;
    assert_eq!(state.runners[&outcome.runner.id].status, RunnerStatus::Failed);
}

#[tokio::test]
async fn test_stop_release_hibernates() {
    let store = testing::seeded_store().await;
    store
        .seed(|s| {
            for o in s.env_overrides.values_mut() {
                o.values = json!({
                    "replicaCount": 3,
                    "autoscaling": {"enabled": true, "MinReplicas": 2, "MaxReplicas": 5}
                });
            }
        })
        .await;
    let engine = testing::engine(&store);
    let mut req = deploy_request();
    req.deployment_type = DeploymentType::Stop;

    let outcome = engine
        .trigger
        .trigger(&TriggerContext::new(), &req)
        .await
        .unwrap();
    let values = outcome
        .release
        .as_ref()
        .and_then(|r| r.merged_values.clone())
        .unwrap();
    assert_eq!(values["replicaCount"], json!(0));
    assert_eq!(values["autoscaling"]["enabled"], json!(false));

    roll_out(&engine, &outcome, Utc::now()).await;

    assert_eq!(
        engine
            .status
            .project(testing::APP_ID, testing::ENV_ID)
            .await
            .unwrap(),
        ProjectedStatus::Hibernating
    );
}

#[tokio::test]
async fn test_stale_event_is_dropped() {
    let store = testing::seeded_store().await;
    let (runner_id, release_id) = testing::in_progress_runner(&store).await;
    let engine = testing::engine(&store);
    let before = store.snapshot().await;
    let commit_time = before.releases[&release_id].commit_time.unwrap();

    let mut evt = testing::event(
        HealthStatus::Healthy,
        Some(OperationPhase::Succeeded),
        Utc::now(),
    );
    evt.sync.revision = "xyz".to_string();
    evt.sync.committed_time = Some(commit_time - Duration::seconds(10));
    evt.sync.finished_at = Some(Utc::now());

    let handled = engine
        .ingress
        .handle(&TriggerContext::new(), &evt)
        .await
        .unwrap();

    assert_eq!(handled, IngressOutcome::Stale);
    let after = store.snapshot().await;
    assert_eq!(after.timeline, before.timeline);
    assert_eq!(after.runners[&runner_id].status, RunnerStatus::InProgress);
}

#[tokio::test]
async fn test_silent_runner_times_out() {
    let store = testing::seeded_store().await;
    let (runner_id, release_id) = testing::in_progress_runner(&store).await;
    let engine = testing::engine(&store);
    let t = Utc::now();

    let evt = testing::event(
        HealthStatus::Progressing,
        Some(OperationPhase::Running),
        t,
    );
    engine.ingress.handle(&TriggerContext::new(), &evt).await.unwrap();

    let swept = engine.sweeper.sweep(t + Duration::minutes(21)).await.unwrap();
    assert_eq!(swept, 1);

    let state = store.snapshot().await;
    assert_eq!(state.runners[&runner_id].status, RunnerStatus::TimedOut);
    assert_eq!(state.releases[&release_id].status, ReleaseStatus::TimedOut);
    assert_eq!(
        tags(&store, runner_id).await.last(),
        Some(&TimelineStatus::FetchTimedOut)
    );

    // Late events change nothing
    let mut late = testing::event(
        HealthStatus::Healthy,
        Some(OperationPhase::Succeeded),
        t + Duration::minutes(22),
    );
    late.sync.finished_at = Some(t + Duration::minutes(22));
    let handled = engine
        .ingress
        .handle(&TriggerContext::new(), &late)
        .await
        .unwrap();
    assert_eq!(handled, IngressOutcome::RunnerTerminal);
    assert_eq!(store.snapshot().await.timeline, state.timeline);
}
