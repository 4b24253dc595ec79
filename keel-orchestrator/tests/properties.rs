//! Cross-module invariants: dense counters, a single terminal entry per
//! runner, ordered health, one latest override and idempotent ingestion.

use chrono::{Duration, Utc};
use keel_core::domain::status::HealthStatus;
use keel_core::domain::timeline::TimelineStatus;
use keel_core::dto::reconciler::OperationPhase;
use keel_core::dto::trigger::TriggerRequest;
use keel_orchestrator::context::TriggerContext;
use keel_orchestrator::error::EngineError;
use keel_orchestrator::service::Engine;
use keel_orchestrator::service::timeline::AppendOutcome;
use keel_orchestrator::testing;

fn deploy_request() -> TriggerRequest {
    TriggerRequest::deploy(
        testing::PIPELINE_ID,
        testing::APP_ID,
        testing::ARTIFACT_ID,
        testing::USER_ID,
    )
}

async fn trigger(engine: &Engine) -> Result<(), EngineError> {
    engine
        .trigger
        .trigger(&TriggerContext::new(), &deploy_request())
        .await
        .map(|_| ())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_counters_are_dense_under_concurrency() {
    let store = testing::seeded_store().await;
    let engine = testing::engine(&store);

    let (a, b, c, d) = tokio::join!(
        trigger(&engine),
        trigger(&engine),
        trigger(&engine),
        trigger(&engine),
    );
    for result in [a, b, c, d] {
        result.unwrap();
    }
    trigger(&engine).await.unwrap();

    let mut counters: Vec<i64> = store
        .snapshot()
        .await
        .releases
        .values()
        .map(|r| r.counter)
        .collect();
    counters.sort();
    assert_eq!(counters, vec![1, 2, 3, 4, 5]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_deploys_keep_one_latest_override() {
    let store = testing::seeded_store().await;
    store.seed(|s| s.env_overrides.clear()).await;
    let engine = testing::engine(&store);

    let (a, b, c) = tokio::join!(trigger(&engine), trigger(&engine), trigger(&engine));
    for result in [a, b, c] {
        result.unwrap();
    }

    let latest = store
        .snapshot()
        .await
        .env_overrides
        .values()
        .filter(|o| o.app_id == testing::APP_ID && o.env_id == testing::ENV_ID && o.latest)
        .count();
    assert_eq!(latest, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_terminal_entry_per_runner() {
    let store = testing::seeded_store().await;
    let (runner_id, _) = testing::in_progress_runner(&store).await;
    let timeline = testing::engine(&store).timeline;
    let at = Utc::now();

    let (a, b, c, d) = tokio::join!(
        timeline.append(runner_id, TimelineStatus::Failed, "sync failed", at),
        timeline.append(runner_id, TimelineStatus::FetchTimedOut, "timed out", at),
        timeline.append(runner_id, TimelineStatus::DeploymentSuperseded, "superseded", at),
        timeline.append(runner_id, TimelineStatus::GitCommitFailed, "push denied", at),
    );
    let appended = [a, b, c, d]
        .into_iter()
        .map(|r| r.unwrap())
        .filter(AppendOutcome::is_appended)
        .count();
    assert_eq!(appended, 1);

    let terminal = store
        .snapshot()
        .await
        .timeline
        .iter()
        .filter(|e| e.runner_id == runner_id && e.status.is_terminal())
        .count();
    assert_eq!(terminal, 1);

    let again = timeline
        .append(runner_id, TimelineStatus::Failed, "late", at + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(again, AppendOutcome::DroppedTerminal);
}

#[tokio::test]
async fn test_healthy_never_precedes_synced() {
    let store = testing::seeded_store().await;
    let (runner_id, _) = testing::in_progress_runner(&store).await;
    let engine = testing::engine(&store);
    let t = Utc::now();

    // Healthy before any sync is not a terminal success
    let err = engine
        .timeline
        .append(runner_id, TimelineStatus::AppHealthy, "", t)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ProtocolViolation(_)));

    let healthy_early = testing::event(HealthStatus::Healthy, None, t);
    engine
        .ingress
        .handle(&TriggerContext::new(), &healthy_early)
        .await
        .unwrap();

    let mut synced = testing::event(
        HealthStatus::Healthy,
        Some(OperationPhase::Succeeded),
        t + Duration::seconds(5),
    );
    synced.sync.finished_at = Some(t + Duration::seconds(20));
    synced.reconciled_at = Some(t + Duration::seconds(40));
    engine
        .ingress
        .handle(&TriggerContext::new(), &synced)
        .await
        .unwrap();

    let state = store.snapshot().await;
    let time_of = |tag: TimelineStatus| {
        state
            .timeline
            .iter()
            .find(|e| e.runner_id == runner_id && e.status == tag)
            .map(|e| e.status_time)
    };
    let synced_at = time_of(TimelineStatus::KubectlApplySynced).unwrap();
    let healthy_at = time_of(TimelineStatus::AppHealthy).unwrap();
    assert!(synced_at <= healthy_at);
}

#[tokio::test]
async fn test_redelivered_events_are_idempotent() {
    let store = testing::seeded_store().await;
    let (runner_id, _) = testing::in_progress_runner(&store).await;
    let engine = testing::engine(&store);
    let t = Utc::now();

    let mut synced = testing::event(
        HealthStatus::Progressing,
        Some(OperationPhase::Succeeded),
        t,
    );
    synced.sync.finished_at = Some(t + Duration::seconds(15));
    let degraded = testing::event(
        HealthStatus::Degraded,
        Some(OperationPhase::Succeeded),
        t + Duration::seconds(20),
    );

    for evt in [&synced, &degraded] {
        engine.ingress.handle(&TriggerContext::new(), evt).await.unwrap();
    }
    let once = store.snapshot().await;

    for evt in [&synced, &degraded] {
        engine.ingress.handle(&TriggerContext::new(), evt).await.unwrap();
    }
    let twice = store.snapshot().await;

    assert_eq!(once.timeline, twice.timeline);
    assert_eq!(
        once.runners[&runner_id].status,
        twice.runners[&runner_id].status
    );
}

#[tokio::test]
async fn test_composition_is_deterministic() {
    let store = testing::seeded_store().await;
    let engine = testing::engine(&store);

    let first = engine
        .composer
        .prepare(testing::compose_source(&store).await)
        .await
        .unwrap();
    let second = engine
        .composer
        .prepare(testing::compose_source(&store).await)
        .await
        .unwrap();

    let a = first.render(4).unwrap();
    let b = second.render(4).unwrap();
    assert_eq!(
        serde_json::to_vec(&a.values).unwrap(),
        serde_json::to_vec(&b.values).unwrap()
    );
}
