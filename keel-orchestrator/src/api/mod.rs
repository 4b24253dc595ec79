//! API Module
//!
//! HTTP transport for the engine: triggers and reconciler events in, timelines
//! and projected status out. Each submodule handles one group of endpoints.

pub mod error;
pub mod events;
pub mod health;
pub mod runners;
pub mod status;
pub mod trigger;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::service::Engine;

/// Create the main API router with all endpoints
pub fn create_router(engine: Engine) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Triggers
        .route("/v1/trigger", post(trigger::trigger))
        // Reconciler events
        .route(
            "/v1/events/application-status",
            post(events::application_status),
        )
        // Runner endpoints
        .route(
            "/v1/runners/{id}/sync-completed",
            post(runners::sync_completed),
        )
        .route("/v1/runners/{id}/timeline", get(runners::get_timeline))
        // Status
        .route(
            "/v1/apps/{app_id}/envs/{env_id}/status",
            get(status::get_status),
        )
        // Add state and middleware
        .with_state(engine)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use keel_core::domain::status::HealthStatus;
    use keel_core::dto::reconciler::OperationPhase;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn send(router: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let store = testing::seeded_store().await;
        let router = create_router(testing::engine(&store));
        let (status, _) = send(router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_trigger_creates_release() {
        let store = testing::seeded_store().await;
        let router = create_router(testing::engine(&store));

        let (status, body) = send(
            router,
            "POST",
            "/v1/trigger",
            Some(json!({
                "pipelineId": testing::PIPELINE_ID,
                "appId": testing::APP_ID,
                "ciArtifactId": testing::ARTIFACT_ID,
                "userId": testing::USER_ID
            })),
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["release"]["counter"], json!(1));
        assert_eq!(body["runner"]["status"], json!("IN_PROGRESS"));
        assert!(body["publishError"].is_null());
    }

    #[tokio::test]
    async fn test_trigger_unknown_pipeline_is_404() {
        let store = testing::seeded_store().await;
        let router = create_router(testing::engine(&store));

        let (status, body) = send(
            router,
            "POST",
            "/v1/trigger",
            Some(json!({"pipelineId": 999, "appId": 1, "ciArtifactId": 5, "userId": 7})),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("999"));
    }

    #[tokio::test]
    async fn test_event_then_timeline() {
        let store = testing::seeded_store().await;
        let (runner_id, _) = testing::in_progress_runner(&store).await;
        let engine = testing::engine(&store);

        let evt = testing::event(
            HealthStatus::Progressing,
            Some(OperationPhase::Running),
            Utc::now(),
        );
        let (status, body) = send(
            create_router(engine.clone()),
            "POST",
            "/v1/events/application-status",
            Some(serde_json::to_value(&evt).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["outcome"], json!("APPLIED"));
        assert_eq!(body["appended"], json!(["KUBECTL_APPLY_STARTED"]));

        let (status, body) = send(
            create_router(engine),
            "GET",
            &format!("/v1/runners/{}/timeline", runner_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let tags: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["status"].as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["GIT_COMMIT", "KUBECTL_APPLY_STARTED"]);
    }

    #[tokio::test]
    async fn test_unknown_runner_timeline_is_404() {
        let store = testing::seeded_store().await;
        let router = create_router(testing::engine(&store));
        let (status, _) = send(router, "GET", "/v1/runners/4242/timeline", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sync_completed_is_recorded_once() {
        let store = testing::seeded_store().await;
        let (runner_id, _) = testing::in_progress_runner(&store).await;
        let engine = testing::engine(&store);
        let uri = format!("/v1/runners/{}/sync-completed", runner_id);

        let (status, body) = send(create_router(engine.clone()), "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["recorded"], json!(true));

        let (_, body) = send(create_router(engine), "POST", &uri, None).await;
        assert_eq!(body["recorded"], json!(false));
    }

    #[tokio::test]
    async fn test_status_without_events_is_unknown() {
        let store = testing::seeded_store().await;
        let router = create_router(testing::engine(&store));
        let uri = format!(
            "/v1/apps/{}/envs/{}/status",
            testing::APP_ID,
            testing::ENV_ID
        );

        let (status, body) = send(router, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("Unknown"));
    }
}
