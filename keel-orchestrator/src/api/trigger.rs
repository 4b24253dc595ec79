//! Trigger API Handler
//!
//! Accepts deployment triggers and hands them to the trigger service.

use axum::{Json, extract::State, http::StatusCode};
use keel_core::dto::trigger::{TriggerOutcome, TriggerRequest};

use crate::api::error::ApiResult;
use crate::context::TriggerContext;
use crate::service::Engine;

/// POST /v1/trigger
/// Trigger a stage of a pipeline for an artifact
///
/// A failed publish still creates the release; the response then carries
/// `publishError` and the runner is FAILED.
pub async fn trigger(
    State(engine): State<Engine>,
    Json(req): Json<TriggerRequest>,
) -> ApiResult<(StatusCode, Json<TriggerOutcome>)> {
    tracing::info!(
        "Trigger for pipeline {} (artifact {}, {:?})",
        req.pipeline_id,
        req.ci_artifact_id,
        req.cd_workflow_type
    );

    let ctx = TriggerContext::new();
    let outcome = engine.trigger.trigger(&ctx, &req).await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}
