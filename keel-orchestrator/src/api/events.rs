//! Reconciler Event API Handler
//!
//! Receives application status events from the CD agent. A 503 response asks
//! the sender to redeliver.

use axum::{Json, extract::State, http::StatusCode};
use keel_core::domain::timeline::TimelineStatus;
use keel_core::dto::reconciler::ReconcilerEvent;
use serde::Serialize;

use crate::api::error::ApiResult;
use crate::context::TriggerContext;
use crate::error::EngineError;
use crate::service::Engine;
use crate::service::ingress::IngressOutcome;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAck {
    pub outcome: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub appended: Vec<TimelineStatus>,
}

impl From<IngressOutcome> for EventAck {
    fn from(outcome: IngressOutcome) -> Self {
        let (name, reason, appended) = match outcome {
            IngressOutcome::Invalid(reason) => ("INVALID", Some(reason), Vec::new()),
            IngressOutcome::Stale => ("STALE", None, Vec::new()),
            IngressOutcome::RunnerTerminal => ("RUNNER_TERMINAL", None, Vec::new()),
            IngressOutcome::AwaitingSync => ("AWAITING_SYNC", None, Vec::new()),
            IngressOutcome::Applied { appended } => ("APPLIED", None, appended),
        };
        Self {
            outcome: name,
            reason,
            appended,
        }
    }
}

/// POST /v1/events/application-status
/// Ingest one reconciler event
pub async fn application_status(
    State(engine): State<Engine>,
    Json(evt): Json<ReconcilerEvent>,
) -> ApiResult<(StatusCode, Json<EventAck>)> {
    tracing::debug!(
        "Event for {} in {}/{} at {}",
        evt.name,
        evt.cluster_id,
        evt.namespace,
        evt.sync.revision
    );

    let ctx = TriggerContext::new();
    let outcome = engine
        .ingress
        .handle(&ctx, &evt)
        .await
        .map_err(redeliverable)?;

    Ok((StatusCode::ACCEPTED, Json(outcome.into())))
}

/// Store failures and early progress tags are worth another delivery
fn redeliverable(err: EngineError) -> EngineError {
    match err {
        EngineError::Store(_) | EngineError::ProtocolViolation(_) => {
            EngineError::Reconcile(err.to_string())
        }
        other => other,
    }
}
