//! Runner API Handlers
//!
//! Timeline reads and the manual-sync marker.

use axum::{
    Json,
    extract::{Path, State},
};
use chrono::Utc;
use keel_core::domain::timeline::TimelineEntry;
use serde::Serialize;

use crate::api::error::ApiResult;
use crate::service::Engine;

#[derive(Debug, Serialize)]
pub struct SyncAck {
    pub recorded: bool,
}

/// POST /v1/runners/{id}/sync-completed
/// Record that the operator synced the application
pub async fn sync_completed(
    State(engine): State<Engine>,
    Path(id): Path<i64>,
) -> ApiResult<Json<SyncAck>> {
    tracing::info!("Sync completed for runner {}", id);

    let outcome = engine.timeline.mark_sync_completed(id, Utc::now()).await?;

    Ok(Json(SyncAck {
        recorded: outcome.is_appended(),
    }))
}

/// GET /v1/runners/{id}/timeline
/// Timeline entries of a runner in status-time order
pub async fn get_timeline(
    State(engine): State<Engine>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<TimelineEntry>>> {
    tracing::debug!("Getting timeline for runner {}", id);

    let entries = engine.timeline.timeline(id).await?;
    Ok(Json(entries))
}
