//! Status API Handler

use axum::{
    Json,
    extract::{Path, State},
};
use keel_core::domain::status::ProjectedStatus;
use serde::Serialize;

use crate::api::error::ApiResult;
use crate::service::Engine;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppEnvStatus {
    pub app_id: i64,
    pub env_id: i64,
    pub status: ProjectedStatus,
}

/// GET /v1/apps/{app_id}/envs/{env_id}/status
/// Projected status of an application in an environment
pub async fn get_status(
    State(engine): State<Engine>,
    Path((app_id, env_id)): Path<(i64, i64)>,
) -> ApiResult<Json<AppEnvStatus>> {
    let status = engine.status.project(app_id, env_id).await?;
    Ok(Json(AppEnvStatus {
        app_id,
        env_id,
        status,
    }))
}
