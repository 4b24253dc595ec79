//! CD event dispatch
//!
//! Builds [`CdEvent`]s for runner milestones and hands them to the notifier
//! off the caller's path. Notification failures are logged, never returned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::collab::Notifier;
use keel_core::domain::runner::Runner;
use keel_core::dto::event::{CdEvent, CdEventKind};
use uuid::Uuid;

use crate::error::StoreError;
use crate::repository::Stores;

#[derive(Clone)]
pub struct CdEventDispatcher {
    stores: Stores,
    notifier: Arc<dyn Notifier>,
}

impl CdEventDispatcher {
    pub fn new(stores: Stores, notifier: Arc<dyn Notifier>) -> Self {
        Self { stores, notifier }
    }

    /// Sends an event for `runner` in the background
    pub fn dispatch(
        &self,
        kind: CdEventKind,
        runner: &Runner,
        correlation_id: Uuid,
        time: DateTime<Utc>,
        message: Option<String>,
    ) {
        let this = self.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            let event = match this.build(kind, &runner, correlation_id, time, message).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    tracing::warn!("No pipeline found for runner {}, CD event skipped", runner.id);
                    return;
                }
                Err(e) => {
                    tracing::error!("Failed to build CD event for runner {}: {}", runner.id, e);
                    return;
                }
            };

            if let Err(e) = this.notifier.write_cd_event(&event).await {
                tracing::warn!(
                    "[{}] Failed to deliver {:?} event for runner {}: {}",
                    correlation_id,
                    kind,
                    runner.id,
                    e
                );
            }
        });
    }

    async fn build(
        &self,
        kind: CdEventKind,
        runner: &Runner,
        correlation_id: Uuid,
        time: DateTime<Utc>,
        message: Option<String>,
    ) -> Result<Option<CdEvent>, StoreError> {
        let Some(workflow) = self.stores.workflows.find_workflow(runner.workflow_id).await? else {
            return Ok(None);
        };
        let Some(pipeline) = self.stores.catalog.find_pipeline(workflow.pipeline_id).await? else {
            return Ok(None);
        };

        let deployment_type = match runner.release_override_id {
            Some(id) => self
                .stores
                .releases
                .find_by_id(id)
                .await?
                .map(|r| r.deployment_type)
                .unwrap_or_default(),
            None => Default::default(),
        };

        Ok(Some(CdEvent {
            kind,
            app_id: pipeline.app_id,
            env_id: pipeline.env_id,
            pipeline_id: pipeline.id,
            runner_id: runner.id,
            stage: runner.stage,
            deployment_type,
            triggered_by: runner.triggered_by,
            correlation_id: correlation_id.to_string(),
            time,
            message,
        }))
    }
}
