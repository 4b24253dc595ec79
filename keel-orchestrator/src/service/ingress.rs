//! Reconciler Ingress
//!
//! Validates application status events from the CD agent and turns them into
//! timeline entries on the runner of the release they describe. Events for
//! superseded revisions are dropped as stale. Matched events for a runner
//! still in flight update the raw app status.

use chrono::{DateTime, Utc};
use keel_core::domain::catalog::{Environment, Pipeline};
use keel_core::domain::release::ReleaseOverride;
use keel_core::domain::runner::{Runner, WorkflowStage};
use keel_core::domain::status::{AppStatus, HealthStatus};
use keel_core::domain::timeline::TimelineStatus;
use keel_core::dto::reconciler::{OperationPhase, ReconcilerEvent};
use tracing::Instrument;

use crate::config::EngineConfig;
use crate::context::TriggerContext;
use crate::error::{EngineError, Result};
use crate::repository::Stores;
use crate::service::metrics::CdMetrics;
use crate::service::timeline::{AppendOutcome, TimelineEngine};

pub const DEGRADED_DETAIL: &str = "App status is Degraded.";

/// What became of an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// No pipeline, release or runner matches the event
    Invalid(String),
    /// The event describes an older revision than the latest release
    Stale,
    RunnerTerminal,
    /// Manual sync is on and the sync-completed marker is missing
    AwaitingSync,
    Applied { appended: Vec<TimelineStatus> },
}

/// The pipeline and release an event belongs to
struct Matched {
    pipeline: Pipeline,
    release: ReleaseOverride,
}

#[derive(Clone)]
pub struct ReconcilerIngress {
    stores: Stores,
    timeline: TimelineEngine,
    config: EngineConfig,
    metrics: CdMetrics,
}

impl ReconcilerIngress {
    pub fn new(
        stores: Stores,
        timeline: TimelineEngine,
        config: EngineConfig,
        metrics: CdMetrics,
    ) -> Self {
        Self {
            stores,
            timeline,
            config,
            metrics,
        }
    }

    /// Handles one event. Errors mean the event should be redelivered.
    pub async fn handle(
        &self,
        ctx: &TriggerContext,
        evt: &ReconcilerEvent,
    ) -> Result<IngressOutcome> {
        if ctx.is_cancelled() {
            return Err(EngineError::Reconcile(format!(
                "event for {} cancelled before handling",
                evt.name
            )));
        }

        let span = tracing::info_span!(
            "event",
            correlation_id = %ctx.correlation_id,
            app = %evt.name
        );
        let outcome = self.process(evt).instrument(span).await?;
        match &outcome {
            IngressOutcome::Invalid(reason) => {
                tracing::debug!("Dropping event for {}: {}", evt.name, reason);
                self.metrics.event_dropped("invalid");
            }
            IngressOutcome::Stale => {
                tracing::debug!("Dropping stale event for {} at {}", evt.name, evt.sync.revision);
                self.metrics.event_dropped("stale");
            }
            IngressOutcome::RunnerTerminal => self.metrics.event_dropped("runner_terminal"),
            IngressOutcome::AwaitingSync => self.metrics.event_dropped("awaiting_sync"),
            IngressOutcome::Applied { appended } if !appended.is_empty() => {
                tracing::info!("Event for {} appended {:?}", evt.name, appended);
            }
            IngressOutcome::Applied { .. } => {}
        }
        Ok(outcome)
    }

    async fn process(&self, evt: &ReconcilerEvent) -> Result<IngressOutcome> {
        let Some(pipeline) = self.match_pipeline(evt).await? else {
            return Ok(IngressOutcome::Invalid(format!(
                "no pipeline deploys {} to cluster {} namespace {}",
                evt.name, evt.cluster_id, evt.namespace
            )));
        };

        let Some(release) = self
            .stores
            .releases
            .find_latest_by_app_env(pipeline.app_id, pipeline.env_id)
            .await?
        else {
            return Ok(IngressOutcome::Invalid(format!(
                "pipeline {} has no release",
                pipeline.id
            )));
        };

        if let Some(outcome) = self.check_revision(evt, &pipeline, &release).await? {
            return Ok(outcome);
        }
        let matched = Matched { pipeline, release };

        let Some(runner) = self
            .stores
            .workflows
            .find_latest_runner(matched.release.workflow_id, WorkflowStage::Deploy)
            .await?
        else {
            return Ok(IngressOutcome::Invalid(format!(
                "release {} has no deploy runner",
                matched.release.id
            )));
        };

        // A finished runner keeps the status it finished with
        if runner.status.is_terminal() {
            return Ok(IngressOutcome::RunnerTerminal);
        }

        let entries = self.stores.timelines.find_by_runner(runner.id).await?;
        if self.config.manual_sync_enabled
            && !entries
                .iter()
                .any(|e| e.status == TimelineStatus::ArgocdSyncCompleted)
        {
            self.record_status(evt, &matched, false).await?;
            return Ok(IngressOutcome::AwaitingSync);
        }

        let appended = self.progress(evt, &runner).await?;
        let settled = appended.iter().any(|tag| tag.is_terminal());
        self.record_status(evt, &matched, settled).await?;
        Ok(IngressOutcome::Applied { appended })
    }

    /// Pipelines bound to the event's application name, narrowed to the
    /// environment the event was observed in
    async fn match_pipeline(&self, evt: &ReconcilerEvent) -> Result<Option<Pipeline>> {
        let candidates = self
            .stores
            .catalog
            .find_pipelines_by_deployment_app_name(&evt.name)
            .await?;

        for pipeline in candidates {
            let Some(env) = self
                .stores
                .catalog
                .find_environment(pipeline.env_id)
                .await?
            else {
                continue;
            };
            if self.env_matches(&env, &pipeline, evt).await? {
                return Ok(Some(pipeline));
            }
        }
        Ok(None)
    }

    async fn env_matches(
        &self,
        env: &Environment,
        pipeline: &Pipeline,
        evt: &ReconcilerEvent,
    ) -> Result<bool> {
        if env.cluster_id != evt.cluster_id {
            return Ok(false);
        }
        if env.namespace == evt.namespace {
            return Ok(true);
        }
        // An override may deploy into a namespace other than the environment's
        let namespace = self
            .stores
            .env_overrides
            .find_latest(pipeline.app_id, pipeline.env_id)
            .await?
            .map(|o| o.namespace);
        Ok(namespace.as_deref() == Some(evt.namespace.as_str()))
    }

    /// `Some` when the event must be dropped because of its revision
    async fn check_revision(
        &self,
        evt: &ReconcilerEvent,
        pipeline: &Pipeline,
        release: &ReleaseOverride,
    ) -> Result<Option<IngressOutcome>> {
        let revision = evt.sync.revision.as_str();
        if revision.is_empty() || release.commit_hash.as_deref() == Some(revision) {
            return Ok(None);
        }

        if let (Some(observed), Some(current)) = (evt.sync.committed_time, release.commit_time) {
            if observed < current {
                return Ok(Some(IngressOutcome::Stale));
            }
        }

        match self
            .stores
            .releases
            .find_by_commit_hash(pipeline.id, revision)
            .await?
        {
            None => Ok(Some(IngressOutcome::Invalid(format!(
                "revision {} is unknown to the journal",
                revision
            )))),
            Some(older) if older.counter < release.counter => Ok(Some(IngressOutcome::Stale)),
            Some(_) => Ok(None),
        }
    }

    /// `settled` marks the status the runner finished with
    async fn record_status(
        &self,
        evt: &ReconcilerEvent,
        matched: &Matched,
        settled: bool,
    ) -> Result<()> {
        let status = AppStatus {
            app_id: matched.pipeline.app_id,
            env_id: matched.pipeline.env_id,
            release_id: matched.release.id,
            status: evt.health.status,
            settled,
            updated_at: evt.event_time().unwrap_or_else(Utc::now),
        };
        if self.stores.app_status.upsert(&status).await? {
            tracing::debug!(
                "App status of app {} env {} is now {}",
                status.app_id,
                status.env_id,
                status.status
            );
        }
        Ok(())
    }

    /// Appends the timeline entries the event supports, in protocol order
    async fn progress(&self, evt: &ReconcilerEvent, runner: &Runner) -> Result<Vec<TimelineStatus>> {
        let mut appended = Vec::new();
        let phase = evt.phase();
        let message = evt
            .operation_state
            .as_ref()
            .map(|s| s.message.clone())
            .unwrap_or_default();

        if let Some(started) = evt.sync.started_at.or(evt.sync.finished_at) {
            self.push(
                &mut appended,
                runner.id,
                TimelineStatus::KubectlApplyStarted,
                "Sync started",
                started,
            )
            .await?;
        }

        if phase == Some(OperationPhase::Succeeded) {
            if let Some(finished) = evt.sync.finished_at {
                self.push(
                    &mut appended,
                    runner.id,
                    TimelineStatus::KubectlApplySynced,
                    "Sync completed",
                    finished,
                )
                .await?;
            }
        }

        if evt.health.status == HealthStatus::Healthy {
            if let Some(reconciled) = evt.reconciled_at {
                let synced_at = self
                    .stores
                    .timelines
                    .find_by_runner(runner.id)
                    .await?
                    .into_iter()
                    .find(|e| e.status == TimelineStatus::KubectlApplySynced)
                    .map(|e| e.status_time);
                if synced_at.is_some_and(|s| reconciled > s) {
                    self.push(
                        &mut appended,
                        runner.id,
                        TimelineStatus::AppHealthy,
                        "App is healthy",
                        reconciled,
                    )
                    .await?;
                }
            }
        }

        if matches!(phase, Some(OperationPhase::Failed | OperationPhase::Error)) {
            let detail = if message.is_empty() {
                "Sync failed".to_string()
            } else {
                message
            };
            let at = evt.sync.finished_at.or(evt.event_time()).unwrap_or_else(Utc::now);
            self.push(&mut appended, runner.id, TimelineStatus::Failed, detail, at)
                .await?;
        }

        if evt.health.status == HealthStatus::Degraded {
            let at = evt.event_time().unwrap_or_else(Utc::now);
            if self.degraded_too_long(runner, at) {
                self.push(
                    &mut appended,
                    runner.id,
                    TimelineStatus::Failed,
                    DEGRADED_DETAIL,
                    at,
                )
                .await?;
            }
        }

        Ok(appended)
    }

    fn degraded_too_long(&self, runner: &Runner, at: DateTime<Utc>) -> bool {
        (at - runner.started_on)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= self.config.degraded_time)
    }

    async fn push(
        &self,
        appended: &mut Vec<TimelineStatus>,
        runner_id: i64,
        tag: TimelineStatus,
        detail: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Result<()> {
        if let AppendOutcome::Appended(_) =
            self.timeline.append(runner_id, tag, detail, time).await?
        {
            appended.push(tag);
        }
        Ok(())
    }
}
