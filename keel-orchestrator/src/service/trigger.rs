//! Trigger Service
//!
//! Runs one deployment trigger end to end: validate the request, resolve the
//! environment override, compose the values, journal the release, create the
//! runner, publish the manifest. Also retires older in-flight runners of the
//! pipeline once a newer release is on its way.

use chrono::Utc;
use keel_core::domain::catalog::{Application, Artifact, Environment, Pipeline};
use keel_core::domain::chart::{AppChart, ChartRef, EnvOverride, NewEnvOverride};
use keel_core::domain::history::DeploymentHistory;
use keel_core::domain::release::ReleaseOverride;
use keel_core::domain::runner::{NewRunner, Runner, RunnerStatus, WorkflowStage};
use keel_core::domain::timeline::TimelineStatus;
use keel_core::dto::event::CdEventKind;
use keel_core::dto::trigger::{CdWorkflowType, DeploymentWithConfig, TriggerOutcome, TriggerRequest};
use serde_json::json;
use tracing::Instrument;

use crate::context::TriggerContext;
use crate::error::{EngineError, JournalError, Result, StoreError};
use crate::repository::Stores;
use crate::service::composer::{ComposeSource, Composer, Composition, PinnedConfig};
use crate::service::journal::{NewDeployment, ReleaseJournal};
use crate::service::metrics::CdMetrics;
use crate::service::notify::CdEventDispatcher;
use crate::service::publisher::{ManifestPublisher, PublishTarget};
use crate::service::timeline::TimelineEngine;

/// Catalog rows a trigger works on
struct Subject {
    app: Application,
    env: Environment,
    pipeline: Pipeline,
    artifact: Artifact,
}

/// Chart and environment override a deploy composes from
struct ChartSelection {
    app_chart: AppChart,
    chart_ref: ChartRef,
    env_override: EnvOverride,
    pinned: Option<PinnedConfig>,
}

#[derive(Clone)]
pub struct TriggerService {
    stores: Stores,
    composer: Composer,
    journal: ReleaseJournal,
    publisher: ManifestPublisher,
    timeline: TimelineEngine,
    events: CdEventDispatcher,
    metrics: CdMetrics,
}

impl TriggerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Stores,
        composer: Composer,
        journal: ReleaseJournal,
        publisher: ManifestPublisher,
        timeline: TimelineEngine,
        events: CdEventDispatcher,
        metrics: CdMetrics,
    ) -> Self {
        Self {
            stores,
            composer,
            journal,
            publisher,
            timeline,
            events,
            metrics,
        }
    }

    /// Accepts a trigger. Publish failures are reported in the outcome; the
    /// runner is already failed when that happens.
    pub async fn trigger(
        &self,
        ctx: &TriggerContext,
        req: &TriggerRequest,
    ) -> Result<TriggerOutcome> {
        let span = tracing::info_span!(
            "trigger",
            correlation_id = %ctx.correlation_id,
            pipeline_id = req.pipeline_id
        );
        async {
            let subject = self.load_subject(req).await?;
            let stage = match req.cd_workflow_type {
                CdWorkflowType::Deploy => return self.deploy(ctx, req, subject).await,
                CdWorkflowType::Pre => WorkflowStage::Pre,
                CdWorkflowType::Post => WorkflowStage::Post,
            };
            self.queue_stage(ctx, req, &subject, stage).await
        }
        .instrument(span)
        .await
    }

    async fn load_subject(&self, req: &TriggerRequest) -> Result<Subject> {
        let catalog = &self.stores.catalog;

        let pipeline = catalog
            .find_pipeline(req.pipeline_id)
            .await?
            .filter(|p| !p.deleted)
            .ok_or_else(|| EngineError::NotFound(format!("pipeline {}", req.pipeline_id)))?;
        if pipeline.app_id != req.app_id {
            return Err(EngineError::Validation(format!(
                "pipeline {} does not belong to app {}",
                pipeline.id, req.app_id
            )));
        }

        if req.deployment_with_config == DeploymentWithConfig::SpecificTrigger
            && req.wfr_id_for_specific_trigger.is_none()
        {
            return Err(EngineError::Validation(
                "wfrIdForSpecificTrigger is required for SPECIFIC_TRIGGER".to_string(),
            ));
        }

        let app = catalog
            .find_application(pipeline.app_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("app {}", pipeline.app_id)))?;
        let env = catalog
            .find_environment(pipeline.env_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("environment {}", pipeline.env_id)))?;
        let artifact = catalog
            .find_artifact(req.ci_artifact_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("artifact {}", req.ci_artifact_id)))?;

        Ok(Subject {
            app,
            env,
            pipeline,
            artifact,
        })
    }

    /// PRE and POST stages are recorded for an external executor
    async fn queue_stage(
        &self,
        ctx: &TriggerContext,
        req: &TriggerRequest,
        subject: &Subject,
        stage: WorkflowStage,
    ) -> Result<TriggerOutcome> {
        let now = Utc::now();
        let mut tx = self.stores.transactions.begin().await?;
        let workflow = self
            .stores
            .workflows
            .create_workflow(tx.as_mut(), subject.pipeline.id, subject.artifact.id, now)
            .await?;
        let runner = self
            .stores
            .workflows
            .create_runner(
                tx.as_mut(),
                &NewRunner {
                    workflow_id: workflow.id,
                    release_override_id: None,
                    stage,
                    status: RunnerStatus::Queued,
                    deploy_target: subject.pipeline.deploy_target,
                    started_on: now,
                    triggered_by: req.user_id,
                },
            )
            .await?;
        tx.commit().await?;

        tracing::info!("{} runner {} queued", stage, runner.id);
        self.events
            .dispatch(CdEventKind::Trigger, &runner, ctx.correlation_id, now, None);
        self.metrics.trigger_accepted(subject.pipeline.id);

        Ok(TriggerOutcome {
            release: None,
            runner,
            commit: None,
            publish_error: None,
        })
    }

    async fn deploy(
        &self,
        ctx: &TriggerContext,
        req: &TriggerRequest,
        subject: Subject,
    ) -> Result<TriggerOutcome> {
        let selection = match req.deployment_with_config {
            DeploymentWithConfig::LastSaved => self.last_saved(req, &subject).await?,
            DeploymentWithConfig::SpecificTrigger => self.specific_trigger(req, &subject).await?,
        };

        // Forced triggers always use the pipeline default
        let strategy = match req.strategy {
            Some(strategy) if !req.force_trigger => strategy,
            _ => subject.pipeline.default_strategy,
        };

        let source = ComposeSource {
            app: subject.app,
            env: subject.env,
            pipeline: subject.pipeline,
            artifact: subject.artifact,
            chart_ref: selection.chart_ref,
            app_chart: selection.app_chart,
            env_override: selection.env_override,
            strategy,
            deployment_type: req.deployment_type,
            additional_override: req.additional_override.clone(),
            pinned: selection.pinned,
        };
        let prepared = self.composer.prepare(source).await?;
        let source = prepared.source();

        // Compose before anything is persisted; only the counter can change
        let predicted = self.next_counter(source.pipeline.id).await?;
        let mut composition = prepared.render(predicted)?;

        if ctx.is_cancelled() {
            return Err(JournalError::Cancelled.into());
        }

        let now = Utc::now();
        let (release, runner) = self
            .journal
            .begin_deployment(
                ctx,
                &NewDeployment {
                    pipeline_id: source.pipeline.id,
                    env_override_id: source.env_override.id,
                    artifact_id: source.artifact.id,
                    deployment_type: req.deployment_type,
                    strategy,
                    deploy_target: source.pipeline.deploy_target,
                    user_id: req.user_id,
                    time: now,
                },
            )
            .await?;

        if release.counter != predicted {
            composition = match prepared.render(release.counter) {
                Ok(composition) => composition,
                Err(e) => {
                    self.timeline
                        .append(runner.id, TimelineStatus::Failed, e.to_string(), Utc::now())
                        .await?;
                    return Err(e.into());
                }
            };
        }

        self.record(&release, &runner, source, &composition, req.user_id)
            .await?;
        self.supersede(&runner, source.pipeline.id).await?;
        self.timeline
            .append(
                runner.id,
                TimelineStatus::DeploymentInitiated,
                format!("Deployment initiated by user {}", req.user_id),
                now,
            )
            .await?;

        self.events
            .dispatch(CdEventKind::Trigger, &runner, ctx.correlation_id, now, None);
        self.metrics.trigger_accepted(source.pipeline.id);

        let target = PublishTarget {
            app: &source.app,
            env: &source.env,
            pipeline: &source.pipeline,
            app_chart: &source.app_chart,
            chart_ref: &source.chart_ref,
            release: &release,
            user_id: req.user_id,
        };
        let (commit, publish_error) = match self
            .publisher
            .publish(ctx, &runner, target, &composition.values)
            .await
        {
            Ok(commit) => (Some(commit), None),
            Err(EngineError::Publish(e)) => (None, Some(e.provider_message())),
            Err(e) => return Err(e),
        };

        let release = self
            .stores
            .releases
            .find_by_id(release.id)
            .await?
            .unwrap_or(release);
        let runner = self
            .stores
            .workflows
            .find_runner(runner.id)
            .await?
            .unwrap_or(runner);

        tracing::info!(
            "Release {} (counter {}) runner {} is {}",
            release.id,
            release.counter,
            runner.id,
            runner.status
        );
        Ok(TriggerOutcome {
            release: Some(release),
            runner,
            commit,
            publish_error,
        })
    }

    /// Latest saved override, created empty on the first deploy of (app, env)
    async fn last_saved(&self, req: &TriggerRequest, subject: &Subject) -> Result<ChartSelection> {
        let app_id = subject.app.id;
        let env_id = subject.env.id;

        let env_override = match self.stores.env_overrides.find_latest(app_id, env_id).await? {
            Some(o) => o,
            None => self.create_override(req, subject).await?,
        };

        let app_chart = self
            .stores
            .charts
            .find_app_chart(env_override.chart_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("app chart {}", env_override.chart_id)))?;
        let chart_ref = self.chart_ref(&app_chart).await?;

        Ok(ChartSelection {
            app_chart,
            chart_ref,
            env_override,
            pinned: None,
        })
    }

    async fn create_override(&self, req: &TriggerRequest, subject: &Subject) -> Result<EnvOverride> {
        let app_id = subject.app.id;
        let env_id = subject.env.id;
        let app_chart = self
            .stores
            .charts
            .find_latest_app_chart(app_id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("app {} has no chart", app_id)))?;

        let new = NewEnvOverride {
            app_id,
            env_id,
            chart_id: app_chart.id,
            values: json!({}),
            namespace: subject.env.namespace.clone(),
            is_override: false,
            latest: true,
            created_by: req.user_id,
        };

        let mut tx = self.stores.transactions.begin().await?;
        match self.stores.env_overrides.save_if_absent(tx.as_mut(), &new).await {
            Ok(created) => {
                tx.commit().await?;
                tracing::info!(
                    "Created environment override {} for app {} env {}",
                    created.id,
                    app_id,
                    env_id
                );
                Ok(created)
            }
            // A concurrent first deploy created it
            Err(StoreError::Conflict(_)) => {
                tx.rollback().await?;
                self.stores
                    .env_overrides
                    .find_latest(app_id, env_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::NotFound(format!(
                            "environment override for app {} env {}",
                            app_id, env_id
                        ))
                    })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Configuration shipped by an earlier runner of the same pipeline
    async fn specific_trigger(
        &self,
        req: &TriggerRequest,
        subject: &Subject,
    ) -> Result<ChartSelection> {
        let pipeline_id = subject.pipeline.id;
        let wfr_id = req.wfr_id_for_specific_trigger.ok_or_else(|| {
            EngineError::Validation("wfrIdForSpecificTrigger is required".to_string())
        })?;

        let history = self
            .stores
            .history
            .find_by_pipeline_and_runner(pipeline_id, wfr_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "deployment history of runner {} on pipeline {}",
                    wfr_id, pipeline_id
                ))
            })?;

        let runner = self
            .stores
            .workflows
            .find_runner(wfr_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("runner {}", wfr_id)))?;
        let release_id = runner.release_override_id.ok_or_else(|| {
            EngineError::Validation(format!("runner {} has no release", wfr_id))
        })?;
        let release = self
            .stores
            .releases
            .find_by_id(release_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("release {}", release_id)))?;
        let env_override = self
            .stores
            .env_overrides
            .find_by_id(release.env_override_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("environment override {}", release.env_override_id))
            })?;

        let app_chart = self
            .stores
            .charts
            .find_app_chart(env_override.chart_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("app chart {}", env_override.chart_id)))?;
        let chart_ref = self
            .stores
            .charts
            .find_chart_ref(history.chart_ref_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("chart ref {}", history.chart_ref_id)))?;

        Ok(ChartSelection {
            app_chart,
            chart_ref,
            env_override,
            pinned: Some(PinnedConfig {
                template: history.template,
                strategy_config: history.strategy_config,
                config_maps: history.config_maps,
            }),
        })
    }

    async fn chart_ref(&self, app_chart: &AppChart) -> Result<ChartRef> {
        self.stores
            .charts
            .find_chart_ref(app_chart.chart_ref_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("chart ref {}", app_chart.chart_ref_id)))
    }

    async fn next_counter(&self, pipeline_id: i64) -> Result<i64> {
        let releases = self.stores.releases.list_by_pipeline(pipeline_id).await?;
        Ok(releases.last().map_or(0, |r| r.counter) + 1)
    }

    /// Stores the merged values and the deployment history of a release
    async fn record(
        &self,
        release: &ReleaseOverride,
        runner: &Runner,
        source: &ComposeSource,
        composition: &Composition,
        user_id: i64,
    ) -> Result<()> {
        self.stores
            .releases
            .save_merged_values(release.id, &composition.values)
            .await?;

        let history = DeploymentHistory {
            id: 0,
            pipeline_id: source.pipeline.id,
            runner_id: runner.id,
            chart_ref_id: source.chart_ref.id,
            template: composition.template.clone(),
            strategy: release.strategy,
            strategy_config: composition.strategy_config.clone(),
            config_maps: composition.config_maps.clone(),
            secrets: composition.secrets.clone(),
            variable_snapshot: composition.variable_snapshot.clone(),
            deployed_on: release.created_on,
            deployed_by: user_id,
        };
        self.stores.history.save(&history).await?;
        Ok(())
    }

    /// Fails older deploy runners of the pipeline that are still in flight
    async fn supersede(&self, runner: &Runner, pipeline_id: i64) -> Result<()> {
        let active = self
            .stores
            .workflows
            .list_active_deploy_runners(Some(pipeline_id))
            .await?;

        for older in active.iter().filter(|r| r.id < runner.id) {
            let outcome = self
                .timeline
                .append(
                    older.id,
                    TimelineStatus::DeploymentSuperseded,
                    format!("Superseded by runner {}", runner.id),
                    Utc::now(),
                )
                .await?;
            if outcome.is_appended() {
                tracing::info!("Runner {} superseded by {}", older.id, runner.id);
            }
        }
        Ok(())
    }
}
