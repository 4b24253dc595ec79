//! Manifest Publisher
//!
//! Ships a composed values document either as a commit to the application's
//! GitOps repository or as a chart bundle pushed to a registry. Success is
//! recorded as the release's commit identity plus a GIT_COMMIT entry; any
//! failure becomes a GIT_COMMIT_FAILED entry, which fails the runner.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use keel_core::collab::{
    ChartBundle, ChartRegistry, CommitAuthor, GitOpsClient, UserDirectory, ValuesCommit,
};
use keel_core::domain::catalog::{Application, DeployTarget, Environment, Pipeline};
use keel_core::domain::chart::{AppChart, ChartRef};
use keel_core::domain::release::{CommitIdentity, ReleaseOverride, ReleaseStatus};
use keel_core::domain::runner::Runner;
use keel_core::domain::timeline::TimelineStatus;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::context::TriggerContext;
use crate::error::{EngineError, PublishError};
use crate::service::journal::ReleaseJournal;
use crate::service::metrics::CdMetrics;
use crate::service::timeline::TimelineEngine;

pub const BOT_NAME: &str = "keel-bot";
pub const BOT_EMAIL: &str = "keel-bot@keel.local";

/// Where and what to publish
#[derive(Debug, Clone, Copy)]
pub struct PublishTarget<'a> {
    pub app: &'a Application,
    pub env: &'a Environment,
    pub pipeline: &'a Pipeline,
    pub app_chart: &'a AppChart,
    pub chart_ref: &'a ChartRef,
    pub release: &'a ReleaseOverride,
    pub user_id: i64,
}

/// Path of the values file for an environment inside the chart directory
pub fn values_file_path(chart_location: &str, env_id: i64) -> String {
    let dir = chart_location.trim_end_matches('/');
    if dir.is_empty() {
        format!("_{}-values.yaml", env_id)
    } else {
        format!("{}/_{}-values.yaml", dir, env_id)
    }
}

pub fn commit_message(counter: i64, env_name: &str) -> String {
    format!("release-{}-env-{}", counter, env_name)
}

#[derive(Clone)]
pub struct ManifestPublisher {
    gitops: Arc<dyn GitOpsClient>,
    registry: Arc<dyn ChartRegistry>,
    users: Arc<dyn UserDirectory>,
    journal: ReleaseJournal,
    timeline: TimelineEngine,
    config: EngineConfig,
    metrics: CdMetrics,
    repo_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ManifestPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gitops: Arc<dyn GitOpsClient>,
        registry: Arc<dyn ChartRegistry>,
        users: Arc<dyn UserDirectory>,
        journal: ReleaseJournal,
        timeline: TimelineEngine,
        config: EngineConfig,
        metrics: CdMetrics,
    ) -> Self {
        Self {
            gitops,
            registry,
            users,
            journal,
            timeline,
            config,
            metrics,
            repo_locks: Arc::new(DashMap::new()),
        }
    }

    /// Publishes `values` for the runner's release
    pub async fn publish(
        &self,
        ctx: &TriggerContext,
        runner: &Runner,
        target: PublishTarget<'_>,
        values: &Value,
    ) -> Result<CommitIdentity, EngineError> {
        let result = match target.pipeline.deploy_target {
            DeployTarget::Gitops => self.commit_values(target, values).await,
            DeployTarget::ChartPush => self.push_chart(target, values).await,
        };

        let commit = match result {
            Ok(commit) => commit,
            Err(e) => {
                tracing::error!(
                    "[{}] Publishing release {} failed: {}",
                    ctx.correlation_id,
                    target.release.id,
                    e
                );
                self.metrics.publish_failed();
                if let Err(append_err) = self
                    .timeline
                    .append(
                        runner.id,
                        TimelineStatus::GitCommitFailed,
                        e.provider_message(),
                        Utc::now(),
                    )
                    .await
                {
                    tracing::error!(
                        "[{}] Could not record publish failure for runner {}: {}",
                        ctx.correlation_id,
                        runner.id,
                        append_err
                    );
                }
                return Err(e.into());
            }
        };

        // Commit identity first, so reconciler events can match it
        self.journal
            .finalize(target.release.id, ReleaseStatus::New, Some(&commit))
            .await?;
        self.timeline
            .append(
                runner.id,
                TimelineStatus::GitCommit,
                format!("Committed {}", commit.commit_hash),
                commit.commit_time,
            )
            .await?;

        tracing::info!(
            "[{}] Release {} published as {}",
            ctx.correlation_id,
            target.release.id,
            commit.commit_hash
        );
        Ok(commit)
    }

    async fn commit_values(
        &self,
        target: PublishTarget<'_>,
        values: &Value,
    ) -> Result<CommitIdentity, PublishError> {
        let repo_name = self.config.repo_name(&target.app.name);
        let lock = self
            .repo_locks
            .entry(repo_name.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        self.gitops
            .ensure_repo(&repo_name)
            .await
            .map_err(PublishError::Git)?;

        let content =
            serde_yaml::to_string(values).map_err(|e| PublishError::Render(e.to_string()))?;
        let commit = ValuesCommit {
            repo_name: repo_name.clone(),
            file_path: values_file_path(&target.app_chart.chart_location, target.env.id),
            content,
            message: commit_message(target.release.counter, &target.env.name),
            author: self.author(target.user_id).await,
        };

        let attempts = self.config.gitops_commit_retries.max(1);
        let mut attempt = 0;
        let git_commit = loop {
            attempt += 1;
            match self.gitops.commit_values(&commit).await {
                Ok(c) => break c,
                Err(e) if e.is_conflict() && attempt < attempts => {
                    tracing::warn!(
                        "Commit to {} conflicted (attempt {}/{}), retrying",
                        repo_name,
                        attempt,
                        attempts
                    );
                }
                Err(e) => return Err(PublishError::Git(e)),
            }
        };

        Ok(CommitIdentity {
            commit_hash: git_commit.hash,
            commit_time: git_commit.time.unwrap_or_else(Utc::now),
        })
    }

    async fn push_chart(
        &self,
        target: PublishTarget<'_>,
        values: &Value,
    ) -> Result<CommitIdentity, PublishError> {
        let bundle = package_chart(
            &target.pipeline.deployment_app_name,
            &target.chart_ref.version,
            target.release.counter,
            values,
        )?;

        let pushed = self
            .registry
            .push(&bundle)
            .await
            .map_err(PublishError::Registry)?;

        if pushed.digest != bundle.digest {
            tracing::warn!(
                "Registry reported digest {} for bundle {}",
                pushed.digest,
                bundle.digest
            );
        }

        Ok(CommitIdentity {
            commit_hash: pushed.digest,
            commit_time: pushed.commit_time.unwrap_or_else(Utc::now),
        })
    }

    /// Commit author for a user; unknown users commit as the bot
    async fn author(&self, user_id: i64) -> CommitAuthor {
        match self.users.get_by_id_include_deleted(user_id).await {
            Ok(Some(user)) => CommitAuthor {
                name: user.display_name().to_string(),
                email: user.email.clone(),
            },
            Ok(None) => bot_author(),
            Err(e) => {
                tracing::warn!("User lookup for {} failed, committing as bot: {}", user_id, e);
                bot_author()
            }
        }
    }
}

fn bot_author() -> CommitAuthor {
    CommitAuthor {
        name: BOT_NAME.to_string(),
        email: BOT_EMAIL.to_string(),
    }
}

/// Packages a chart bundle: an uncompressed tar of `Chart.yaml` and
/// `values.yaml` under the chart directory, with fixed metadata so equal
/// input gives an equal digest
pub fn package_chart(
    name: &str,
    chart_version: &str,
    counter: i64,
    values: &Value,
) -> Result<ChartBundle, PublishError> {
    let version = format!("{}-{}", chart_version, counter);
    let chart_yaml = format!("apiVersion: v2\nname: {}\nversion: {}\n", name, version);
    let values_yaml =
        serde_yaml::to_string(values).map_err(|e| PublishError::Render(e.to_string()))?;

    let mut builder = tar::Builder::new(Vec::new());
    for (file, content) in [("Chart.yaml", chart_yaml), ("values.yaml", values_yaml)] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{}/{}", name, file), content.as_bytes())
            .map_err(|e| PublishError::Render(e.to_string()))?;
    }
    let bytes = builder
        .into_inner()
        .map_err(|e| PublishError::Render(e.to_string()))?;

    let digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
    Ok(ChartBundle {
        name: name.to_string(),
        version,
        bytes,
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use crate::testing::{self, FakeGitOps};
    use keel_core::collab::CollaboratorError;
    use keel_core::domain::runner::RunnerStatus;
    use serde_json::json;

    #[test]
    fn test_values_file_path() {
        assert_eq!(
            values_file_path("reference-chart_4-18-0/", 2),
            "reference-chart_4-18-0/_2-values.yaml"
        );
        assert_eq!(values_file_path("", 2), "_2-values.yaml");
        assert_eq!(commit_message(7, "prod"), "release-7-env-prod");
    }

    #[test]
    fn test_package_chart_is_deterministic() {
        let a = package_chart("payments-prod", "4.18.0", 3, &json!({"replicaCount": 2})).unwrap();
        let b = package_chart("payments-prod", "4.18.0", 3, &json!({"replicaCount": 2})).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.version, "4.18.0-3");
        assert!(a.digest.starts_with("sha256:"));

        let mut archive = tar::Archive::new(a.bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert_eq!(names, vec!["payments-prod/Chart.yaml", "payments-prod/values.yaml"]);
    }

    async fn publish_with(
        store: &MemoryStore,
        gitops: FakeGitOps,
    ) -> (Result<CommitIdentity, EngineError>, i64, i64, Arc<FakeGitOps>) {
        let gitops = Arc::new(gitops);
        let engine = testing::engine_with(store, gitops.clone(), EngineConfig::default());
        let (runner_id, release_id) = testing::initiated_runner(store).await;
        let fixture = testing::Fixture::load(store).await;
        let state = store.snapshot().await;
        let release = state.releases[&release_id].clone();
        let runner = state.runners[&runner_id].clone();

        let result = engine
            .publisher
            .publish(
                &TriggerContext::new(),
                &runner,
                fixture.target(&release),
                &json!({"replicaCount": 2}),
            )
            .await;
        (result, runner_id, release_id, gitops)
    }

    #[tokio::test]
    async fn test_gitops_publish_records_commit() {
        let store = testing::seeded_store().await;
        let (result, runner_id, release_id, gitops) =
            publish_with(&store, FakeGitOps::default()).await;

        let commit = result.unwrap();
        let state = store.snapshot().await;
        assert_eq!(
            state.releases[&release_id].commit_hash.as_deref(),
            Some(commit.commit_hash.as_str())
        );
        assert_eq!(state.releases[&release_id].status, ReleaseStatus::New);
        assert_eq!(state.runners[&runner_id].status, RunnerStatus::InProgress);

        let commits = gitops.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].repo_name, testing::APP_NAME);
        assert_eq!(
            commits[0].message,
            commit_message(state.releases[&release_id].counter, testing::ENV_NAME)
        );
        assert_eq!(commits[0].author.name, "jane.doe");
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let store = testing::seeded_store().await;
        let (result, _, _, gitops) = publish_with(&store, FakeGitOps::with_conflicts(2)).await;
        assert!(result.is_ok());
        assert_eq!(gitops.attempts(), 3);
    }

    #[tokio::test]
    async fn test_commit_failure_fails_runner_and_release() {
        let store = testing::seeded_store().await;
        let (result, runner_id, release_id, _) = publish_with(
            &store,
            FakeGitOps::failing(CollaboratorError::Rejected {
                status: 403,
                message: "push denied".to_string(),
            }),
        )
        .await;

        assert!(matches!(result, Err(EngineError::Publish(PublishError::Git(_)))));
        let state = store.snapshot().await;
        let failed = state
            .timeline
            .iter()
            .find(|e| e.runner_id == runner_id && e.status == TimelineStatus::GitCommitFailed)
            .unwrap();
        assert_eq!(failed.detail, "push denied");
        assert_eq!(state.runners[&runner_id].status, RunnerStatus::Failed);
        assert_eq!(state.releases[&release_id].status, ReleaseStatus::Failed);
        assert!(state.releases[&release_id].commit_hash.is_none());
    }
}
