//! Release Journal
//!
//! Assigns dense, per-pipeline release counters. The counter is read and the
//! row inserted in one transaction; a post-commit guard re-checks uniqueness
//! and re-numbers the row if another writer raced it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::domain::catalog::{DeployTarget, DeploymentStrategy};
use keel_core::domain::release::{
    CommitIdentity, DeploymentType, NewRelease, ReleaseOverride, ReleaseStatus,
};
use keel_core::domain::runner::{NewRunner, Runner, RunnerStatus, WorkflowStage};

use crate::context::TriggerContext;
use crate::error::JournalError;
use crate::repository::{
    ReleaseRepository, Stores, Transaction, TransactionManager, WorkflowRepository,
};

/// Re-saves attempted before a duplicate counter is reported
pub const GUARD_ATTEMPTS: u32 = 5;

/// Everything a deploy trigger persists up front: a workflow, its release
/// and the deploy runner
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub pipeline_id: i64,
    pub env_override_id: i64,
    pub artifact_id: i64,
    pub deployment_type: DeploymentType,
    pub strategy: DeploymentStrategy,
    pub deploy_target: DeployTarget,
    pub user_id: i64,
    pub time: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReleaseJournal {
    transactions: Arc<dyn TransactionManager>,
    releases: Arc<dyn ReleaseRepository>,
    workflows: Arc<dyn WorkflowRepository>,
}

impl ReleaseJournal {
    pub fn new(stores: &Stores) -> Self {
        Self {
            transactions: stores.transactions.clone(),
            releases: stores.releases.clone(),
            workflows: stores.workflows.clone(),
        }
    }

    /// Persists a new release with the next counter of its pipeline
    pub async fn begin_release(
        &self,
        ctx: &TriggerContext,
        new: &NewRelease,
    ) -> Result<ReleaseOverride, JournalError> {
        let mut tx = self.transactions.begin().await?;
        let release = self.insert_release(tx.as_mut(), new).await?;
        self.commit(ctx, tx, new.pipeline_id).await?;
        self.guard(ctx, release).await
    }

    /// Persists the workflow, release and deploy runner of a trigger in one
    /// transaction. On any error none of them remains in flight.
    pub async fn begin_deployment(
        &self,
        ctx: &TriggerContext,
        new: &NewDeployment,
    ) -> Result<(ReleaseOverride, Runner), JournalError> {
        let mut tx = self.transactions.begin().await?;

        let workflow = self
            .workflows
            .create_workflow(tx.as_mut(), new.pipeline_id, new.artifact_id, new.time)
            .await?;
        let release = self
            .insert_release(
                tx.as_mut(),
                &NewRelease {
                    pipeline_id: new.pipeline_id,
                    env_override_id: new.env_override_id,
                    artifact_id: new.artifact_id,
                    workflow_id: workflow.id,
                    deployment_type: new.deployment_type,
                    strategy: new.strategy,
                    user_id: new.user_id,
                    time: new.time,
                },
            )
            .await?;
        let runner = self
            .workflows
            .create_runner(
                tx.as_mut(),
                &NewRunner {
                    workflow_id: workflow.id,
                    release_override_id: Some(release.id),
                    stage: WorkflowStage::Deploy,
                    status: RunnerStatus::Initiated,
                    deploy_target: new.deploy_target,
                    started_on: new.time,
                    triggered_by: new.user_id,
                },
            )
            .await?;
        self.commit(ctx, tx, new.pipeline_id).await?;

        match self.guard(ctx, release.clone()).await {
            Ok(release) => Ok((release, runner)),
            Err(e) => {
                self.abandon(&release, &runner, &e).await?;
                Err(e)
            }
        }
    }

    async fn insert_release(
        &self,
        tx: &mut dyn Transaction,
        new: &NewRelease,
    ) -> Result<ReleaseOverride, JournalError> {
        let current = self.releases.current_counter(tx, new.pipeline_id).await?;
        Ok(self.releases.insert(tx, new, current + 1).await?)
    }

    /// Commits unless the trigger was cancelled meanwhile
    async fn commit(
        &self,
        ctx: &TriggerContext,
        tx: Box<dyn Transaction>,
        pipeline_id: i64,
    ) -> Result<(), JournalError> {
        if ctx.is_cancelled() {
            tx.rollback().await?;
            tracing::info!(
                "[{}] Trigger cancelled before release commit on pipeline {}",
                ctx.correlation_id,
                pipeline_id
            );
            return Err(JournalError::Cancelled);
        }
        tx.commit().await?;
        Ok(())
    }

    /// Re-numbers a committed release until it owns its counter
    async fn guard(
        &self,
        ctx: &TriggerContext,
        mut release: ReleaseOverride,
    ) -> Result<ReleaseOverride, JournalError> {
        let mut attempts = 0;
        loop {
            if self.is_unique(&release).await? {
                tracing::info!(
                    "[{}] Release {} created with counter {} on pipeline {}",
                    ctx.correlation_id,
                    release.id,
                    release.counter,
                    release.pipeline_id
                );
                return Ok(release);
            }

            if attempts == GUARD_ATTEMPTS {
                tracing::error!(
                    "[{}] Release counter {} still duplicated on pipeline {}",
                    ctx.correlation_id,
                    release.counter,
                    release.pipeline_id
                );
                return Err(JournalError::Duplicate {
                    pipeline_id: release.pipeline_id,
                    attempts,
                });
            }
            attempts += 1;

            tracing::warn!(
                "[{}] Duplicate release counter {} on pipeline {}, renumbering (attempt {})",
                ctx.correlation_id,
                release.counter,
                release.pipeline_id,
                attempts
            );
            release.counter = self.renumber(&release).await?;
        }
    }

    /// Fails a committed release and its runner the guard could not keep
    async fn abandon(
        &self,
        release: &ReleaseOverride,
        runner: &Runner,
        cause: &JournalError,
    ) -> Result<(), JournalError> {
        let message = cause.to_string();
        let mut tx = self.transactions.begin().await?;
        self.releases
            .finalize(tx.as_mut(), release.id, ReleaseStatus::Failed, None)
            .await?;
        self.workflows
            .update_runner_status(
                tx.as_mut(),
                runner.id,
                RunnerStatus::Failed,
                Some(Utc::now()),
                Some(&message),
            )
            .await?;
        tx.commit().await?;
        tracing::warn!("Release {} and runner {} abandoned: {}", release.id, runner.id, message);
        Ok(())
    }

    /// Records the outcome of a release; a no-op once it is terminal
    pub async fn finalize(
        &self,
        release_id: i64,
        status: ReleaseStatus,
        commit: Option<&CommitIdentity>,
    ) -> Result<bool, JournalError> {
        let mut tx = self.transactions.begin().await?;
        let changed = self
            .releases
            .finalize(tx.as_mut(), release_id, status, commit)
            .await?;
        tx.commit().await?;

        if changed {
            tracing::debug!("Release {} finalized as {}", release_id, status);
        }
        Ok(changed)
    }

    /// The oldest row holding a counter owns it
    async fn is_unique(&self, release: &ReleaseOverride) -> Result<bool, JournalError> {
        let rows = self
            .releases
            .find_by_pipeline_and_counter(release.pipeline_id, release.counter)
            .await?;
        Ok(rows.first().is_none_or(|first| first.id == release.id))
    }

    async fn renumber(&self, release: &ReleaseOverride) -> Result<i64, JournalError> {
        let mut tx = self.transactions.begin().await?;
        let current = self
            .releases
            .current_counter(tx.as_mut(), release.pipeline_id)
            .await?;
        let counter = current + 1;
        self.releases
            .update_counter(tx.as_mut(), release.id, counter)
            .await?;
        tx.commit().await?;
        Ok(counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::repository::{MemoryStore, Transaction};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn new_release(pipeline_id: i64) -> NewRelease {
        NewRelease {
            pipeline_id,
            env_override_id: 1,
            artifact_id: 1,
            workflow_id: 1,
            deployment_type: DeploymentType::Deploy,
            strategy: DeploymentStrategy::Rolling,
            user_id: 1,
            time: Utc::now(),
        }
    }

    /// Delegates to a memory store; the first `stale_reads` counter reads
    /// lag one release behind, as a racing writer would see them
    struct RacyReleases {
        inner: MemoryStore,
        stale_reads: AtomicU32,
        always_shadowed: bool,
        /// Cancelled once the release row is written, before commit
        cancel_on_insert: Option<CancellationToken>,
    }

    #[async_trait]
    impl ReleaseRepository for RacyReleases {
        async fn current_counter(
            &self,
            tx: &mut dyn Transaction,
            pipeline_id: i64,
        ) -> Result<i64, StoreError> {
            let real = self.inner.current_counter(tx, pipeline_id).await?;
            let stale = self
                .stale_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Ok(if stale { (real - 1).max(0) } else { real })
        }

        async fn insert(
            &self,
            tx: &mut dyn Transaction,
            new: &NewRelease,
            counter: i64,
        ) -> Result<ReleaseOverride, StoreError> {
            let release = self.inner.insert(tx, new, counter).await?;
            if let Some(token) = &self.cancel_on_insert {
                token.cancel();
            }
            Ok(release)
        }

        async fn update_counter(
            &self,
            tx: &mut dyn Transaction,
            id: i64,
            counter: i64,
        ) -> Result<(), StoreError> {
            self.inner.update_counter(tx, id, counter).await
        }

        async fn finalize(
            &self,
            tx: &mut dyn Transaction,
            id: i64,
            status: ReleaseStatus,
            commit: Option<&CommitIdentity>,
        ) -> Result<bool, StoreError> {
            self.inner.finalize(tx, id, status, commit).await
        }

        async fn find_by_pipeline_and_counter(
            &self,
            pipeline_id: i64,
            counter: i64,
        ) -> Result<Vec<ReleaseOverride>, StoreError> {
            let mut rows = self
                .inner
                .find_by_pipeline_and_counter(pipeline_id, counter)
                .await?;
            if self.always_shadowed {
                if let Some(first) = rows.first().cloned() {
                    rows.insert(0, ReleaseOverride { id: 0, ..first });
                }
            }
            Ok(rows)
        }

        async fn find_by_id(&self, id: i64) -> Result<Option<ReleaseOverride>, StoreError> {
            ReleaseRepository::find_by_id(&self.inner, id).await
        }

        async fn find_latest_by_app_env(
            &self,
            app_id: i64,
            env_id: i64,
        ) -> Result<Option<ReleaseOverride>, StoreError> {
            self.inner.find_latest_by_app_env(app_id, env_id).await
        }

        async fn find_by_commit_hash(
            &self,
            pipeline_id: i64,
            commit_hash: &str,
        ) -> Result<Option<ReleaseOverride>, StoreError> {
            self.inner.find_by_commit_hash(pipeline_id, commit_hash).await
        }

        async fn list_by_pipeline(
            &self,
            pipeline_id: i64,
        ) -> Result<Vec<ReleaseOverride>, StoreError> {
            self.inner.list_by_pipeline(pipeline_id).await
        }

        async fn save_merged_values(
            &self,
            id: i64,
            values: &serde_json::Value,
        ) -> Result<(), StoreError> {
            self.inner.save_merged_values(id, values).await
        }
    }

    fn racy(store: &MemoryStore, stale_reads: u32, always_shadowed: bool) -> RacyReleases {
        RacyReleases {
            inner: store.clone(),
            stale_reads: AtomicU32::new(stale_reads),
            always_shadowed,
            cancel_on_insert: None,
        }
    }

    fn journal_with(store: &MemoryStore, releases: RacyReleases) -> ReleaseJournal {
        ReleaseJournal {
            transactions: Arc::new(store.clone()),
            releases: Arc::new(releases),
            workflows: Arc::new(store.clone()),
        }
    }

    fn journal_over(store: &MemoryStore, stale_reads: u32, always_shadowed: bool) -> ReleaseJournal {
        journal_with(store, racy(store, stale_reads, always_shadowed))
    }

    fn new_deployment(pipeline_id: i64) -> NewDeployment {
        NewDeployment {
            pipeline_id,
            env_override_id: 1,
            artifact_id: 1,
            deployment_type: DeploymentType::Deploy,
            strategy: DeploymentStrategy::Rolling,
            deploy_target: DeployTarget::Gitops,
            user_id: 1,
            time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_counters_are_dense_per_pipeline() {
        let store = MemoryStore::new();
        let journal = ReleaseJournal::new(&Stores::in_memory(store));
        let ctx = TriggerContext::new();

        let a = journal.begin_release(&ctx, &new_release(1)).await.unwrap();
        let b = journal.begin_release(&ctx, &new_release(1)).await.unwrap();
        let other = journal.begin_release(&ctx, &new_release(2)).await.unwrap();

        assert_eq!((a.counter, b.counter, other.counter), (1, 2, 1));
        assert_eq!(a.status, ReleaseStatus::New);
    }

    #[tokio::test]
    async fn test_concurrent_begins_get_distinct_counters() {
        let store = MemoryStore::new();
        let journal = ReleaseJournal::new(&Stores::in_memory(store));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let journal = journal.clone();
                tokio::spawn(async move {
                    journal
                        .begin_release(&TriggerContext::new(), &new_release(7))
                        .await
                        .map(|r| r.counter)
                })
            })
            .collect();

        let mut counters = Vec::new();
        for handle in handles {
            counters.push(handle.await.unwrap().unwrap());
        }
        counters.sort();
        assert_eq!(counters, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_guard_renumbers_raced_counter() {
        let store = MemoryStore::new();
        let ctx = TriggerContext::new();
        let plain = ReleaseJournal::new(&Stores::in_memory(store.clone()));
        let first = plain.begin_release(&ctx, &new_release(1)).await.unwrap();

        let racy = journal_over(&store, 1, false);
        let second = racy.begin_release(&ctx, &new_release(1)).await.unwrap();

        assert_eq!(first.counter, 1);
        assert_eq!(second.counter, 2);
        let stored = ReleaseRepository::find_by_id(&store, second.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.counter, 2);
    }

    #[tokio::test]
    async fn test_guard_gives_up_after_attempts() {
        let store = MemoryStore::new();
        let journal = journal_over(&store, 0, true);

        let err = journal
            .begin_release(&TriggerContext::new(), &new_release(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JournalError::Duplicate { pipeline_id: 1, attempts: GUARD_ATTEMPTS }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_trigger_writes_nothing() {
        let store = MemoryStore::new();
        let journal = ReleaseJournal::new(&Stores::in_memory(store.clone()));
        let ctx = TriggerContext::new();
        ctx.cancel();

        let err = journal.begin_release(&ctx, &new_release(1)).await.unwrap_err();
        assert!(matches!(err, JournalError::Cancelled));
        assert!(store.snapshot().await.releases.is_empty());
    }

    #[tokio::test]
    async fn test_deployment_links_workflow_release_and_runner() {
        let store = MemoryStore::new();
        let journal = ReleaseJournal::new(&Stores::in_memory(store.clone()));

        let (release, runner) = journal
            .begin_deployment(&TriggerContext::new(), &new_deployment(1))
            .await
            .unwrap();

        assert_eq!(release.counter, 1);
        assert_eq!(runner.release_override_id, Some(release.id));
        assert_eq!(runner.workflow_id, release.workflow_id);
        assert_eq!(runner.status, RunnerStatus::Initiated);
        let state = store.snapshot().await;
        assert!(state.workflows.contains_key(&release.workflow_id));
        assert!(state.runners.contains_key(&runner.id));
    }

    #[tokio::test]
    async fn test_cancel_before_commit_leaves_no_rows() {
        let store = MemoryStore::new();
        let ctx = TriggerContext::new();
        let mut releases = racy(&store, 0, false);
        releases.cancel_on_insert = Some(ctx.token().clone());
        let journal = journal_with(&store, releases);

        let err = journal
            .begin_deployment(&ctx, &new_deployment(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::Cancelled));

        let state = store.snapshot().await;
        assert!(state.workflows.is_empty());
        assert!(state.releases.is_empty());
        assert!(state.runners.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_duplicate_leaves_nothing_in_flight() {
        let store = MemoryStore::new();
        let journal = journal_over(&store, 0, true);

        let err = journal
            .begin_deployment(&TriggerContext::new(), &new_deployment(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::Duplicate { .. }));

        let state = store.snapshot().await;
        assert!(state.releases.values().all(|r| r.status == ReleaseStatus::Failed));
        assert!(state.runners.values().all(|r| r.status == RunnerStatus::Failed));
        assert_eq!(state.runners.len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_once() {
        let store = MemoryStore::new();
        let journal = ReleaseJournal::new(&Stores::in_memory(store));
        let release = journal
            .begin_release(&TriggerContext::new(), &new_release(1))
            .await
            .unwrap();
        let commit = CommitIdentity {
            commit_hash: "abc".to_string(),
            commit_time: Utc::now(),
        };

        assert!(journal.finalize(release.id, ReleaseStatus::New, Some(&commit)).await.unwrap());
        assert!(journal.finalize(release.id, ReleaseStatus::Success, None).await.unwrap());
        assert!(!journal.finalize(release.id, ReleaseStatus::Failed, None).await.unwrap());
    }
}
