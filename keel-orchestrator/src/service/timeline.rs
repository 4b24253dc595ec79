//! Timeline Engine
//!
//! Appends timeline entries and drives runner and release status from them.
//! Each append is one transaction holding the runner's row lock, so the
//! terminal and ordering checks see every committed entry.

use chrono::{DateTime, Utc};
use keel_core::domain::timeline::{NewTimelineEntry, TimelineEntry, TimelineStatus};
use keel_core::dto::event::CdEventKind;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::repository::Stores;
use crate::service::metrics::CdMetrics;
use crate::service::notify::CdEventDispatcher;

/// Result of an append request
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended(TimelineEntry),
    /// The (runner, tag) pair is already recorded
    Duplicate,
    /// The runner already has a terminal entry
    DroppedTerminal,
    /// A later tag of the ordered progression is already recorded
    DroppedOutOfOrder,
}

impl AppendOutcome {
    pub fn is_appended(&self) -> bool {
        matches!(self, AppendOutcome::Appended(_))
    }
}

#[derive(Clone)]
pub struct TimelineEngine {
    stores: Stores,
    events: CdEventDispatcher,
    metrics: CdMetrics,
}

impl TimelineEngine {
    pub fn new(stores: Stores, events: CdEventDispatcher, metrics: CdMetrics) -> Self {
        Self {
            stores,
            events,
            metrics,
        }
    }

    /// Appends `tag` to a runner's timeline
    pub async fn append(
        &self,
        runner_id: i64,
        tag: TimelineStatus,
        detail: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        let detail = detail.into();
        let mut tx = self.stores.transactions.begin().await?;

        let runner = self
            .stores
            .workflows
            .lock_runner(tx.as_mut(), runner_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("runner {}", runner_id)))?;
        let entries = self
            .stores
            .timelines
            .list_for_runner(tx.as_mut(), runner_id)
            .await?;

        if entries.iter().any(|e| e.status.is_terminal()) {
            tracing::debug!("Runner {} already terminal, dropping {}", runner_id, tag);
            return Ok(AppendOutcome::DroppedTerminal);
        }

        if let Some(order) = tag.order() {
            if entries
                .iter()
                .any(|e| e.status.order().is_some_and(|o| o > order))
            {
                tracing::debug!("Runner {} has a later tag than {}, dropping", runner_id, tag);
                return Ok(AppendOutcome::DroppedOutOfOrder);
            }
        }

        if entries.iter().any(|e| e.status == tag) {
            return Ok(AppendOutcome::Duplicate);
        }

        let mut status_time = time;
        if let Some(predecessor) = tag.predecessor() {
            let previous = entries
                .iter()
                .find(|e| e.status == predecessor)
                .ok_or_else(|| {
                    EngineError::ProtocolViolation(format!(
                        "{} appended to runner {} before {}",
                        tag, runner_id, predecessor
                    ))
                })?;
            status_time = status_time.max(previous.status_time);
        }

        let new = NewTimelineEntry {
            runner_id,
            status: tag,
            detail: detail.clone(),
            status_time,
        };
        let Some(entry) = self
            .stores
            .timelines
            .insert_if_absent(tx.as_mut(), &new)
            .await?
        else {
            return Ok(AppendOutcome::Duplicate);
        };

        // Runner status follows the tag, never out of a terminal state
        if let Some(next) = tag.runner_status() {
            if runner.status.can_transition_to(next) {
                let terminal = tag.is_terminal();
                self.stores
                    .workflows
                    .update_runner_status(
                        tx.as_mut(),
                        runner_id,
                        next,
                        terminal.then_some(status_time),
                        terminal.then_some(detail.as_str()),
                    )
                    .await?;
            }
        }

        if let (Some(release_id), Some(release_status)) =
            (runner.release_override_id, tag.release_status())
        {
            self.stores
                .releases
                .finalize(tx.as_mut(), release_id, release_status, None)
                .await?;
        }

        tx.commit().await?;

        tracing::info!("Runner {} timeline: {} ({})", runner_id, tag, detail);

        if tag.is_terminal() {
            self.metrics
                .runner_finished(tag, runner.started_on, status_time);
            let kind = if tag == TimelineStatus::AppHealthy {
                CdEventKind::Success
            } else {
                CdEventKind::Fail
            };
            self.events
                .dispatch(kind, &runner, Uuid::new_v4(), status_time, Some(detail));
        }

        Ok(AppendOutcome::Appended(entry))
    }

    /// Records the manual-sync completion marker
    pub async fn mark_sync_completed(
        &self,
        runner_id: i64,
        time: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        self.append(
            runner_id,
            TimelineStatus::ArgocdSyncCompleted,
            "Sync completed",
            time,
        )
        .await
    }

    /// Entries of a runner in status-time order
    pub async fn timeline(&self, runner_id: i64) -> Result<Vec<TimelineEntry>> {
        if self.stores.workflows.find_runner(runner_id).await?.is_none() {
            return Err(EngineError::NotFound(format!("runner {}", runner_id)));
        }
        Ok(self.stores.timelines.find_by_runner(runner_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryStore, ReleaseRepository};
    use crate::testing;
    use chrono::Duration;
    use keel_core::domain::release::ReleaseStatus;
    use keel_core::domain::runner::RunnerStatus;

    async fn setup() -> (MemoryStore, TimelineEngine, i64, i64) {
        let store = testing::seeded_store().await;
        let (runner_id, release_id) = testing::in_progress_runner(&store).await;
        let engine = testing::engine(&store).timeline;
        (store, engine, runner_id, release_id)
    }

    #[tokio::test]
    async fn test_health_drives_runner_and_release() {
        let (store, engine, runner_id, release_id) = setup().await;
        let t0 = Utc::now();

        for (i, tag) in [
            TimelineStatus::KubectlApplyStarted,
            TimelineStatus::KubectlApplySynced,
            TimelineStatus::AppHealthy,
        ]
        .into_iter()
        .enumerate()
        {
            let outcome = engine
                .append(runner_id, tag, "", t0 + Duration::seconds(i as i64 + 1))
                .await
                .unwrap();
            assert!(outcome.is_appended(), "{} -> {:?}", tag, outcome);
        }

        let state = store.snapshot().await;
        let runner = &state.runners[&runner_id];
        assert_eq!(runner.status, RunnerStatus::Succeeded);
        assert!(runner.finished_on.is_some());
        assert_eq!(state.releases[&release_id].status, ReleaseStatus::Success);
    }

    #[tokio::test]
    async fn test_terminal_entry_blocks_further_appends() {
        let (store, engine, runner_id, release_id) = setup().await;
        let now = Utc::now();

        engine
            .append(runner_id, TimelineStatus::FetchTimedOut, "timed out", now)
            .await
            .unwrap();
        let outcome = engine
            .append(runner_id, TimelineStatus::Failed, "late", now)
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::DroppedTerminal);

        let release = ReleaseRepository::find_by_id(&store, release_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(release.status, ReleaseStatus::TimedOut);
        assert_eq!(
            store.snapshot().await.runners[&runner_id].status,
            RunnerStatus::TimedOut
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let (_store, engine, runner_id, _) = setup().await;
        let now = Utc::now();

        let first = engine
            .append(runner_id, TimelineStatus::KubectlApplyStarted, "", now)
            .await
            .unwrap();
        let second = engine
            .append(runner_id, TimelineStatus::KubectlApplyStarted, "", now)
            .await
            .unwrap();
        assert!(first.is_appended());
        assert_eq!(second, AppendOutcome::Duplicate);
        assert_eq!(engine.timeline(runner_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_predecessor_is_protocol_violation() {
        let (_store, engine, runner_id, _) = setup().await;
        let err = engine
            .append(runner_id, TimelineStatus::AppHealthy, "", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_earlier_time_is_clamped_to_predecessor() {
        let (_store, engine, runner_id, _) = setup().await;
        let now = Utc::now();
        engine
            .append(runner_id, TimelineStatus::KubectlApplyStarted, "", now)
            .await
            .unwrap();

        let outcome = engine
            .append(
                runner_id,
                TimelineStatus::KubectlApplySynced,
                "",
                now - Duration::minutes(5),
            )
            .await
            .unwrap();
        match outcome {
            AppendOutcome::Appended(entry) => assert_eq!(entry.status_time, now),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_tag_dropped() {
        let (store, engine, runner_id, _) = setup().await;
        let now = Utc::now();
        engine
            .append(runner_id, TimelineStatus::KubectlApplyStarted, "", now)
            .await
            .unwrap();
        engine
            .append(runner_id, TimelineStatus::KubectlApplySynced, "", now)
            .await
            .unwrap();

        // A GIT_COMMIT redelivered after the sync started
        let outcome = engine
            .append(runner_id, TimelineStatus::GitCommit, "", now)
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::DroppedOutOfOrder);

        let state = store.snapshot().await;
        assert_eq!(
            state.timeline.iter().filter(|e| e.runner_id == runner_id).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_unknown_runner() {
        let (_store, engine, _, _) = setup().await;
        let err = engine
            .append(99_999, TimelineStatus::GitCommit, "", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
