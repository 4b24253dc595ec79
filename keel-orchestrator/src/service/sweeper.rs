//! Timeout Sweeper
//!
//! Periodically times out runners that have made no timeline progress within
//! the configured status timeout.

use chrono::{DateTime, Utc};
use keel_core::domain::catalog::DeployTarget;
use keel_core::domain::runner::Runner;
use keel_core::domain::timeline::{TimelineEntry, TimelineStatus};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::repository::Stores;
use crate::service::timeline::TimelineEngine;

pub const TIMED_OUT_DETAIL: &str = "Deployment timed out waiting for the CD agent";

#[derive(Clone)]
pub struct TimeoutSweeper {
    stores: Stores,
    timeline: TimelineEngine,
    config: EngineConfig,
}

impl TimeoutSweeper {
    pub fn new(stores: Stores, timeline: TimelineEngine, config: EngineConfig) -> Self {
        Self {
            stores,
            timeline,
            config,
        }
    }

    /// Sweeps every `sweep_interval` until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            "Starting timeout sweeper (interval: {:?}, timeout: {:?})",
            self.config.sweep_interval,
            self.config.status_timeout
        );

        let mut interval = time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Timeout sweeper stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.sweep(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Timed out {} runner(s)", n),
                Err(e) => tracing::error!("Timeout sweep failed: {}", e),
            }
        }
    }

    /// One pass over the active runners; returns how many were timed out
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let runners = self.stores.workflows.list_active_deploy_runners(None).await?;
        let mut timed_out = 0;

        for runner in runners {
            if !self.eligible(&runner, now) {
                continue;
            }

            let entries = self.stores.timelines.find_by_runner(runner.id).await?;
            if !self.expired(&runner, &entries, now) {
                continue;
            }

            let outcome = self
                .timeline
                .append(runner.id, TimelineStatus::FetchTimedOut, TIMED_OUT_DETAIL, now)
                .await?;
            if outcome.is_appended() {
                tracing::warn!("Runner {} timed out", runner.id);
                timed_out += 1;
            }
        }

        Ok(timed_out)
    }

    /// Chart-push runners get a grace period before status checks apply
    fn eligible(&self, runner: &Runner, now: DateTime<Utc>) -> bool {
        if runner.deploy_target != DeployTarget::ChartPush {
            return true;
        }
        (now - runner.started_on)
            .to_std()
            .is_ok_and(|age| age >= self.config.chart_push_status_check_eligible_time)
    }

    fn expired(&self, runner: &Runner, entries: &[TimelineEntry], now: DateTime<Utc>) -> bool {
        if entries.iter().any(|e| e.status.is_terminal()) {
            return false;
        }

        // Manual sync: the clock only starts once the operator synced
        if self.config.manual_sync_enabled
            && !entries
                .iter()
                .any(|e| e.status == TimelineStatus::ArgocdSyncCompleted)
        {
            return false;
        }

        let last = entries
            .iter()
            .map(|e| e.status_time)
            .max()
            .map_or(runner.started_on, |t| t.max(runner.started_on));

        (now - last)
            .to_std()
            .is_ok_and(|idle| idle >= self.config.status_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use crate::testing;
    use chrono::Duration;
    use keel_core::domain::runner::RunnerStatus;

    async fn setup(config: EngineConfig) -> (MemoryStore, TimeoutSweeper, i64) {
        let store = testing::seeded_store().await;
        let (runner_id, _) = testing::in_progress_runner(&store).await;
        let engine = testing::engine_with(&store, Default::default(), config);
        (store, engine.sweeper, runner_id)
    }

    #[tokio::test]
    async fn test_idle_runner_times_out() {
        let (store, sweeper, runner_id) = setup(EngineConfig::default()).await;

        assert_eq!(sweeper.sweep(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + Duration::minutes(21);
        assert_eq!(sweeper.sweep(later).await.unwrap(), 1);

        let state = store.snapshot().await;
        assert_eq!(state.runners[&runner_id].status, RunnerStatus::TimedOut);

        // Already terminal, nothing left to sweep
        assert_eq!(sweeper.sweep(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_progress_resets_the_clock() {
        let (store, sweeper, runner_id) = setup(EngineConfig::default()).await;
        let t = Utc::now() + Duration::minutes(15);
        testing::engine(&store)
            .timeline
            .append(runner_id, TimelineStatus::KubectlApplyStarted, "", t)
            .await
            .unwrap();

        assert_eq!(sweeper.sweep(t + Duration::minutes(10)).await.unwrap(), 0);
        assert_eq!(sweeper.sweep(t + Duration::minutes(21)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_manual_sync_defers_timeout() {
        let config = EngineConfig::default().with_manual_sync(true);
        let (_store, sweeper, runner_id) = setup(config).await;
        let later = Utc::now() + Duration::minutes(30);

        assert_eq!(sweeper.sweep(later).await.unwrap(), 0);

        sweeper
            .timeline
            .mark_sync_completed(runner_id, Utc::now())
            .await
            .unwrap();
        assert_eq!(sweeper.sweep(later).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_young_chart_push_runner_skipped() {
        let config = EngineConfig::default().with_status_timeout(std::time::Duration::from_secs(60));
        let (store, sweeper, runner_id) = setup(config).await;
        let started = Utc::now();
        store
            .seed(|s| {
                if let Some(runner) = s.runners.get_mut(&runner_id) {
                    runner.deploy_target = DeployTarget::ChartPush;
                    runner.started_on = started;
                }
                s.timeline.retain(|e| e.runner_id != runner_id);
            })
            .await;

        assert_eq!(sweeper.sweep(started + Duration::seconds(90)).await.unwrap(), 0);
        assert_eq!(sweeper.sweep(started + Duration::seconds(150)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_store, sweeper, _) = setup(EngineConfig::default()).await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweeper.run(cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
    }
}
