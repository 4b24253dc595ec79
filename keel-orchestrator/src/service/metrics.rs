//! CD metrics
//!
//! Recorded through the `metrics` facade only when `EXPOSE_CD_METRICS` is
//! set; the binary installs the Prometheus exporter.

use chrono::{DateTime, Utc};
use keel_core::domain::timeline::TimelineStatus;

#[derive(Debug, Clone, Copy, Default)]
pub struct CdMetrics {
    enabled: bool,
}

impl CdMetrics {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn trigger_accepted(&self, pipeline_id: i64) {
        if self.enabled {
            metrics::counter!("keel_cd_triggered_total", "pipeline" => pipeline_id.to_string())
                .increment(1);
        }
    }

    pub fn publish_failed(&self) {
        if self.enabled {
            metrics::counter!("keel_cd_publish_failures_total").increment(1);
        }
    }

    /// Runner reached a terminal tag; records how long it took
    pub fn runner_finished(&self, tag: TimelineStatus, started_on: DateTime<Utc>, at: DateTime<Utc>) {
        if !self.enabled {
            return;
        }
        let name = match tag {
            TimelineStatus::AppHealthy => "keel_cd_succeeded_total",
            TimelineStatus::FetchTimedOut => "keel_cd_timed_out_total",
            _ => "keel_cd_failed_total",
        };
        metrics::counter!(name, "status" => tag.as_str()).increment(1);
        let seconds = (at - started_on).num_milliseconds().max(0) as f64 / 1000.0;
        metrics::histogram!("keel_cd_runner_duration_seconds", "status" => tag.as_str())
            .record(seconds);
    }

    pub fn event_dropped(&self, reason: &'static str) {
        if self.enabled {
            metrics::counter!("keel_reconciler_events_dropped_total", "reason" => reason)
                .increment(1);
        }
    }
}
