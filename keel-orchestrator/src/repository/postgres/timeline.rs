//! Timeline Repository
//!
//! Handles all database operations related to runner timeline entries. The
//! table carries a unique (runner_id, status) constraint and a partial unique
//! index admitting one terminal entry per runner; inserts rely on both.

use async_trait::async_trait;
use keel_core::domain::timeline::{NewTimelineEntry, TimelineEntry, TimelineStatus};

use super::{PgStore, conn, corrupt};
use crate::error::StoreError;
use crate::repository::{TimelineRepository, Transaction};

#[async_trait]
impl TimelineRepository for PgStore {
    async fn find_by_runner(&self, runner_id: i64) -> Result<Vec<TimelineEntry>, StoreError> {
        let rows = sqlx::query_as::<_, TimelineRow>(
            r#"
            SELECT id, runner_id, status, detail, status_time, created_on
            FROM timeline_entries
            WHERE runner_id = $1
            ORDER BY status_time ASC, id ASC
            "#,
        )
        .bind(runner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TimelineEntry::try_from).collect()
    }

    async fn list_for_runner(
        &self,
        tx: &mut dyn Transaction,
        runner_id: i64,
    ) -> Result<Vec<TimelineEntry>, StoreError> {
        let rows = sqlx::query_as::<_, TimelineRow>(
            r#"
            SELECT id, runner_id, status, detail, status_time, created_on
            FROM timeline_entries
            WHERE runner_id = $1
            ORDER BY status_time ASC, id ASC
            "#,
        )
        .bind(runner_id)
        .fetch_all(conn(tx)?)
        .await?;

        rows.into_iter().map(TimelineEntry::try_from).collect()
    }

    async fn insert_if_absent(
        &self,
        tx: &mut dyn Transaction,
        entry: &NewTimelineEntry,
    ) -> Result<Option<TimelineEntry>, StoreError> {
        let row = sqlx::query_as::<_, TimelineRow>(
            r#"
            INSERT INTO timeline_entries (runner_id, status, detail, status_time, created_on)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT DO NOTHING
            RETURNING id, runner_id, status, detail, status_time, created_on
            "#,
        )
        .bind(entry.runner_id)
        .bind(entry.status.as_str())
        .bind(&entry.detail)
        .bind(entry.status_time)
        .fetch_optional(conn(tx)?)
        .await?;

        row.map(TimelineEntry::try_from).transpose()
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct TimelineRow {
    id: i64,
    runner_id: i64,
    status: String,
    detail: String,
    status_time: chrono::DateTime<chrono::Utc>,
    created_on: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<TimelineRow> for TimelineEntry {
    type Error = StoreError;

    fn try_from(row: TimelineRow) -> Result<Self, Self::Error> {
        let status = TimelineStatus::parse(&row.status)
            .ok_or_else(|| corrupt("timeline_entries.status", &row.status))?;

        Ok(TimelineEntry {
            id: row.id,
            runner_id: row.runner_id,
            status,
            detail: row.detail,
            status_time: row.status_time,
            created_on: row.created_on,
        })
    }
}
