//! Follower-count snapshot store
//!
//! Append-only time series of per-entity metric samples, one canonical value
//! per (entity, calendar day). Re-recording within the same day overwrites so
//! "value as of date" stays well-defined. Rows are never mutated once a later
//! day's snapshot supersedes them; pruning old rows is a retention choice,
//! not a correctness requirement.

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::FollowerSnapshot;

/// Storage layer for follower snapshots
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    /// Create a new SnapshotStore with the given database pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a value for (entity, day). Same-day re-recording overwrites.
    pub async fn record(&self, entity_id: &str, value: i64, day: NaiveDate) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO follower_snapshots (id, entity_id, day, value, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(entity_id, day) DO UPDATE SET
                value = excluded.value,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(&id)
        .bind(entity_id)
        .bind(day)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The canonical value at or before `day`, or `None` with no history
    pub async fn value_at_or_before(
        &self,
        entity_id: &str,
        day: NaiveDate,
    ) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT value FROM follower_snapshots
            WHERE entity_id = ? AND day <= ?
            ORDER BY day DESC
            LIMIT 1
            "#,
        )
        .bind(entity_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Most recent value and its day, or `None` with no history
    pub async fn most_recent(&self, entity_id: &str) -> Result<Option<(i64, NaiveDate)>> {
        let row: Option<(i64, NaiveDate)> = sqlx::query_as(
            r#"
            SELECT value, day FROM follower_snapshots
            WHERE entity_id = ?
            ORDER BY day DESC
            LIMIT 1
            "#,
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// All samples within [from, to], ordered by day ascending
    pub async fn range(
        &self,
        entity_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<FollowerSnapshot>> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM follower_snapshots
            WHERE entity_id = ? AND day >= ? AND day <= ?
            ORDER BY day ASC
            "#,
        )
        .bind(entity_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Delete snapshots strictly older than `day`, across all entities.
    /// Returns the number of rows removed.
    pub async fn prune_before(&self, day: NaiveDate) -> Result<u64> {
        let result = sqlx::query("DELETE FROM follower_snapshots WHERE day < ?")
            .bind(day)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            log::info!("Pruned {} follower snapshots older than {}", deleted, day);
        }
        Ok(deleted)
    }
}
