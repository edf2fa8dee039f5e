//! Growth computation over follower snapshots
//!
//! Derives start/end/delta/percentage figures from the snapshot history,
//! either over a rolling N-day window or over calendar-aligned periods
//! (ISO week, first-of-month, first-of-year). Entities without history
//! report zero growth rather than an error, and a zero start value reports
//! 0% rather than a division blowup: new and empty accounts are normal
//! inputs here, not failures.
//!
//! Materialized [`GrowthPeriod`] rows are a cache keyed by (entity, period
//! type, period start); recomputing is idempotent and safe at any time.

use chrono::{Datelike, NaiveDate, Utc, Weekday};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{GrowthPeriod, GrowthPeriodType, WindowGrowth};

use super::snapshot::SnapshotStore;

/// Growth calculator over a snapshot store
pub struct GrowthCalculator {
    pool: SqlitePool,
    store: SnapshotStore,
}

impl GrowthCalculator {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            store: SnapshotStore::new(pool.clone()),
            pool,
        }
    }

    /// Growth over a rolling window of `days` days ending today
    pub async fn window_growth(&self, entity_id: &str, days: i64) -> Result<WindowGrowth> {
        self.window_growth_on(entity_id, days, Utc::now().date_naive())
            .await
    }

    pub async fn window_growth_on(
        &self,
        entity_id: &str,
        days: i64,
        today: NaiveDate,
    ) -> Result<WindowGrowth> {
        let window_start = today - chrono::Duration::days(days);
        let start_value = self
            .store
            .value_at_or_before(entity_id, window_start)
            .await?
            .unwrap_or(0);
        let end_value = self
            .store
            .value_at_or_before(entity_id, today)
            .await?
            .unwrap_or(0);

        Ok(build_growth(entity_id, start_value, end_value))
    }

    /// Growth over the calendar period containing today
    pub async fn calendar_growth(
        &self,
        entity_id: &str,
        period: GrowthPeriodType,
    ) -> Result<WindowGrowth> {
        self.calendar_growth_on(entity_id, period, Utc::now().date_naive())
            .await
    }

    pub async fn calendar_growth_on(
        &self,
        entity_id: &str,
        period: GrowthPeriodType,
        on: NaiveDate,
    ) -> Result<WindowGrowth> {
        let (period_start, period_end) = period_bounds(period, on);
        let end_day = period_end.min(on);

        let start_value = self
            .store
            .value_at_or_before(entity_id, period_start)
            .await?
            .unwrap_or(0);
        let end_value = self
            .store
            .value_at_or_before(entity_id, end_day)
            .await?
            .unwrap_or(0);

        Ok(build_growth(entity_id, start_value, end_value))
    }

    /// Top `k` entities by absolute delta over a rolling window.
    ///
    /// Ordering is deterministic: delta descending, then percentage
    /// descending, then entity id ascending. Entities with no snapshot
    /// history are included with zero growth and sort to the bottom.
    pub async fn top_k_by_growth(
        &self,
        entity_ids: &[String],
        days: i64,
        k: usize,
    ) -> Result<Vec<WindowGrowth>> {
        self.top_k_by_growth_on(entity_ids, days, k, Utc::now().date_naive())
            .await
    }

    pub async fn top_k_by_growth_on(
        &self,
        entity_ids: &[String],
        days: i64,
        k: usize,
        today: NaiveDate,
    ) -> Result<Vec<WindowGrowth>> {
        let mut growths = Vec::with_capacity(entity_ids.len());
        for entity_id in entity_ids {
            growths.push(self.window_growth_on(entity_id, days, today).await?);
        }

        growths.sort_by(|a, b| {
            b.delta
                .cmp(&a.delta)
                .then_with(|| b.percent.total_cmp(&a.percent))
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        growths.truncate(k);

        Ok(growths)
    }

    /// Materialize one growth period row for the period containing today.
    /// Upsert keyed by (entity, period type, period start); recomputation
    /// overwrites in place.
    pub async fn materialize(
        &self,
        entity_id: &str,
        period: GrowthPeriodType,
    ) -> Result<GrowthPeriod> {
        self.materialize_on(entity_id, period, Utc::now().date_naive())
            .await
    }

    pub async fn materialize_on(
        &self,
        entity_id: &str,
        period: GrowthPeriodType,
        on: NaiveDate,
    ) -> Result<GrowthPeriod> {
        let (period_start, period_end) = period_bounds(period, on);
        let growth = self.calendar_growth_on(entity_id, period, on).await?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO growth_periods
                (id, entity_id, period_type, period_start, period_end,
                 start_value, end_value, delta, percent, computed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_id, period_type, period_start) DO UPDATE SET
                period_end = excluded.period_end,
                start_value = excluded.start_value,
                end_value = excluded.end_value,
                delta = excluded.delta,
                percent = excluded.percent,
                computed_at = excluded.computed_at
            "#,
        )
        .bind(&id)
        .bind(entity_id)
        .bind(period.as_str())
        .bind(period_start)
        .bind(period_end)
        .bind(growth.start_value)
        .bind(growth.end_value)
        .bind(growth.delta)
        .bind(growth.percent)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as(
            "SELECT * FROM growth_periods WHERE entity_id = ? AND period_type = ? AND period_start = ?",
        )
        .bind(entity_id)
        .bind(period.as_str())
        .bind(period_start)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    /// Materialize all period granularities for one entity
    pub async fn materialize_all(&self, entity_id: &str) -> Result<Vec<GrowthPeriod>> {
        let mut periods = Vec::with_capacity(GrowthPeriodType::ALL.len());
        for period in GrowthPeriodType::ALL {
            periods.push(self.materialize(entity_id, period).await?);
        }
        Ok(periods)
    }
}

fn build_growth(entity_id: &str, start_value: i64, end_value: i64) -> WindowGrowth {
    let delta = end_value - start_value;
    let percent = if start_value > 0 {
        round2(delta as f64 / start_value as f64 * 100.0)
    } else {
        0.0
    };

    WindowGrowth {
        entity_id: entity_id.to_string(),
        start_value,
        end_value,
        delta,
        percent,
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Calendar boundaries of the period containing `on`
pub fn period_bounds(period: GrowthPeriodType, on: NaiveDate) -> (NaiveDate, NaiveDate) {
    match period {
        GrowthPeriodType::Day => (on, on),
        GrowthPeriodType::Week => {
            let iso = on.iso_week();
            let start = NaiveDate::from_isoywd_opt(iso.year(), iso.week(), Weekday::Mon)
                .unwrap_or(on);
            (start, start + chrono::Duration::days(6))
        }
        GrowthPeriodType::Month => {
            let start = on.with_day(1).unwrap_or(on);
            let end = start
                .checked_add_months(chrono::Months::new(1))
                .map(|next| next - chrono::Duration::days(1))
                .unwrap_or(on);
            (start, end)
        }
        GrowthPeriodType::Year => {
            let start = NaiveDate::from_ymd_opt(on.year(), 1, 1).unwrap_or(on);
            let end = NaiveDate::from_ymd_opt(on.year(), 12, 31).unwrap_or(on);
            (start, end)
        }
    }
}
