//! Incremental sync engine
//!
//! Pulls new and updated posts for every tracked entity, records follower
//! snapshots, and refreshes materialized growth periods, producing one
//! [`SyncRun`] row per cycle.
//!
//! Every external call goes through the same gate: wait out any active
//! cooldown, wait for quota headroom, issue the call, account it. A
//! transient platform error (429/503, throttling messages) arms a cooldown
//! that also makes scheduled runs skip outright instead of hammering a
//! failing API on a timer.
//!
//! Entity processing is sequential and isolated: one entity's failure is
//! recorded and the run moves on. Only a monthly quota cap aborts the rest
//! of a run, since it cannot recover before the next calendar month. Run
//! stats are persisted on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::api::{ApiError, SocialApi, BATCH_MAX, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::models::{StoredSyncRun, SyncRun, TrackedEntity};

use super::entities::list_entities;
use super::growth::GrowthCalculator;
use super::posts::{get_cursor, recent_post_ids, set_cursor, upsert_post, UpsertOutcome};
use super::quota::{QuotaStatus, QuotaTracker, QuotaUsage};
use super::sanitize::sanitize_post;
use super::snapshot::SnapshotStore;

/// Default cooldown after a transient API error, in seconds (15 minutes)
pub const DEFAULT_COOLDOWN_SECS: u64 = 15 * 60;

/// Default engagement-refresh window in days
pub const DEFAULT_REFRESH_WINDOW_DAYS: i64 = 7;

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Page size for incremental fetches, capped by the platform
    pub page_size: u32,
    /// How far back already-stored posts get their counters refreshed
    pub refresh_window_days: i64,
    /// Cooldown length after a transient API error
    pub cooldown_secs: u64,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            refresh_window_days: DEFAULT_REFRESH_WINDOW_DAYS,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
        }
    }
}

/// Counters accumulated over one sync cycle
#[derive(Debug, Default)]
pub struct RunStats {
    pub entities_processed: i64,
    pub entities_skipped: i64,
    pub posts_added: i64,
    pub posts_updated: i64,
    pub records_rejected: i64,
    pub api_calls: i64,
    pub errors: Vec<String>,
}

impl RunStats {
    fn into_run(self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, skipped: bool) -> SyncRun {
        SyncRun {
            id: Uuid::new_v4().to_string(),
            started_at,
            finished_at,
            entities_processed: self.entities_processed,
            entities_skipped: self.entities_skipped,
            posts_added: self.posts_added,
            posts_updated: self.posts_updated,
            records_rejected: self.records_rejected,
            api_calls: self.api_calls,
            skipped,
            errors: self.errors,
        }
    }
}

/// The incremental sync engine
pub struct SyncEngine<A: SocialApi> {
    pool: SqlitePool,
    api: A,
    config: SyncEngineConfig,
    quota: Mutex<QuotaTracker>,
    cooldown_until: RwLock<Option<DateTime<Utc>>>,
    running: AtomicBool,
}

impl<A: SocialApi> SyncEngine<A> {
    /// Create an engine with default tuning
    pub fn new(pool: SqlitePool, api: A, quota: QuotaTracker) -> Self {
        Self::with_config(pool, api, quota, SyncEngineConfig::default())
    }

    pub fn with_config(
        pool: SqlitePool,
        api: A,
        quota: QuotaTracker,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            pool,
            api,
            config,
            quota: Mutex::new(quota),
            cooldown_until: RwLock::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Run one full sync cycle.
    ///
    /// Returns [`Error::SyncInProgress`] when a run is already in flight;
    /// every other failure mode completes with a stats object whose `errors`
    /// list records what went wrong. Stats are persisted before returning,
    /// including when the run aborted at the top level.
    pub async fn run_once(&self) -> Result<SyncRun> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::SyncInProgress);
        }

        let started_at = Utc::now();
        let mut stats = RunStats::default();

        if let Err(e) = self.run_inner(&mut stats).await {
            log::error!("Sync run aborted: {}", e);
            stats.errors.push(e.to_string());
        }

        let run = stats.into_run(started_at, Utc::now(), false);
        if let Err(e) = save_run(&self.pool, &run).await {
            log::error!("Failed to persist run stats for {}: {}", run.id, e);
        }

        self.running.store(false, Ordering::SeqCst);

        log::info!(
            "Sync run {} finished: {} entities, +{} posts, {} updated, {} errors",
            run.id,
            run.entities_processed,
            run.posts_added,
            run.posts_updated,
            run.errors.len()
        );
        Ok(run)
    }

    async fn run_inner(&self, stats: &mut RunStats) -> Result<()> {
        let entities = list_entities(&self.pool).await?;
        log::info!("Sync run starting for {} entities", entities.len());

        for entity in &entities {
            match self.sync_entity(entity, stats).await {
                Ok(true) => stats.entities_processed += 1,
                Ok(false) => {}
                // Monthly caps cannot recover within this run
                Err(e @ Error::QuotaExhausted(_)) => return Err(e),
                Err(e) => {
                    log::error!("Entity {} failed: {}", entity.slug, e);
                    stats.errors.push(format!("{}: {}", entity.slug, e));
                }
            }
        }

        if let Err(e) = self.snapshot_followers(&entities, stats).await {
            match e {
                Error::QuotaExhausted(_) => return Err(e),
                e => stats.errors.push(format!("follower snapshots: {}", e)),
            }
        }

        self.materialize_growth(&entities).await;
        Ok(())
    }

    /// Pull new posts and refresh recent engagement for one entity.
    /// Returns `false` when the entity was skipped (no handle, unresolved).
    async fn sync_entity(&self, entity: &TrackedEntity, stats: &mut RunStats) -> Result<bool> {
        let Some(handle) = entity.handle.as_deref() else {
            log::debug!("Entity {} has no handle, skipping", entity.slug);
            stats.entities_skipped += 1;
            return Ok(false);
        };

        let resolved = self.gated(stats, self.api.resolve_handle(handle)).await?;
        let Some(account) = resolved else {
            log::warn!(
                "Handle {} for entity {} did not resolve, skipping",
                handle,
                entity.slug
            );
            stats.entities_skipped += 1;
            return Ok(false);
        };

        let cursor = get_cursor(&self.pool, &entity.id).await?;
        let since_id = cursor.as_ref().map(|c| c.last_post_id.as_str());

        let raw_posts = self
            .gated(
                stats,
                self.api
                    .fetch_posts_since(&account.id, since_id, self.config.page_size),
            )
            .await?;
        self.quota.lock().await.record_items(raw_posts.len() as u64);

        // Newest first per the platform's ordering; the first usable id
        // becomes the cursor once this batch's upserts complete
        let newest_id = raw_posts.iter().find_map(|p| p.id.clone());

        for raw in &raw_posts {
            match sanitize_post(raw, handle, Utc::now()) {
                Ok(post) => match upsert_post(&self.pool, &entity.id, &post).await {
                    Ok(UpsertOutcome::Created) => stats.posts_added += 1,
                    Ok(UpsertOutcome::Updated) => stats.posts_updated += 1,
                    Err(e) => {
                        log::error!(
                            "Failed to store post {} for entity {}: {}",
                            post.id,
                            entity.slug,
                            e
                        );
                        stats
                            .errors
                            .push(format!("{}: store {}: {}", entity.slug, post.id, e));
                    }
                },
                Err(reason) => {
                    log::warn!("Rejected post from {}: {}", entity.slug, reason);
                    stats.records_rejected += 1;
                }
            }
        }

        if let Some(newest) = newest_id {
            set_cursor(&self.pool, &entity.id, &newest).await?;
        }

        self.refresh_engagement(entity, handle, stats).await?;
        Ok(true)
    }

    /// Re-fetch engagement counters for recently stored posts, in batches
    /// bounded by the platform's per-call id cap
    async fn refresh_engagement(
        &self,
        entity: &TrackedEntity,
        handle: &str,
        stats: &mut RunStats,
    ) -> Result<()> {
        let ids = recent_post_ids(&self.pool, &entity.id, self.config.refresh_window_days).await?;
        if ids.is_empty() {
            return Ok(());
        }

        for chunk in ids.chunks(BATCH_MAX) {
            let refreshed = self
                .gated(stats, self.api.fetch_posts_by_ids(chunk))
                .await?;
            self.quota.lock().await.record_items(refreshed.len() as u64);

            for raw in &refreshed {
                match sanitize_post(raw, handle, Utc::now()) {
                    Ok(post) => match upsert_post(&self.pool, &entity.id, &post).await {
                        Ok(UpsertOutcome::Created) => stats.posts_added += 1,
                        Ok(UpsertOutcome::Updated) => stats.posts_updated += 1,
                        Err(e) => {
                            log::error!(
                                "Failed to refresh post {} for entity {}: {}",
                                post.id,
                                entity.slug,
                                e
                            );
                            stats
                                .errors
                                .push(format!("{}: refresh {}: {}", entity.slug, post.id, e));
                        }
                    },
                    Err(reason) => {
                        log::warn!("Rejected refreshed post from {}: {}", entity.slug, reason);
                        stats.records_rejected += 1;
                    }
                }
            }
        }

        Ok(())
    }

    /// Record today's follower counts for all handled entities, batched.
    /// Chunk failures other than quota exhaustion are recorded and skipped.
    async fn snapshot_followers(
        &self,
        entities: &[TrackedEntity],
        stats: &mut RunStats,
    ) -> Result<()> {
        let by_handle: HashMap<&str, &TrackedEntity> = entities
            .iter()
            .filter_map(|e| e.handle.as_deref().map(|h| (h, e)))
            .collect();

        if by_handle.is_empty() {
            return Ok(());
        }

        let snapshots = SnapshotStore::new(self.pool.clone());
        let today = Utc::now().date_naive();
        let handles: Vec<String> = by_handle.keys().map(|h| h.to_string()).collect();

        for chunk in handles.chunks(BATCH_MAX) {
            let counts = match self
                .gated(stats, self.api.fetch_follower_counts(chunk))
                .await
            {
                Ok(counts) => counts,
                Err(e @ Error::QuotaExhausted(_)) => return Err(e),
                Err(e) => {
                    log::error!("Follower count fetch failed: {}", e);
                    stats.errors.push(format!("follower counts: {}", e));
                    continue;
                }
            };
            self.quota.lock().await.record_items(counts.len() as u64);

            for count in counts {
                let Some(entity) = by_handle.get(count.handle.as_str()) else {
                    continue;
                };
                if let Err(e) = snapshots.record(&entity.id, count.followers, today).await {
                    log::error!("Failed to record snapshot for {}: {}", entity.slug, e);
                    stats
                        .errors
                        .push(format!("{}: snapshot: {}", entity.slug, e));
                }
            }
        }

        Ok(())
    }

    /// Refresh the materialized growth cache. Purely local; failures are
    /// logged and never affect the run outcome.
    async fn materialize_growth(&self, entities: &[TrackedEntity]) {
        let calc = GrowthCalculator::new(self.pool.clone());
        for entity in entities {
            if let Err(e) = calc.materialize_all(&entity.id).await {
                log::warn!("Growth materialization failed for {}: {}", entity.slug, e);
            }
        }
    }

    /// Gate one external call: wait out cooldown, wait for quota headroom,
    /// issue the call, account it, and arm the cooldown on a transient error
    async fn gated<T>(
        &self,
        stats: &mut RunStats,
        call: impl std::future::Future<Output = std::result::Result<T, ApiError>>,
    ) -> Result<T> {
        self.wait_for_cooldown().await;
        self.quota.lock().await.await_proceed().await?;

        let result = call.await;

        // The request was issued either way
        self.quota.lock().await.record_request();
        stats.api_calls += 1;

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_transient() {
                    let until =
                        Utc::now() + chrono::Duration::seconds(self.config.cooldown_secs as i64);
                    log::warn!("Transient API error, cooling down until {}: {}", until, e);
                    *self.cooldown_until.write().await = Some(until);
                }
                Err(Error::Api(e))
            }
        }
    }

    async fn wait_for_cooldown(&self) {
        let until = *self.cooldown_until.read().await;
        if let Some(until) = until {
            let now = Utc::now();
            if now < until {
                let wait = (until - now).to_std().unwrap_or_default();
                log::info!("In API cooldown, waiting {:?} before next call", wait);
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Whether the cooldown armed by a transient error is still active
    pub async fn in_cooldown(&self) -> bool {
        match *self.cooldown_until.read().await {
            Some(until) => Utc::now() < until,
            None => false,
        }
    }

    /// Remaining cooldown, `None` when not cooling down
    pub async fn cooldown_remaining(&self) -> Option<std::time::Duration> {
        let until = (*self.cooldown_until.read().await)?;
        (until - Utc::now()).to_std().ok()
    }

    /// Whether a run is currently in flight
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Access the API collaborator
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Current quota usage for monitoring
    pub async fn quota_status(&self) -> QuotaStatus {
        self.quota.lock().await.status()
    }

    /// Quota counters for persistence across restarts
    pub async fn quota_usage(&self) -> QuotaUsage {
        self.quota.lock().await.usage()
    }

    /// Persist a run row marking a scheduled cycle that was skipped while
    /// the cooldown was active. No external calls are made.
    pub async fn record_skipped_run(&self) -> Result<SyncRun> {
        let now = Utc::now();
        let run = RunStats::default().into_run(now, now, true);
        save_run(&self.pool, &run).await?;
        log::info!("Recorded skipped run {} (cooldown active)", run.id);
        Ok(run)
    }
}

/// Persist one run row (append-only)
pub async fn save_run(pool: &SqlitePool, run: &SyncRun) -> Result<()> {
    let errors = serde_json::to_string(&run.errors)?;

    sqlx::query(
        r#"
        INSERT INTO sync_runs
            (id, started_at, finished_at, entities_processed, entities_skipped,
             posts_added, posts_updated, records_rejected, api_calls, skipped, errors)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&run.id)
    .bind(run.started_at)
    .bind(run.finished_at)
    .bind(run.entities_processed)
    .bind(run.entities_skipped)
    .bind(run.posts_added)
    .bind(run.posts_updated)
    .bind(run.records_rejected)
    .bind(run.api_calls)
    .bind(run.skipped)
    .bind(&errors)
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent runs, newest first
pub async fn list_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<SyncRun>> {
    let rows: Vec<StoredSyncRun> =
        sqlx::query_as("SELECT * FROM sync_runs ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await?;

    Ok(rows.iter().map(|r| r.to_sync_run()).collect())
}
