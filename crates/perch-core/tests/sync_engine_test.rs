//! End-to-end sync engine tests against a scripted platform API

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;

use perch_core::api::{ApiError, FollowerCount, RawPost, ResolvedAccount, SocialApi};
use perch_core::services::posts::{get_cursor, get_post};
use perch_core::services::sync::list_runs;
use perch_core::{
    CreateEntity, Database, Error, QuotaConfig, QuotaTracker, SyncEngine, SyncEngineConfig,
};

// ============================================================================
// Scripted API
// ============================================================================

#[derive(Default)]
struct MockApi {
    /// handle -> platform account id
    accounts: HashMap<String, String>,
    /// account id -> posts on the platform
    posts: Mutex<HashMap<String, Vec<RawPost>>>,
    /// handle -> follower count
    followers: Mutex<HashMap<String, i64>>,
    /// account ids whose post fetch fails with a server error
    fail_fetch: Mutex<HashSet<String>>,
    /// fail the next post fetch with 429, once
    rate_limit_next_fetch: AtomicBool,
    /// fail the next follower fetch with 429, once
    rate_limit_next_followers: AtomicBool,
    /// artificial latency per post fetch
    fetch_delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockApi {
    fn new() -> Self {
        Self::default()
    }

    fn with_account(mut self, handle: &str, account_id: &str) -> Self {
        self.accounts.insert(handle.to_string(), account_id.to_string());
        self
    }

    fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    async fn add_post(&self, account_id: &str, raw: RawPost) {
        self.posts
            .lock()
            .await
            .entry(account_id.to_string())
            .or_default()
            .push(raw);
    }

    async fn set_followers(&self, handle: &str, count: i64) {
        self.followers.lock().await.insert(handle.to_string(), count);
    }

    async fn fail_fetch_for(&self, account_id: &str) {
        self.fail_fetch.lock().await.insert(account_id.to_string());
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn numeric(id: &str) -> u64 {
    id.parse().unwrap_or(0)
}

#[async_trait]
impl SocialApi for MockApi {
    async fn resolve_handle(
        &self,
        handle: &str,
    ) -> Result<Option<ResolvedAccount>, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .accounts
            .get(handle)
            .map(|id| ResolvedAccount { id: id.clone() }))
    }

    async fn fetch_posts_since(
        &self,
        account_id: &str,
        since_id: Option<&str>,
        page_size: u32,
    ) -> Result<Vec<RawPost>, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.rate_limit_next_fetch.swap(false, Ordering::SeqCst) {
            return Err(ApiError::RateLimited);
        }
        if self.fail_fetch.lock().await.contains(account_id) {
            return Err(ApiError::Status {
                status: 500,
                message: "internal error".to_string(),
            });
        }

        let since = since_id.map(numeric).unwrap_or(0);
        let mut page: Vec<RawPost> = self
            .posts
            .lock()
            .await
            .get(account_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.id.as_deref().map(numeric).unwrap_or(0) > since)
            .collect();

        // Newest first, like the platform
        page.sort_by_key(|p| std::cmp::Reverse(p.id.as_deref().map(numeric).unwrap_or(0)));
        page.truncate(page_size as usize);
        Ok(page)
    }

    async fn fetch_posts_by_ids(&self, ids: &[String]) -> Result<Vec<RawPost>, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let wanted: HashSet<&str> = ids.iter().map(|s| s.as_str()).collect();
        let posts = self.posts.lock().await;
        Ok(posts
            .values()
            .flatten()
            .filter(|p| p.id.as_deref().map(|id| wanted.contains(id)).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn fetch_follower_counts(
        &self,
        handles: &[String],
    ) -> Result<Vec<FollowerCount>, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.rate_limit_next_followers.swap(false, Ordering::SeqCst) {
            return Err(ApiError::RateLimited);
        }
        let followers = self.followers.lock().await;
        Ok(handles
            .iter()
            .filter_map(|h| {
                followers.get(h).map(|count| FollowerCount {
                    handle: h.clone(),
                    followers: *count,
                })
            })
            .collect())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn raw_post(id: &str, text: &str, minutes_ago: i64) -> RawPost {
    let created_at = (Utc::now() - chrono::Duration::minutes(minutes_ago)).to_rfc3339();
    serde_json::from_value(json!({
        "id": id,
        "text": text,
        "created_at": created_at,
        "public_metrics": {"like_count": 3, "reply_count": 1, "repost_count": 0, "quote_count": 0}
    }))
    .unwrap()
}

fn fast_quota() -> QuotaTracker {
    QuotaTracker::new(QuotaConfig {
        min_spacing_ms: 0,
        ..QuotaConfig::default()
    })
}

async fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("test.db")).await.unwrap();
    (dir, db)
}

async fn register(db: &Database, slug: &str, handle: Option<&str>) -> String {
    perch_core::services::entities::register_entity(
        &db.pool,
        CreateEntity {
            name: slug.to_string(),
            slug: slug.to_string(),
            handle: handle.map(|h| h.to_string()),
        },
    )
    .await
    .unwrap()
    .id
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_full_sync_cycle() {
    let (_dir, db) = test_db().await;
    let acme_id = register(&db, "acme", Some("acme")).await;
    register(&db, "beta", None).await;

    let api = MockApi::new().with_account("acme", "A");
    api.add_post("A", raw_post("1", "first post", 90)).await;
    api.add_post("A", raw_post("2", "second post", 30)).await;
    api.set_followers("acme", 500).await;

    let engine = SyncEngine::new(db.pool.clone(), api, fast_quota());
    let run = engine.run_once().await.unwrap();

    assert_eq!(run.entities_processed, 1);
    assert_eq!(run.entities_skipped, 1);
    assert_eq!(run.posts_added, 2);
    // The engagement refresh re-fetched both fresh posts
    assert_eq!(run.posts_updated, 2);
    assert!(run.errors.is_empty());
    assert!(!run.skipped);

    // Posts stored with sanitized fields
    let post = get_post(&db.pool, &acme_id, "2").await.unwrap().unwrap();
    assert_eq!(post.text, "second post");
    assert_eq!(post.likes, 3);
    assert_eq!(post.url, "https://x.com/acme/status/2");

    // Cursor advanced to the newest id
    let cursor = get_cursor(&db.pool, &acme_id).await.unwrap().unwrap();
    assert_eq!(cursor.last_post_id, "2");

    // Today's follower snapshot recorded
    let (value,): (i64,) =
        sqlx::query_as("SELECT value FROM follower_snapshots WHERE entity_id = ?")
            .bind(&acme_id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(value, 500);

    // Growth periods materialized for every granularity
    let (periods,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM growth_periods WHERE entity_id = ?")
            .bind(&acme_id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(periods, 4);

    // Run stats persisted
    let runs = list_runs(&db.pool, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].posts_added, 2);
}

#[tokio::test]
async fn test_incremental_fetch_uses_cursor() {
    let (_dir, db) = test_db().await;
    let acme_id = register(&db, "acme", Some("acme")).await;

    let api = MockApi::new().with_account("acme", "A");
    api.add_post("A", raw_post("1", "first", 90)).await;
    api.add_post("A", raw_post("2", "second", 30)).await;
    api.set_followers("acme", 500).await;

    let engine = SyncEngine::new(db.pool.clone(), api, fast_quota());
    let first = engine.run_once().await.unwrap();
    assert_eq!(first.posts_added, 2);

    // A new post appears; the next run ingests only the strictly newer id,
    // while the older two come back through the refresh path as updates
    engine_api(&engine)
        .add_post("A", raw_post("3", "third", 1))
        .await;
    let second = engine.run_once().await.unwrap();

    assert_eq!(second.posts_added, 1);
    assert_eq!(second.posts_updated, 3);

    let cursor = get_cursor(&db.pool, &acme_id).await.unwrap().unwrap();
    assert_eq!(cursor.last_post_id, "3");
}

#[tokio::test]
async fn test_invalid_records_rejected_not_fatal() {
    let (_dir, db) = test_db().await;
    let acme_id = register(&db, "acme", Some("acme")).await;

    let api = MockApi::new().with_account("acme", "A");
    // Missing text: rejected
    api.add_post("A", serde_json::from_value(json!({"id": "9"})).unwrap())
        .await;
    api.add_post("A", raw_post("10", "valid", 10)).await;

    let engine = SyncEngine::new(db.pool.clone(), api, fast_quota());
    let run = engine.run_once().await.unwrap();

    assert_eq!(run.posts_added, 1);
    assert!(run.records_rejected >= 1);
    assert!(get_post(&db.pool, &acme_id, "9").await.unwrap().is_none());
    assert!(get_post(&db.pool, &acme_id, "10").await.unwrap().is_some());
}

#[tokio::test]
async fn test_per_entity_isolation() {
    let (_dir, db) = test_db().await;
    register(&db, "alpha", Some("alpha")).await;
    register(&db, "broken", Some("broken")).await;
    register(&db, "gamma", Some("gamma")).await;

    let api = MockApi::new()
        .with_account("alpha", "A")
        .with_account("broken", "B")
        .with_account("gamma", "C");
    api.add_post("A", raw_post("1", "from alpha", 10)).await;
    api.add_post("C", raw_post("2", "from gamma", 10)).await;
    api.fail_fetch_for("B").await;

    let engine = SyncEngine::new(db.pool.clone(), api, fast_quota());
    let run = engine.run_once().await.unwrap();

    // The failing entity did not stop the others
    assert_eq!(run.entities_processed, 2);
    assert_eq!(run.posts_added, 2);
    assert!(run.errors.iter().any(|e| e.contains("broken")));
}

#[tokio::test]
async fn test_cursor_unchanged_when_fetch_fails() {
    let (_dir, db) = test_db().await;
    let acme_id = register(&db, "acme", Some("acme")).await;

    let api = MockApi::new().with_account("acme", "A");
    api.add_post("A", raw_post("1", "first", 90)).await;
    api.add_post("A", raw_post("2", "second", 30)).await;

    let engine = SyncEngine::new(db.pool.clone(), api, fast_quota());
    engine.run_once().await.unwrap();

    let before = get_cursor(&db.pool, &acme_id).await.unwrap().unwrap();
    assert_eq!(before.last_post_id, "2");

    engine_api(&engine).fail_fetch_for("A").await;
    let run = engine.run_once().await.unwrap();
    assert!(!run.errors.is_empty());

    let after = get_cursor(&db.pool, &acme_id).await.unwrap().unwrap();
    assert_eq!(after.last_post_id, "2");
}

#[tokio::test]
async fn test_run_mutual_exclusion() {
    let (_dir, db) = test_db().await;
    register(&db, "acme", Some("acme")).await;

    let api = MockApi::new()
        .with_account("acme", "A")
        .with_fetch_delay(Duration::from_millis(200));
    api.add_post("A", raw_post("1", "slow", 10)).await;

    let engine = Arc::new(SyncEngine::new(db.pool.clone(), api, fast_quota()));

    let background = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run_once().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.is_running());
    let concurrent = engine.run_once().await;
    assert!(matches!(concurrent, Err(Error::SyncInProgress)));

    // The in-flight run completes untouched
    let run = background.await.unwrap().unwrap();
    assert_eq!(run.entities_processed, 1);
    assert_eq!(run.posts_added, 1);

    // Exactly one run row was written
    let runs = list_runs(&db.pool, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn test_transient_error_arms_cooldown() {
    let (_dir, db) = test_db().await;
    register(&db, "acme", Some("acme")).await;

    let api = MockApi::new().with_account("acme", "A");
    api.set_followers("acme", 500).await;
    api.rate_limit_next_followers.store(true, Ordering::SeqCst);

    let engine = SyncEngine::new(db.pool.clone(), api, fast_quota());
    let run = engine.run_once().await.unwrap();

    assert!(run.errors.iter().any(|e| e.contains("follower counts")));
    assert!(engine.in_cooldown().await);

    let remaining = engine.cooldown_remaining().await.unwrap();
    assert!(remaining <= Duration::from_secs(15 * 60));
    assert!(remaining > Duration::from_secs(14 * 60));
}

#[tokio::test]
async fn test_cooldown_waited_out_before_next_call() {
    let (_dir, db) = test_db().await;
    register(&db, "acme", Some("acme")).await;

    let api = MockApi::new().with_account("acme", "A");
    api.set_followers("acme", 500).await;
    api.rate_limit_next_followers.store(true, Ordering::SeqCst);

    let config = SyncEngineConfig {
        cooldown_secs: 1,
        ..SyncEngineConfig::default()
    };
    let engine = SyncEngine::with_config(db.pool.clone(), api, fast_quota(), config);

    // First run's final call rate-limits, arming a 1s cooldown
    let first = engine.run_once().await.unwrap();
    assert!(!first.errors.is_empty());
    let calls_before = engine_api(&engine).calls();

    // The next run's first external call must wait out the remainder
    let started = Instant::now();
    let second = engine.run_once().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(700));
    assert!(second.errors.is_empty());
    assert!(engine_api(&engine).calls() > calls_before);
}

/// The engine owns the mock; tests reach it through this accessor
fn engine_api(engine: &SyncEngine<MockApi>) -> &MockApi {
    engine.api()
}
