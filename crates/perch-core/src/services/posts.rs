//! Post storage and sync cursors
//!
//! Upsert-by-id keyed on (entity, post id). Re-ingesting an id refreshes
//! counters, content, and extension fields; it never duplicates a row and
//! never rewrites the original timestamp or first-synced bookkeeping.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::Result;
use crate::models::{NewPost, Post, SyncCursor};

/// Classification of an upsert for run accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Upsert one sanitized post into an entity's namespace.
///
/// A unique-constraint violation on insert means the row appeared between
/// the existence check and the insert; it is benign and resolved as an
/// update.
pub async fn upsert_post(
    pool: &SqlitePool,
    entity_id: &str,
    post: &NewPost,
) -> Result<UpsertOutcome> {
    let existing: Option<(String,)> =
        sqlx::query_as("SELECT id FROM posts WHERE entity_id = ? AND id = ?")
            .bind(entity_id)
            .bind(&post.id)
            .fetch_optional(pool)
            .await?;

    if existing.is_some() {
        update_post(pool, entity_id, post).await?;
        return Ok(UpsertOutcome::Updated);
    }

    match insert_post(pool, entity_id, post).await {
        Ok(()) => Ok(UpsertOutcome::Created),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            log::debug!(
                "Post {}/{} already present, resolving as update",
                entity_id,
                post.id
            );
            update_post(pool, entity_id, post).await?;
            Ok(UpsertOutcome::Updated)
        }
        Err(e) => Err(e.into()),
    }
}

async fn insert_post(
    pool: &SqlitePool,
    entity_id: &str,
    post: &NewPost,
) -> std::result::Result<(), sqlx::Error> {
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO posts
            (id, entity_id, text, likes, replies, reposts, quotes,
             mentions, tags, links, posted_at, url, reply_to_id, quote_of_id,
             first_synced_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&post.id)
    .bind(entity_id)
    .bind(&post.text)
    .bind(post.likes)
    .bind(post.replies)
    .bind(post.reposts)
    .bind(post.quotes)
    .bind(encode_array(&post.mentions))
    .bind(encode_array(&post.tags))
    .bind(encode_array(&post.links))
    .bind(post.posted_at)
    .bind(&post.url)
    .bind(&post.reply_to_id)
    .bind(&post.quote_of_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

async fn update_post(pool: &SqlitePool, entity_id: &str, post: &NewPost) -> Result<()> {
    let now = Utc::now();

    // posted_at and first_synced_at keep their original values: a refresh
    // payload may carry the ingestion-time fallback timestamp
    sqlx::query(
        r#"
        UPDATE posts
        SET text = ?, likes = ?, replies = ?, reposts = ?, quotes = ?,
            mentions = ?, tags = ?, links = ?, reply_to_id = ?, quote_of_id = ?,
            updated_at = ?
        WHERE entity_id = ? AND id = ?
        "#,
    )
    .bind(&post.text)
    .bind(post.likes)
    .bind(post.replies)
    .bind(post.reposts)
    .bind(post.quotes)
    .bind(encode_array(&post.mentions))
    .bind(encode_array(&post.tags))
    .bind(encode_array(&post.links))
    .bind(&post.reply_to_id)
    .bind(&post.quote_of_id)
    .bind(now)
    .bind(entity_id)
    .bind(&post.id)
    .execute(pool)
    .await?;

    Ok(())
}

fn encode_array(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Fetch one stored post
pub async fn get_post(pool: &SqlitePool, entity_id: &str, post_id: &str) -> Result<Option<Post>> {
    let post = sqlx::query_as("SELECT * FROM posts WHERE entity_id = ? AND id = ?")
        .bind(entity_id)
        .bind(post_id)
        .fetch_optional(pool)
        .await?;
    Ok(post)
}

/// Ids of an entity's posts from the last `days` days, newest first.
/// Feeds the engagement-refresh step.
pub async fn recent_post_ids(
    pool: &SqlitePool,
    entity_id: &str,
    days: i64,
) -> Result<Vec<String>> {
    let cutoff: DateTime<Utc> = Utc::now() - chrono::Duration::days(days);

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM posts WHERE entity_id = ? AND posted_at >= ? ORDER BY posted_at DESC",
    )
    .bind(entity_id)
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Read the sync cursor for an entity; absent means "fetch from the beginning"
pub async fn get_cursor(pool: &SqlitePool, entity_id: &str) -> Result<Option<SyncCursor>> {
    let cursor = sqlx::query_as("SELECT * FROM sync_cursors WHERE entity_id = ?")
        .bind(entity_id)
        .fetch_optional(pool)
        .await?;
    Ok(cursor)
}

/// Overwrite the sync cursor after a batch's upserts complete
pub async fn set_cursor(pool: &SqlitePool, entity_id: &str, last_post_id: &str) -> Result<()> {
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO sync_cursors (entity_id, last_post_id, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(entity_id) DO UPDATE SET
            last_post_id = excluded.last_post_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(entity_id)
    .bind(last_post_id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::CreateEntity;
    use crate::services::entities::register_entity;

    async fn test_db_with_entity() -> (tempfile::TempDir, Database, String) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).await.unwrap();
        let entity = register_entity(
            &db.pool,
            CreateEntity {
                name: "Acme Corp".to_string(),
                slug: "acme".to_string(),
                handle: Some("acme".to_string()),
            },
        )
        .await
        .unwrap();
        (dir, db, entity.id)
    }

    fn sample_post(id: &str, likes: i64) -> NewPost {
        NewPost {
            id: id.to_string(),
            text: "hello world".to_string(),
            likes,
            replies: 1,
            reposts: 2,
            quotes: 0,
            mentions: vec!["alice".to_string()],
            tags: vec![],
            links: vec![],
            posted_at: Utc::now(),
            url: format!("https://x.com/acme/status/{}", id),
            reply_to_id: None,
            quote_of_id: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (_dir, db, entity_id) = test_db_with_entity().await;

        let first = upsert_post(&db.pool, &entity_id, &sample_post("1", 10))
            .await
            .unwrap();
        assert_eq!(first, UpsertOutcome::Created);

        let second = upsert_post(&db.pool, &entity_id, &sample_post("1", 25))
            .await
            .unwrap();
        assert_eq!(second, UpsertOutcome::Updated);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);

        // Second ingestion's counters are visible
        let post = get_post(&db.pool, &entity_id, "1").await.unwrap().unwrap();
        assert_eq!(post.likes, 25);
        assert_eq!(post.mentions(), vec!["alice"]);
    }

    #[tokio::test]
    async fn test_same_id_different_entities_coexist() {
        let (_dir, db, entity_id) = test_db_with_entity().await;
        let other = register_entity(
            &db.pool,
            CreateEntity {
                name: "Globex".to_string(),
                slug: "globex".to_string(),
                handle: Some("globex".to_string()),
            },
        )
        .await
        .unwrap();

        upsert_post(&db.pool, &entity_id, &sample_post("1", 1))
            .await
            .unwrap();
        let outcome = upsert_post(&db.pool, &other.id, &sample_post("1", 2))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Created);
    }

    #[tokio::test]
    async fn test_recent_post_ids_window() {
        let (_dir, db, entity_id) = test_db_with_entity().await;

        let mut fresh = sample_post("new", 0);
        fresh.posted_at = Utc::now() - chrono::Duration::days(2);
        let mut stale = sample_post("old", 0);
        stale.posted_at = Utc::now() - chrono::Duration::days(30);

        upsert_post(&db.pool, &entity_id, &fresh).await.unwrap();
        upsert_post(&db.pool, &entity_id, &stale).await.unwrap();

        let ids = recent_post_ids(&db.pool, &entity_id, 7).await.unwrap();
        assert_eq!(ids, vec!["new"]);
    }

    #[tokio::test]
    async fn test_cursor_absent_then_overwritten() {
        let (_dir, db, entity_id) = test_db_with_entity().await;

        assert!(get_cursor(&db.pool, &entity_id).await.unwrap().is_none());

        set_cursor(&db.pool, &entity_id, "100").await.unwrap();
        set_cursor(&db.pool, &entity_id, "200").await.unwrap();

        let cursor = get_cursor(&db.pool, &entity_id).await.unwrap().unwrap();
        assert_eq!(cursor.last_post_id, "200");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_cursors")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
