//! Database module - SQLx with SQLite

use crate::error::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::PathBuf;

/// Database state
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Create a new database connection with default path
    pub async fn new() -> Result<Self> {
        let db_path = get_db_path()?;
        Self::open(db_path).await
    }

    /// Create a new database connection with a specific path
    pub async fn open(db_path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        log::info!("Connecting to database: {}", db_path.display());

        // Cascading deletes for entity removal rely on foreign keys being
        // enforced on every pooled connection
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        log::info!("Running database migrations...");

        // Tracked organizations/accounts
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_entities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                handle TEXT,
                slug TEXT NOT NULL UNIQUE,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Posts, keyed by entity namespace + platform post id
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                text TEXT NOT NULL,
                likes INTEGER NOT NULL DEFAULT 0,
                replies INTEGER NOT NULL DEFAULT 0,
                reposts INTEGER NOT NULL DEFAULT 0,
                quotes INTEGER NOT NULL DEFAULT 0,
                mentions TEXT NOT NULL DEFAULT '[]',
                tags TEXT NOT NULL DEFAULT '[]',
                links TEXT NOT NULL DEFAULT '[]',
                posted_at DATETIME NOT NULL,
                url TEXT NOT NULL,
                reply_to_id TEXT,
                quote_of_id TEXT,
                first_synced_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (entity_id, id),
                FOREIGN KEY (entity_id) REFERENCES tracked_entities(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_entity_posted ON posts(entity_id, posted_at)")
            .execute(&self.pool)
            .await?;

        // Per-entity resume cursor, one row per entity, overwritten per batch
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_cursors (
                entity_id TEXT PRIMARY KEY,
                last_post_id TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (entity_id) REFERENCES tracked_entities(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Follower-count samples, one canonical value per (entity, day)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS follower_snapshots (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                day DATE NOT NULL,
                value INTEGER NOT NULL,
                recorded_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (entity_id) REFERENCES tracked_entities(id) ON DELETE CASCADE,
                UNIQUE(entity_id, day)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_entity_day ON follower_snapshots(entity_id, day)")
            .execute(&self.pool)
            .await?;

        // Materialized growth computations, rebuildable from snapshots
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS growth_periods (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                period_type TEXT NOT NULL,
                period_start DATE NOT NULL,
                period_end DATE NOT NULL,
                start_value INTEGER NOT NULL,
                end_value INTEGER NOT NULL,
                delta INTEGER NOT NULL,
                percent REAL NOT NULL,
                computed_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (entity_id) REFERENCES tracked_entities(id) ON DELETE CASCADE,
                UNIQUE(entity_id, period_type, period_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One row per sync cycle, append-only
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_runs (
                id TEXT PRIMARY KEY,
                started_at DATETIME NOT NULL,
                finished_at DATETIME NOT NULL,
                entities_processed INTEGER NOT NULL DEFAULT 0,
                entities_skipped INTEGER NOT NULL DEFAULT 0,
                posts_added INTEGER NOT NULL DEFAULT 0,
                posts_updated INTEGER NOT NULL DEFAULT 0,
                records_rejected INTEGER NOT NULL DEFAULT 0,
                api_calls INTEGER NOT NULL DEFAULT 0,
                skipped BOOLEAN NOT NULL DEFAULT 0,
                errors TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_runs_started ON sync_runs(started_at)")
            .execute(&self.pool)
            .await?;

        log::info!("Database migrations completed");
        Ok(())
    }
}

/// Get database file path
/// Priority: PERCH_DB_PATH env var > default app data directory
pub fn get_db_path() -> Result<PathBuf> {
    // Check for environment variable override
    if let Ok(path) = std::env::var("PERCH_DB_PATH") {
        return Ok(PathBuf::from(path));
    }

    // Default: use app data directory
    let dirs = directories::ProjectDirs::from("com", "perch", "Perch")
        .ok_or_else(|| Error::config("Could not determine project directories"))?;

    Ok(dirs.data_dir().join("perch.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_get_db_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        std::env::remove_var("PERCH_DB_PATH");
        let path = get_db_path().unwrap();
        assert!(path.to_string_lossy().contains("perch.db"));
    }

    #[test]
    fn test_get_db_path_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let test_path = "/tmp/test_perch.db";
        std::env::set_var("PERCH_DB_PATH", test_path);
        let path = get_db_path().unwrap();
        assert_eq!(path.to_string_lossy(), test_path);
        std::env::remove_var("PERCH_DB_PATH");
    }

    #[tokio::test]
    async fn test_open_runs_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).await.unwrap();

        // Re-opening against the same file must be idempotent
        drop(db);
        let db = Database::open(dir.path().join("test.db")).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tracked_entities")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
