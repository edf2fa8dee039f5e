//! Data models for the Perch sync engine

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A tracked organization/account
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TrackedEntity {
    pub id: String,
    /// Human-readable organization name
    pub name: String,
    /// Platform handle; entities without one are skipped by sync
    pub handle: Option<String>,
    /// Storage-namespace key, unique across entities
    pub slug: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration request for a tracked entity
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEntity {
    pub name: String,
    pub slug: String,
    pub handle: Option<String>,
}

/// Update request for a tracked entity; `None` fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateEntity {
    pub name: Option<String>,
    pub handle: Option<String>,
}

/// A stored post. Array-typed extension fields are JSON-encoded TEXT columns;
/// use the accessor methods to decode them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Post {
    /// Platform post id, unique within the owning entity's namespace
    pub id: String,
    pub entity_id: String,
    pub text: String,
    pub likes: i64,
    pub replies: i64,
    pub reposts: i64,
    pub quotes: i64,
    /// JSON array of mentioned handles
    pub mentions: String,
    /// JSON array of hashtags
    pub tags: String,
    /// JSON array of link URLs
    pub links: String,
    pub posted_at: DateTime<Utc>,
    /// Canonical web link, derived from handle + id at ingestion
    pub url: String,
    pub reply_to_id: Option<String>,
    pub quote_of_id: Option<String>,
    pub first_synced_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    pub fn mentions(&self) -> Vec<String> {
        decode_string_array(&self.mentions)
    }

    pub fn tags(&self) -> Vec<String> {
        decode_string_array(&self.tags)
    }

    pub fn links(&self) -> Vec<String> {
        decode_string_array(&self.links)
    }
}

fn decode_string_array(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

/// A validated, sanitized post ready for upsert
#[derive(Debug, Clone, PartialEq)]
pub struct NewPost {
    pub id: String,
    pub text: String,
    pub likes: i64,
    pub replies: i64,
    pub reposts: i64,
    pub quotes: i64,
    pub mentions: Vec<String>,
    pub tags: Vec<String>,
    pub links: Vec<String>,
    pub posted_at: DateTime<Utc>,
    pub url: String,
    pub reply_to_id: Option<String>,
    pub quote_of_id: Option<String>,
}

/// Per-entity pointer to the most recently ingested post id
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncCursor {
    pub entity_id: String,
    pub last_post_id: String,
    pub updated_at: DateTime<Utc>,
}

/// One follower-count sample: at most one canonical value per (entity, day)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FollowerSnapshot {
    pub id: String,
    pub entity_id: String,
    pub day: NaiveDate,
    pub value: i64,
    pub recorded_at: DateTime<Utc>,
}

/// Supported growth-period granularities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrowthPeriodType {
    Day,
    Week,
    Month,
    Year,
}

impl GrowthPeriodType {
    pub const ALL: [GrowthPeriodType; 4] = [
        GrowthPeriodType::Day,
        GrowthPeriodType::Week,
        GrowthPeriodType::Month,
        GrowthPeriodType::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GrowthPeriodType::Day => "day",
            GrowthPeriodType::Week => "week",
            GrowthPeriodType::Month => "month",
            GrowthPeriodType::Year => "year",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "day" => Some(GrowthPeriodType::Day),
            "week" => Some(GrowthPeriodType::Week),
            "month" => Some(GrowthPeriodType::Month),
            "year" => Some(GrowthPeriodType::Year),
            _ => None,
        }
    }
}

/// A materialized growth computation, unique per (entity, period type,
/// period start). Safe to drop and rebuild from snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GrowthPeriod {
    pub id: String,
    pub entity_id: String,
    pub period_type: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub start_value: i64,
    pub end_value: i64,
    pub delta: i64,
    pub percent: f64,
    pub computed_at: DateTime<Utc>,
}

/// Growth over a window, computed on demand
#[derive(Debug, Clone, Serialize)]
pub struct WindowGrowth {
    pub entity_id: String,
    pub start_value: i64,
    pub end_value: i64,
    pub delta: i64,
    pub percent: f64,
}

/// Aggregate counters for one sync cycle, one row per run, append-only
#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities_processed: i64,
    pub entities_skipped: i64,
    pub posts_added: i64,
    pub posts_updated: i64,
    pub records_rejected: i64,
    pub api_calls: i64,
    /// True when a scheduled run was skipped entirely (cooldown)
    pub skipped: bool,
    pub errors: Vec<String>,
}

/// Database row representation of a sync run; `errors` is a JSON array
#[derive(Debug, Clone, FromRow)]
pub struct StoredSyncRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities_processed: i64,
    pub entities_skipped: i64,
    pub posts_added: i64,
    pub posts_updated: i64,
    pub records_rejected: i64,
    pub api_calls: i64,
    pub skipped: bool,
    pub errors: String,
}

impl StoredSyncRun {
    /// Convert a database row to a [`SyncRun`]
    pub fn to_sync_run(&self) -> SyncRun {
        SyncRun {
            id: self.id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            entities_processed: self.entities_processed,
            entities_skipped: self.entities_skipped,
            posts_added: self.posts_added,
            posts_updated: self.posts_updated,
            records_rejected: self.records_rejected,
            api_calls: self.api_calls,
            skipped: self.skipped,
            errors: decode_string_array(&self.errors),
        }
    }
}
