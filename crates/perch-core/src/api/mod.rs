//! External platform API collaborator
//!
//! Defines the contract the sync engine consumes: handle resolution,
//! incremental post fetches, batched post refreshes, and batched follower
//! counts. The engine only talks to the platform through the [`SocialApi`]
//! trait so tests can substitute a scripted implementation.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub mod client;

pub use client::{ApiConfig, HttpSocialApi};

/// Maximum posts per fetch page, enforced by the platform
pub const PAGE_SIZE: u32 = 100;

/// Maximum ids/handles per batched lookup call, enforced by the platform
pub const BATCH_MAX: usize = 100;

// ============================================================================
// Errors
// ============================================================================

/// Error raised by the platform API collaborator
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("rate limited by platform API")]
    RateLimited,

    #[error("platform API unavailable")]
    Unavailable,

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected response ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether this error should trigger the engine's cooldown.
    ///
    /// Covers HTTP 429/503 and the message phrasings the platform uses for
    /// throttling and transient outages.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::RateLimited | ApiError::Unavailable => true,
            ApiError::Request(e) => e.is_timeout() || e.is_connect(),
            ApiError::Status { status, message } => {
                if matches!(status, 429 | 503) {
                    return true;
                }
                let msg = message.to_lowercase();
                msg.contains("rate limit")
                    || msg.contains("too many requests")
                    || msg.contains("service unavailable")
            }
            ApiError::Decode(_) => false,
        }
    }
}

// ============================================================================
// Payload types
// ============================================================================

/// Account returned by handle resolution
#[derive(Debug, Clone, Deserialize)]
pub struct ResolvedAccount {
    /// Platform-assigned account id
    pub id: String,
}

/// Follower count for one handle, from the batched metrics endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct FollowerCount {
    pub handle: String,
    pub followers: i64,
}

/// Raw post payload as surfaced by the platform.
///
/// Every field is optional: the platform omits fields freely and has shipped
/// malformed values for most of them at some point. [`crate::services::sanitize`]
/// is the single place these are normalized into a typed record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPost {
    pub id: Option<String>,
    pub text: Option<String>,
    pub created_at: Option<String>,
    #[serde(default)]
    pub public_metrics: Option<RawMetrics>,
    #[serde(default)]
    pub entities: Option<RawEntities>,
    pub in_reply_to_id: Option<String>,
    pub quoted_post_id: Option<String>,
}

/// Engagement counters as delivered. Values are kept as raw JSON because the
/// platform has returned strings, floats, and negative placeholders here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMetrics {
    pub like_count: Option<serde_json::Value>,
    pub reply_count: Option<serde_json::Value>,
    pub repost_count: Option<serde_json::Value>,
    pub quote_count: Option<serde_json::Value>,
}

/// Structured entity annotations (mentions/tags/links), shape not trusted
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEntities {
    pub mentions: Option<serde_json::Value>,
    pub hashtags: Option<serde_json::Value>,
    pub urls: Option<serde_json::Value>,
}

// ============================================================================
// Collaborator trait
// ============================================================================

/// The platform API surface consumed by the sync engine.
///
/// Each method maps to exactly one external call; the engine accounts quota
/// per invocation. `fetch_posts_since` uses `since_id` semantics: only posts
/// strictly newer than the given id are returned, newest first.
#[async_trait]
pub trait SocialApi: Send + Sync {
    /// Resolve a handle to its platform account id. `None` when the handle
    /// does not exist (soft failure for the engine).
    async fn resolve_handle(&self, handle: &str) -> Result<Option<ResolvedAccount>, ApiError>;

    /// Fetch posts for an account, newest first, strictly newer than
    /// `since_id` when given, bounded by `page_size` (≤ [`PAGE_SIZE`]).
    async fn fetch_posts_since(
        &self,
        account_id: &str,
        since_id: Option<&str>,
        page_size: u32,
    ) -> Result<Vec<RawPost>, ApiError>;

    /// Re-fetch posts by id for engagement refresh. Callers chunk to
    /// [`BATCH_MAX`] ids per call.
    async fn fetch_posts_by_ids(&self, ids: &[String]) -> Result<Vec<RawPost>, ApiError>;

    /// Batched follower counts, ≤ [`BATCH_MAX`] handles per call. Handles
    /// unknown to the platform are absent from the result.
    async fn fetch_follower_counts(&self, handles: &[String]) -> Result<Vec<FollowerCount>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_is_transient() {
        assert!(ApiError::RateLimited.is_transient());
        assert!(ApiError::Unavailable.is_transient());
    }

    #[test]
    fn test_status_codes_transient() {
        let err = ApiError::Status {
            status: 429,
            message: String::new(),
        };
        assert!(err.is_transient());

        let err = ApiError::Status {
            status: 503,
            message: String::new(),
        };
        assert!(err.is_transient());

        let err = ApiError::Status {
            status: 404,
            message: "not found".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_message_phrases_transient() {
        for msg in ["Rate limit exceeded", "Too Many Requests", "Service Unavailable"] {
            let err = ApiError::Status {
                status: 400,
                message: msg.to_string(),
            };
            assert!(err.is_transient(), "expected transient for {:?}", msg);
        }
    }

    #[test]
    fn test_decode_not_transient() {
        assert!(!ApiError::Decode("bad json".to_string()).is_transient());
    }

    #[test]
    fn test_raw_post_tolerates_sparse_payload() {
        let raw: RawPost = serde_json::from_str(r#"{"id":"1"}"#).unwrap();
        assert_eq!(raw.id.as_deref(), Some("1"));
        assert!(raw.text.is_none());
        assert!(raw.public_metrics.is_none());
        assert!(raw.entities.is_none());
    }

    #[test]
    fn test_raw_metrics_keep_malformed_values() {
        let raw: RawPost = serde_json::from_str(
            r#"{"id":"1","public_metrics":{"like_count":"12","reply_count":-3}}"#,
        )
        .unwrap();
        let metrics = raw.public_metrics.unwrap();
        assert!(metrics.like_count.unwrap().is_string());
        assert_eq!(metrics.reply_count.unwrap().as_i64(), Some(-3));
    }
}
