//! Inbound payload validation and sanitization
//!
//! Single place where a loosely-shaped [`RawPost`] from the platform becomes
//! a strictly typed [`NewPost`]. The fallback rules encode real API quirks:
//! timestamps that fail to parse, counters delivered as strings or negative
//! placeholders, entity arrays of inconsistent shape. A post is only rejected
//! when it is unusable without the field (no id, no text); everything else is
//! repaired with a documented default.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::api::RawPost;
use crate::models::NewPost;

/// Maximum stored text length in code points
pub const TEXT_CAP: usize = 5_000;

/// Appended to text truncated at [`TEXT_CAP`]
pub const TRUNCATION_MARKER: &str = "…";

/// Why a post was rejected. Rejections are logged and skipped, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("post has no id")]
    MissingId,
    #[error("post has no text")]
    MissingText,
}

/// Validate and sanitize a raw post.
///
/// `handle` is the owning entity's platform handle, used to derive the
/// canonical web link; the link is never trusted from the payload.
/// `ingested_at` substitutes for a missing or unparseable timestamp.
pub fn sanitize_post(
    raw: &RawPost,
    handle: &str,
    ingested_at: DateTime<Utc>,
) -> Result<NewPost, RejectReason> {
    let id = match raw.id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(RejectReason::MissingId),
    };

    let text = match raw.text.as_deref() {
        Some(text) if !text.is_empty() => cap_text(text),
        _ => return Err(RejectReason::MissingText),
    };

    let posted_at = raw
        .created_at
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(ingested_at);

    let metrics = raw.public_metrics.as_ref();
    let likes = coerce_count(metrics.and_then(|m| m.like_count.as_ref()));
    let replies = coerce_count(metrics.and_then(|m| m.reply_count.as_ref()));
    let reposts = coerce_count(metrics.and_then(|m| m.repost_count.as_ref()));
    let quotes = coerce_count(metrics.and_then(|m| m.quote_count.as_ref()));

    let entities = raw.entities.as_ref();
    let mentions = extract_strings(entities.and_then(|e| e.mentions.as_ref()), "username");
    let tags = extract_strings(entities.and_then(|e| e.hashtags.as_ref()), "tag");
    let links = extract_strings(entities.and_then(|e| e.urls.as_ref()), "expanded_url");

    Ok(NewPost {
        url: canonical_post_url(handle, &id),
        id,
        text,
        likes,
        replies,
        reposts,
        quotes,
        mentions,
        tags,
        links,
        posted_at,
        reply_to_id: raw.in_reply_to_id.clone(),
        quote_of_id: raw.quoted_post_id.clone(),
    })
}

/// Canonical web link for a post, derived from the owning handle and post id
pub fn canonical_post_url(handle: &str, post_id: &str) -> String {
    format!("https://x.com/{}/status/{}", handle, post_id)
}

fn cap_text(text: &str) -> String {
    if text.chars().count() <= TEXT_CAP {
        return text.to_string();
    }
    let mut capped: String = text.chars().take(TEXT_CAP).collect();
    capped.push_str(TRUNCATION_MARKER);
    capped
}

/// Parse a platform timestamp (RFC3339, with naive fallbacks)
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

/// Coerce an engagement counter to a non-negative integer.
/// Missing or non-numeric values become 0; so do negatives.
fn coerce_count(value: Option<&Value>) -> i64 {
    let n = match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    n.unwrap_or(0).max(0)
}

/// Extract a string array from an untrusted value. Accepts an array of
/// strings or an array of objects carrying `object_key`; anything else
/// yields an empty list.
fn extract_strings(value: Option<&Value>, object_key: &str) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map
                .get(object_key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            _ => None,
        })
        .collect()
}
