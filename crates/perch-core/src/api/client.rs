//! HTTP implementation of the platform API
//!
//! Thin reqwest client over the platform's v2 REST endpoints. Maps
//! throttling/outage statuses onto the transient [`ApiError`] variants so the
//! engine's cooldown logic can key off the error type alone.

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;

use crate::error::{Error, Result};

use super::{ApiError, FollowerCount, RawPost, ResolvedAccount, SocialApi, BATCH_MAX, PAGE_SIZE};

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.x.com/2";

/// Configuration for the HTTP API client
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the platform API
    pub base_url: String,
    /// Bearer token for app-level auth
    pub bearer_token: String,
}

impl ApiConfig {
    /// Build a config from environment variables.
    ///
    /// `PERCH_API_TOKEN` is required; `PERCH_API_BASE_URL` overrides the
    /// default endpoint (used against a stub server in development).
    pub fn from_env() -> Result<Self> {
        let bearer_token = std::env::var("PERCH_API_TOKEN")
            .map_err(|_| Error::config("PERCH_API_TOKEN is not set"))?;
        let base_url =
            std::env::var("PERCH_API_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            base_url,
            bearer_token,
        })
    }
}

/// reqwest-backed [`SocialApi`] implementation
pub struct HttpSocialApi {
    client: reqwest::Client,
    config: ApiConfig,
}

impl HttpSocialApi {
    /// Create a new client. Fails with a configuration error when the bearer
    /// token is empty; the engine must not start without credentials.
    pub fn new(config: ApiConfig) -> Result<Self> {
        if config.bearer_token.trim().is_empty() {
            return Err(Error::config("platform API bearer token is empty"));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            config,
        })
    }

    async fn check(&self, response: Response) -> std::result::Result<Response, ApiError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::RateLimited);
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(ApiError::Unavailable);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

// Response envelopes: the platform wraps every payload in a `data` field,
// omitted entirely when the result set is empty.

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    id: String,
    username: String,
    #[serde(default)]
    public_metrics: Option<RawAccountMetrics>,
}

#[derive(Debug, Deserialize)]
struct RawAccountMetrics {
    followers_count: Option<i64>,
}

const POST_FIELDS: &str = "created_at,public_metrics,entities,in_reply_to_id,quoted_post_id";

#[async_trait]
impl SocialApi for HttpSocialApi {
    async fn resolve_handle(
        &self,
        handle: &str,
    ) -> std::result::Result<Option<ResolvedAccount>, ApiError> {
        let url = format!("{}/users/by/username/{}", self.config.base_url, handle);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.bearer_token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = self.check(response).await?;
        let envelope: Envelope<RawAccount> = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        Ok(envelope.data.map(|a| ResolvedAccount { id: a.id }))
    }

    async fn fetch_posts_since(
        &self,
        account_id: &str,
        since_id: Option<&str>,
        page_size: u32,
    ) -> std::result::Result<Vec<RawPost>, ApiError> {
        let url = format!("{}/users/{}/posts", self.config.base_url, account_id);
        let max_results = page_size.min(PAGE_SIZE).to_string();

        let mut params = vec![
            ("max_results", max_results.as_str()),
            ("post.fields", POST_FIELDS),
        ];
        if let Some(since) = since_id {
            params.push(("since_id", since));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.bearer_token)
            .query(&params)
            .send()
            .await?;

        let response = self.check(response).await?;
        let envelope: Envelope<Vec<RawPost>> = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        Ok(envelope.data.unwrap_or_default())
    }

    async fn fetch_posts_by_ids(
        &self,
        ids: &[String],
    ) -> std::result::Result<Vec<RawPost>, ApiError> {
        debug_assert!(ids.len() <= BATCH_MAX);
        let url = format!("{}/posts", self.config.base_url);
        let joined = ids.join(",");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.bearer_token)
            .query(&[("ids", joined.as_str()), ("post.fields", POST_FIELDS)])
            .send()
            .await?;

        let response = self.check(response).await?;
        let envelope: Envelope<Vec<RawPost>> = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        Ok(envelope.data.unwrap_or_default())
    }

    async fn fetch_follower_counts(
        &self,
        handles: &[String],
    ) -> std::result::Result<Vec<FollowerCount>, ApiError> {
        debug_assert!(handles.len() <= BATCH_MAX);
        let url = format!("{}/users/by", self.config.base_url);
        let joined = handles.join(",");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.bearer_token)
            .query(&[
                ("usernames", joined.as_str()),
                ("user.fields", "public_metrics"),
            ])
            .send()
            .await?;

        let response = self.check(response).await?;
        let envelope: Envelope<Vec<RawAccount>> = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        let counts = envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|a| {
                let followers = a.public_metrics.and_then(|m| m.followers_count)?;
                Some(FollowerCount {
                    handle: a.username,
                    followers,
                })
            })
            .collect();

        Ok(counts)
    }
}
