use crate::metrics::{ApiMetrics, MetricsCollector, RequestMetrics};
use crate::rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};
use chrono::{DateTime, Utc};
use modbot_core::{word_count, Comment, CoreError, Post, RedditApiError};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const REDDIT_API_BASE: &str = "https://oauth.reddit.com";

#[derive(Debug, Clone, Deserialize)]
pub struct RedditListing<T> {
    pub kind: String,
    pub data: RedditListingData<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditListingData<T> {
    pub children: Vec<RedditListingChild<T>>,
    pub after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditListingChild<T> {
    pub kind: String,
    pub data: T,
}

impl<T> RedditListing<T> {
    pub fn into_items(self) -> impl Iterator<Item = T> {
        self.data.children.into_iter().map(|child| child.data)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditPostData {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    pub author: String,
    pub created_utc: f64,
    #[serde(default)]
    pub num_comments: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditCommentData {
    pub id: String,
    pub link_id: String,
    pub parent_id: String,
    pub author: String,
    #[serde(default)]
    pub body: String,
    pub created_utc: f64,
    pub depth: Option<u32>,
    pub link_title: Option<String>,
    /// Either an empty string or a nested listing.
    #[serde(default)]
    pub replies: serde_json::Value,
}

/// A modqueue entry; posts and comments share the fields we read.
#[derive(Debug, Clone, Deserialize)]
pub struct RedditModqueueItem {
    pub name: String,
    pub author: String,
    /// `[reason, moderator]` pairs.
    #[serde(default)]
    pub mod_reports: Vec<(Option<String>, String)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditUserData {
    pub name: String,
    #[serde(default)]
    pub link_karma: i64,
    #[serde(default)]
    pub comment_karma: i64,
    #[serde(default)]
    pub is_suspended: bool,
}

impl RedditUserData {
    pub fn total_karma(&self) -> i64 {
        self.link_karma + self.comment_karma
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditUserList {
    pub data: RedditUserListData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditUserListData {
    pub children: Vec<RedditUserListEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditUserListEntry {
    pub name: String,
}

/// Envelope returned by `api_type=json` write endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct RedditActionResponse {
    pub json: RedditActionBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditActionBody {
    /// `[code, message, field]` triples.
    #[serde(default)]
    pub errors: Vec<Vec<serde_json::Value>>,
    pub data: Option<RedditActionData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditActionData {
    #[serde(default)]
    pub things: Vec<RedditListingChild<RedditCreatedThing>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditCreatedThing {
    pub id: String,
}

fn timestamp(created_utc: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(created_utc as i64, 0).unwrap_or_default()
}

fn strip_kind(fullname: &str) -> &str {
    fullname.split_once('_').map_or(fullname, |(_, id)| id)
}

impl From<RedditPostData> for Post {
    fn from(data: RedditPostData) -> Self {
        Self {
            word_count: word_count(&data.selftext),
            id: data.id,
            author: data.author,
            title: data.title,
            body: data.selftext,
            created_at: timestamp(data.created_utc),
            num_comments: data.num_comments,
        }
    }
}

impl From<RedditCommentData> for Comment {
    fn from(data: RedditCommentData) -> Self {
        let parent_comment_id = data
            .parent_id
            .starts_with("t1_")
            .then(|| strip_kind(&data.parent_id).to_string());
        let depth = data
            .depth
            .unwrap_or(if parent_comment_id.is_some() { 1 } else { 0 });

        Self {
            word_count: word_count(&data.body),
            id: data.id,
            post_id: strip_kind(&data.link_id).to_string(),
            parent_comment_id,
            author: data.author,
            body: data.body,
            created_at: timestamp(data.created_utc),
            depth,
            post_title: data.link_title,
        }
    }
}

/// Flattens a thread's comment tree in display order, skipping "more" stubs.
pub fn flatten_comment_tree(children: Vec<RedditListingChild<serde_json::Value>>) -> Vec<Comment> {
    let mut comments = Vec::new();
    let mut stack: Vec<_> = children.into_iter().rev().collect();

    while let Some(child) = stack.pop() {
        if child.kind != "t1" {
            continue;
        }
        let data: RedditCommentData = match serde_json::from_value(child.data) {
            Ok(data) => data,
            Err(e) => {
                debug!("Skipping unparseable comment: {}", e);
                continue;
            }
        };
        if let Ok(replies) =
            serde_json::from_value::<RedditListing<serde_json::Value>>(data.replies.clone())
        {
            stack.extend(replies.data.children.into_iter().rev());
        }
        comments.push(Comment::from(data));
    }

    comments
}

/// Turns the `errors` array of a write response into an error, if any.
pub fn action_error(body: &RedditActionBody) -> Option<RedditApiError> {
    let first = body.errors.first()?;
    let code = first.first().and_then(|v| v.as_str()).unwrap_or("UNKNOWN");
    let message = first.get(1).and_then(|v| v.as_str()).unwrap_or("");

    if code == "RATELIMIT" {
        return Some(RedditApiError::RateLimitExceeded {
            retry_after: parse_wait(message).unwrap_or(60),
        });
    }
    Some(RedditApiError::ActionRejected {
        details: format!("{code}: {message}"),
    })
}

/// Reads "try again in 9 minutes" style hints.
fn parse_wait(message: &str) -> Option<u64> {
    let words: Vec<&str> = message.split_whitespace().collect();
    words.windows(2).find_map(|pair| {
        let amount: u64 = pair[0].parse().ok()?;
        let unit = pair[1].trim_end_matches(|c: char| !c.is_alphabetic());
        match unit {
            "second" | "seconds" => Some(amount),
            "minute" | "minutes" => Some(amount * 60),
            _ => None,
        }
    })
}

fn status_error(status: u16, endpoint: &str, retry_after: Option<u64>) -> RedditApiError {
    match status {
        429 => RedditApiError::RateLimitExceeded {
            retry_after: retry_after.unwrap_or(60),
        },
        401 => RedditApiError::InvalidToken,
        403 => RedditApiError::Forbidden {
            resource: endpoint.to_string(),
        },
        404 => RedditApiError::NotFound {
            resource: endpoint.to_string(),
        },
        s if s >= 500 => RedditApiError::ServerError { status_code: s },
        s => RedditApiError::InvalidResponse {
            details: format!("unexpected status {s} for {endpoint}"),
        },
    }
}

fn header_number(response: &Response, name: &str) -> Option<f64> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

#[derive(Debug)]
pub struct RedditApiClient {
    http_client: Client,
    rate_limiter: RateLimiter,
    metrics: MetricsCollector,
    base_url: String,
}

impl RedditApiClient {
    /// The `http_client` must already carry the User-Agent.
    pub fn new(http_client: Client) -> Self {
        Self {
            http_client,
            rate_limiter: RateLimiter::new(RateLimitConfig::reddit_oauth()),
            metrics: MetricsCollector::new(),
            base_url: REDDIT_API_BASE.to_string(),
        }
    }

    pub async fn make_request(
        &self,
        method: Method,
        endpoint: &str,
        access_token: &str,
        query_params: &[(&str, &str)],
        form: Option<&[(&str, &str)]>,
    ) -> Result<Response, CoreError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let _permit = self.rate_limiter.acquire_permit().await?;
        debug!("Acquired rate limit permit for {} {}", method, endpoint);

        let mut request_builder = self
            .http_client
            .request(method.clone(), &url)
            .bearer_auth(access_token)
            .query(&[("raw_json", "1")]);
        if !query_params.is_empty() {
            request_builder = request_builder.query(query_params);
        }
        if let Some(form) = form {
            request_builder = request_builder.form(form);
        }

        info!("Making Reddit API request: {} {}", method, endpoint);
        let start_time = Instant::now();
        let result = request_builder.send().await;
        let response_time = start_time.elapsed();

        let outcome = match result {
            Ok(response) => {
                if let Some(remaining) = header_number(&response, "x-ratelimit-remaining") {
                    self.rate_limiter.observe_remaining(remaining).await;
                }
                let status = response.status();
                if status.is_success() {
                    Ok(response)
                } else {
                    let retry_after = header_number(&response, "retry-after").map(|s| s as u64);
                    error!("Request failed with status: {} for {}", status, endpoint);
                    Err(status_error(status.as_u16(), endpoint, retry_after).into())
                }
            }
            Err(e) => {
                error!("Network error for {} {}: {}", method, endpoint, e);
                if e.is_timeout() {
                    Err(CoreError::RedditApi(RedditApiError::RequestTimeout))
                } else {
                    Err(CoreError::Network(e))
                }
            }
        };

        let status_code = match &outcome {
            Ok(response) => Some(response.status().as_u16()),
            Err(CoreError::RedditApi(RedditApiError::RateLimitExceeded { .. })) => Some(429),
            Err(_) => None,
        };
        self.metrics
            .record_request(RequestMetrics {
                endpoint: endpoint.to_string(),
                status_code,
                response_time,
                success: outcome.is_ok(),
                rate_limited: status_code == Some(429),
            })
            .await;

        outcome
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        access_token: &str,
        query_params: &[(&str, &str)],
    ) -> Result<T, CoreError> {
        let response = self
            .make_request(Method::GET, endpoint, access_token, query_params, None)
            .await?;

        response.json().await.map_err(|e| {
            error!("Failed to parse response from {}: {}", endpoint, e);
            CoreError::RedditApi(RedditApiError::InvalidResponse {
                details: format!("failed to parse {endpoint}"),
            })
        })
    }

    /// POSTs an `api_type=json` form and surfaces errors reported in the body.
    pub async fn post_action(
        &self,
        endpoint: &str,
        access_token: &str,
        form: &[(&str, &str)],
    ) -> Result<RedditActionBody, CoreError> {
        let mut fields = Vec::with_capacity(form.len() + 1);
        fields.push(("api_type", "json"));
        fields.extend_from_slice(form);

        let response = self
            .make_request(Method::POST, endpoint, access_token, &[], Some(&fields))
            .await?;
        let body: RedditActionResponse = response.json().await.map_err(|e| {
            error!("Failed to parse action response from {}: {}", endpoint, e);
            CoreError::RedditApi(RedditApiError::InvalidResponse {
                details: format!("failed to parse {endpoint}"),
            })
        })?;

        match action_error(&body.json) {
            Some(rejection) => {
                warn!("Reddit rejected {}: {}", endpoint, rejection);
                Err(rejection.into())
            }
            None => Ok(body.json),
        }
    }

    pub async fn get_metrics(&self) -> ApiMetrics {
        self.metrics.get_metrics().await
    }

    pub async fn get_rate_limit_status(&self) -> RateLimitStatus {
        self.rate_limiter.get_rate_limit_status().await
    }
}
