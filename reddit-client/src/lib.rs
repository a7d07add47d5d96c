#![allow(async_fn_in_trait)]

pub mod api;
pub mod auth;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;


use api::{
    flatten_comment_tree, RedditApiClient, RedditCommentData, RedditListing, RedditModqueueItem,
    RedditPostData, RedditUserData, RedditUserList,
};
use auth::TokenManager;
use chrono::Utc;
use modbot_core::{
    BotConfig, Comment, CoreError, Platform, Post, RedditApiError, RedditCredentials,
    UserReputationFlag,
};
use rate_limiter::RateLimitStatus;
use retry::{CircuitBreakerState, RetryConfig, RetryExecutor, RetryMetrics};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use metrics::ApiMetrics;

/// What one client has spent against the Reddit API since it was created.
#[derive(Debug, Clone)]
pub struct ClientUsage {
    pub api: ApiMetrics,
    pub retry: RetryMetrics,
    pub circuit: CircuitBreakerState,
    pub rate_limit: RateLimitStatus,
}

/// Reddit-backed `Platform` scoped to one subreddit.
pub struct RedditClient {
    api: RedditApiClient,
    tokens: TokenManager,
    retry: RetryExecutor,
    subreddit: String,
    moderation_bot: String,
    username: String,
}

impl RedditClient {
    pub fn new(config: &BotConfig, credentials: RedditCredentials) -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .user_agent(&config.reddit.user_agent)
            .timeout(Duration::from_secs(config.reddit.timeout_secs.max(1)))
            .build()
            .map_err(CoreError::Network)?;

        let username = credentials.username.clone();
        Ok(Self {
            api: RedditApiClient::new(http.clone()),
            tokens: TokenManager::new(credentials, http)?,
            retry: RetryExecutor::new(RetryConfig::reddit()),
            subreddit: config.subreddit.clone(),
            moderation_bot: config.moderation_bot.clone(),
            username,
        })
    }

    pub fn subreddit(&self) -> &str {
        &self.subreddit
    }

    pub async fn usage(&self) -> ClientUsage {
        ClientUsage {
            api: self.api.get_metrics().await,
            retry: self.retry.get_metrics(),
            circuit: self.retry.get_circuit_breaker_state(),
            rate_limit: self.api.get_rate_limit_status().await,
        }
    }

    pub async fn log_usage(&self) {
        let usage = self.usage().await;
        info!(
            requests = usage.api.total_requests,
            failed = usage.api.failed_requests,
            rate_limited = usage.api.rate_limited_requests,
            retries = usage.retry.total_retries,
            circuit_trips = usage.retry.circuit_breaker_trips,
            "Reddit API: {} requests averaging {:?}, {:.0}% of rate budget in use, circuit {:?}",
            usage.api.total_requests,
            usage.api.average_response_time(),
            usage.rate_limit.utilization_percentage(),
            usage.circuit
        );
        for (endpoint, metrics) in &usage.api.requests_by_endpoint {
            debug!(
                "{}: {} requests, {} errors",
                endpoint, metrics.request_count, metrics.error_count
            );
        }
        if usage.rate_limit.is_near_limit {
            warn!("Reddit rate limit nearly exhausted");
        }
    }

    /// GET with one transparent re-authentication on a rejected token.
    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T, CoreError> {
        let token = self.tokens.access_token().await?;
        match self.api.get_json(endpoint, &token, query).await {
            Err(CoreError::RedditApi(RedditApiError::InvalidToken)) => {
                self.tokens.invalidate().await;
                let token = self.tokens.access_token().await?;
                self.api.get_json(endpoint, &token, query).await
            }
            other => other,
        }
    }

    /// A 401 means the write never happened, so re-sending after refresh is safe.
    async fn post_action(
        &self,
        endpoint: &str,
        form: &[(&str, &str)],
    ) -> Result<api::RedditActionBody, CoreError> {
        let token = self.tokens.access_token().await?;
        match self.api.post_action(endpoint, &token, form).await {
            Err(CoreError::RedditApi(RedditApiError::InvalidToken)) => {
                self.tokens.invalidate().await;
                let token = self.tokens.access_token().await?;
                self.api.post_action(endpoint, &token, form).await
            }
            other => other,
        }
    }

    async fn fetch_karma(&self, username: &str) -> Result<Option<i64>, CoreError> {
        let endpoint = format!("/user/{username}/about");
        let endpoint = endpoint.as_str();
        let about: api::RedditListingChild<RedditUserData> = self
            .retry
            .execute("fetch_user_about", move || self.get_json(endpoint, &[]))
            .await?;
        if about.data.is_suspended {
            return Ok(None);
        }
        Ok(Some(about.data.total_karma()))
    }
}

/// Reads a karma figure the moderation bot put in its report, e.g. "karma: -95".
pub fn karma_from_report(reason: &str) -> Option<i64> {
    let lower = reason.to_lowercase();
    let after = &lower[lower.find("karma")? + "karma".len()..];
    let start = after.find(|c: char| c == '-' || c.is_ascii_digit())?;
    let number: String = after[start..]
        .chars()
        .enumerate()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
        .map(|(_, c)| c)
        .collect();
    number.parse().ok()
}

/// Users reported by `moderation_bot`, with the report reason that named them.
pub fn flagged_authors(items: &[RedditModqueueItem], moderation_bot: &str) -> BTreeMap<String, String> {
    let mut flagged = BTreeMap::new();
    for item in items {
        if item.author == "[deleted]" {
            continue;
        }
        let report = item
            .mod_reports
            .iter()
            .find(|(_, moderator)| moderator.eq_ignore_ascii_case(moderation_bot));
        if let Some((reason, _)) = report {
            flagged
                .entry(item.author.clone())
                .or_insert_with(|| reason.clone().unwrap_or_default());
        }
    }
    flagged
}

impl Platform for RedditClient {
    async fn fetch_posts(&self, limit: u32) -> Result<Vec<Post>, CoreError> {
        let endpoint = format!("/r/{}/new", self.subreddit);
        let limit = limit.to_string();
        let (endpoint, query) = (endpoint.as_str(), [("limit", limit.as_str())]);
        let query = &query[..];

        let listing: RedditListing<RedditPostData> = self
            .retry
            .execute("fetch_posts", move || self.get_json(endpoint, query))
            .await?;

        let posts: Vec<Post> = listing.into_items().map(Post::from).collect();
        info!("Retrieved {} posts from r/{}", posts.len(), self.subreddit);
        Ok(posts)
    }

    async fn fetch_comments(&self, limit: u32) -> Result<Vec<Comment>, CoreError> {
        let endpoint = format!("/r/{}/comments", self.subreddit);
        let limit = limit.to_string();
        let (endpoint, query) = (endpoint.as_str(), [("limit", limit.as_str())]);
        let query = &query[..];

        let listing: RedditListing<RedditCommentData> = self
            .retry
            .execute("fetch_comments", move || self.get_json(endpoint, query))
            .await?;

        let comments: Vec<Comment> = listing.into_items().map(Comment::from).collect();
        info!("Retrieved {} comments from r/{}", comments.len(), self.subreddit);
        Ok(comments)
    }

    async fn fetch_thread_comments(
        &self,
        post_id: &str,
        limit: u32,
    ) -> Result<Vec<Comment>, CoreError> {
        let endpoint = format!("/comments/{post_id}");
        let limit = limit.to_string();
        let (endpoint, query) = (
            endpoint.as_str(),
            [("limit", limit.as_str()), ("sort", "top"), ("depth", "3")],
        );
        let query = &query[..];

        // The response is [post listing, comment listing].
        let (_, comments): (
            RedditListing<serde_json::Value>,
            RedditListing<serde_json::Value>,
        ) = self
            .retry
            .execute("fetch_thread_comments", move || self.get_json(endpoint, query))
            .await?;

        let comments = flatten_comment_tree(comments.data.children);
        debug!("Retrieved {} comments for thread {}", comments.len(), post_id);
        Ok(comments)
    }

    async fn fetch_reputation_flags(&self) -> Result<Vec<UserReputationFlag>, CoreError> {
        let endpoint = format!("/r/{}/about/modqueue", self.subreddit);
        let (endpoint, query) = (endpoint.as_str(), [("limit", "100")]);
        let query = &query[..];

        let listing: RedditListing<RedditModqueueItem> = self
            .retry
            .execute("fetch_modqueue", move || self.get_json(endpoint, query))
            .await?;
        let items: Vec<RedditModqueueItem> = listing.into_items().collect();
        let flagged = flagged_authors(&items, &self.moderation_bot);

        let mut flags = Vec::with_capacity(flagged.len());
        for (username, reason) in flagged {
            let karma = match karma_from_report(&reason) {
                Some(karma) => karma,
                None => match self.fetch_karma(&username).await {
                    Ok(Some(karma)) => karma,
                    Ok(None) => {
                        debug!("Skipping suspended user {}", username);
                        continue;
                    }
                    Err(e) => {
                        warn!("Could not read karma for {}: {}", username, e);
                        continue;
                    }
                },
            };
            flags.push(UserReputationFlag {
                username,
                karma,
                flagged_at: Utc::now(),
                source: format!("{}: {}", self.moderation_bot, reason),
                outcome: None,
            });
        }

        info!("Found {} users flagged by {}", flags.len(), self.moderation_bot);
        Ok(flags)
    }

    async fn fetch_moderators(&self) -> Result<Vec<String>, CoreError> {
        let endpoint = format!("/r/{}/about/moderators", self.subreddit);
        let endpoint = endpoint.as_str();

        let list: RedditUserList = self
            .retry
            .execute("fetch_moderators", move || self.get_json(endpoint, &[]))
            .await?;
        Ok(list.data.children.into_iter().map(|entry| entry.name).collect())
    }

    async fn post_reply(&self, parent_fullname: &str, text: &str) -> Result<String, CoreError> {
        let form = [("thing_id", parent_fullname), ("text", text)];
        let body = self
            .retry
            .execute_once("post_reply", self.post_action("/api/comment", &form))
            .await?;

        let id = body
            .data
            .and_then(|data| data.things.into_iter().next())
            .map(|thing| thing.data.id)
            .ok_or_else(|| RedditApiError::InvalidResponse {
                details: "comment response carried no new comment".to_string(),
            })?;
        info!("Posted reply {} under {}", id, parent_fullname);
        Ok(id)
    }

    async fn find_own_replies(&self, parent_fullname: &str) -> Result<Vec<Comment>, CoreError> {
        let endpoint = format!("/user/{}/comments", self.username);
        let (endpoint, query) = (endpoint.as_str(), [("limit", "100"), ("sort", "new")]);
        let query = &query[..];

        let listing: RedditListing<RedditCommentData> = self
            .retry
            .execute("fetch_own_comments", move || self.get_json(endpoint, query))
            .await?;

        let replies: Vec<Comment> = listing
            .into_items()
            .filter(|data| data.parent_id == parent_fullname)
            .map(Comment::from)
            .collect();
        debug!("Found {} own replies under {}", replies.len(), parent_fullname);
        Ok(replies)
    }

    async fn ban_user(&self, username: &str, reason: &str, note: &str) -> Result<(), CoreError> {
        let endpoint = format!("/r/{}/api/friend", self.subreddit);
        let form = [
            ("name", username),
            ("type", "banned"),
            ("ban_reason", reason),
            ("note", note),
            ("ban_message", reason),
        ];
        self.retry
            .execute_once("ban_user", self.post_action(&endpoint, &form))
            .await?;
        info!("Banned u/{} from r/{}", username, self.subreddit);
        Ok(())
    }
}
