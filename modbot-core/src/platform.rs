use crate::{Comment, CoreError, Post, UserReputationFlag};

/// The content platform the bot reads from and acts on.
///
/// Implementations own authentication, rate limiting and wire formats. All
/// calls are single request/response operations; a failure affects only the
/// item being processed.
pub trait Platform {
    /// Newest posts in the monitored community.
    async fn fetch_posts(&self, limit: u32) -> Result<Vec<Post>, CoreError>;

    /// Newest comments across the monitored community.
    async fn fetch_comments(&self, limit: u32) -> Result<Vec<Comment>, CoreError>;

    /// Comments of one thread, best first; used as digest context.
    async fn fetch_thread_comments(
        &self,
        post_id: &str,
        limit: u32,
    ) -> Result<Vec<Comment>, CoreError>;

    /// Users recently flagged by the external moderation bot, with karma.
    async fn fetch_reputation_flags(&self) -> Result<Vec<UserReputationFlag>, CoreError>;

    async fn fetch_moderators(&self) -> Result<Vec<String>, CoreError>;

    /// Posts `text` under `parent_fullname` and returns the new comment id.
    async fn post_reply(&self, parent_fullname: &str, text: &str) -> Result<String, CoreError>;

    /// The bot account's existing replies directly under `parent_fullname`.
    async fn find_own_replies(&self, parent_fullname: &str) -> Result<Vec<Comment>, CoreError>;

    async fn ban_user(&self, username: &str, reason: &str, note: &str) -> Result<(), CoreError>;
}
