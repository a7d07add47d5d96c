use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

/// Whitespace-delimited word count used by the TLDR thresholds.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author: String,
    pub title: String,
    pub body: String,
    pub word_count: usize,
    pub created_at: DateTime<Utc>,
    pub num_comments: u32,
}

impl Post {
    pub fn fullname(&self) -> String {
        format!("t3_{}", self.id)
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef::Post(self.id.clone())
    }

    /// Title and body joined, the text scanned for summons.
    pub fn full_text(&self) -> String {
        if self.body.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.body)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub parent_comment_id: Option<String>,
    pub author: String,
    pub body: String,
    pub word_count: usize,
    pub created_at: DateTime<Utc>,
    pub depth: u32,
    pub post_title: Option<String>,
}

impl Comment {
    pub fn fullname(&self) -> String {
        format!("t1_{}", self.id)
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef::Comment(self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionThread {
    pub post_id: String,
    pub title: String,
    pub comment_count: u32,
    pub created_at: DateTime<Utc>,
    pub summarized: BTreeSet<u32>,
}

impl DiscussionThread {
    pub fn from_post(post: &Post, history: &History) -> Self {
        Self {
            post_id: post.id.clone(),
            title: post.title.clone(),
            comment_count: post.num_comments,
            created_at: post.created_at,
            summarized: history.summarized_thresholds(&post.fullname()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotReply {
    pub id: String,
    pub target_id: String,
    pub kind: ActionKind,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BanOutcome {
    Banned,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReputationFlag {
    pub username: String,
    pub karma: i64,
    pub flagged_at: DateTime<Utc>,
    pub source: String,
    pub outcome: Option<BanOutcome>,
}

/// Reference to the post or comment an action targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ItemRef {
    Post(String),
    Comment(String),
}

impl ItemRef {
    pub fn id(&self) -> &str {
        match self {
            ItemRef::Post(id) | ItemRef::Comment(id) => id,
        }
    }

    pub fn fullname(&self) -> String {
        match self {
            ItemRef::Post(id) => format!("t3_{id}"),
            ItemRef::Comment(id) => format!("t1_{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActionKind {
    Tldr,
    Summary { threshold: u32 },
    ReplyAck,
    SummonAck,
    Ban,
}

impl ActionKind {
    /// Reply-type kinds answer a user in conversation and share the reply caps.
    pub fn is_conversational(&self) -> bool {
        matches!(self, ActionKind::ReplyAck | ActionKind::SummonAck)
    }

    pub fn generation_kind(&self) -> Option<GenerationKind> {
        match self {
            ActionKind::Tldr => Some(GenerationKind::Tldr),
            ActionKind::Summary { .. } => Some(GenerationKind::Summary),
            ActionKind::ReplyAck => Some(GenerationKind::ReplyAck),
            ActionKind::SummonAck => Some(GenerationKind::SummonAck),
            ActionKind::Ban => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Tldr => write!(f, "tldr_posted"),
            ActionKind::Summary { threshold } => write!(f, "summary_{threshold}"),
            ActionKind::ReplyAck => write!(f, "reply_ack"),
            ActionKind::SummonAck => write!(f, "summon_ack"),
            ActionKind::Ban => write!(f, "ban"),
        }
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tldr_posted" => Ok(ActionKind::Tldr),
            "reply_ack" => Ok(ActionKind::ReplyAck),
            "summon_ack" => Ok(ActionKind::SummonAck),
            "ban" => Ok(ActionKind::Ban),
            other => other
                .strip_prefix("summary_")
                .and_then(|threshold| threshold.parse().ok())
                .map(|threshold| ActionKind::Summary { threshold })
                .ok_or_else(|| format!("unknown action kind: {other}")),
        }
    }
}

impl TryFrom<String> for ActionKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    Tldr,
    Summary,
    ReplyAck,
    SummonAck,
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenerationKind::Tldr => "tldr",
            GenerationKind::Summary => "summary",
            GenerationKind::ReplyAck => "reply_ack",
            GenerationKind::SummonAck => "summon_ack",
        };
        f.write_str(name)
    }
}

/// Persisted marker: the action `kind` has been completed for `item_id`.
/// For bans the item id is the username.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub item_id: String,
    pub kind: ActionKind,
    pub target_author: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionIntent {
    GenerateTldr {
        target: ItemRef,
        author: String,
        text: String,
    },
    GenerateSummary {
        post_id: String,
        title: String,
        threshold: u32,
        comment_count: u32,
    },
    RespondToReply {
        comment: Comment,
        bot_reply_id: String,
    },
    RespondToSummon {
        target: ItemRef,
        author: String,
        text: String,
    },
    BanUser {
        username: String,
        karma: i64,
        reason: String,
    },
}

impl ActionIntent {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionIntent::GenerateTldr { .. } => ActionKind::Tldr,
            ActionIntent::GenerateSummary { threshold, .. } => ActionKind::Summary {
                threshold: *threshold,
            },
            ActionIntent::RespondToReply { .. } => ActionKind::ReplyAck,
            ActionIntent::RespondToSummon { .. } => ActionKind::SummonAck,
            ActionIntent::BanUser { .. } => ActionKind::Ban,
        }
    }

    /// Key under which the completed action is recorded: the fullname of the
    /// post or comment (`t3_…`/`t1_…`), or the username for bans.
    pub fn item_id(&self) -> String {
        match self {
            ActionIntent::GenerateTldr { target, .. }
            | ActionIntent::RespondToSummon { target, .. } => target.fullname(),
            ActionIntent::GenerateSummary { post_id, .. } => format!("t3_{post_id}"),
            ActionIntent::RespondToReply { comment, .. } => comment.fullname(),
            ActionIntent::BanUser { username, .. } => username.clone(),
        }
    }

    /// Fullname of the thing a reply is posted under; `None` for bans.
    pub fn reply_parent(&self) -> Option<String> {
        match self {
            ActionIntent::GenerateTldr { target, .. }
            | ActionIntent::RespondToSummon { target, .. } => Some(target.fullname()),
            ActionIntent::GenerateSummary { post_id, .. } => Some(format!("t3_{post_id}")),
            ActionIntent::RespondToReply { comment, .. } => Some(comment.fullname()),
            ActionIntent::BanUser { .. } => None,
        }
    }

    pub fn target_author(&self) -> Option<&str> {
        match self {
            ActionIntent::GenerateTldr { author, .. }
            | ActionIntent::RespondToSummon { author, .. } => Some(author),
            ActionIntent::RespondToReply { comment, .. } => Some(&comment.author),
            ActionIntent::BanUser { username, .. } => Some(username),
            ActionIntent::GenerateSummary { .. } => None,
        }
    }

    pub fn generation_kind(&self) -> Option<GenerationKind> {
        self.kind().generation_kind()
    }
}

impl fmt::Display for ActionIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind(), self.item_id())
    }
}

/// One evaluable snapshot taken during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Post(Post),
    Comment(Comment),
    Thread(DiscussionThread),
    Reputation(UserReputationFlag),
}

/// Completed actions and known bot replies, loaded from the store once per run.
#[derive(Debug, Clone, Default)]
pub struct History {
    completed: HashSet<(String, ActionKind)>,
    bot_replies: HashSet<String>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, item_id: impl Into<String>, kind: ActionKind) {
        self.completed.insert((item_id.into(), kind));
    }

    pub fn add_bot_reply(&mut self, reply_id: impl Into<String>) {
        self.bot_replies.insert(reply_id.into());
    }

    pub fn is_completed(&self, item_id: &str, kind: ActionKind) -> bool {
        self.completed.contains(&(item_id.to_string(), kind))
    }

    pub fn is_bot_reply(&self, comment_id: &str) -> bool {
        self.bot_replies.contains(comment_id)
    }

    /// Milestones summarized for the post with fullname `post_fullname`.
    pub fn summarized_thresholds(&self, post_fullname: &str) -> BTreeSet<u32> {
        self.completed
            .iter()
            .filter(|(item_id, _)| item_id == post_fullname)
            .filter_map(|(_, kind)| match kind {
                ActionKind::Summary { threshold } => Some(*threshold),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_keys() {
        assert_eq!(ActionKind::Tldr.to_string(), "tldr_posted");
        assert_eq!(
            ActionKind::Summary { threshold: 50 }.to_string(),
            "summary_50"
        );
        assert_eq!(
            "summary_100".parse::<ActionKind>().unwrap(),
            ActionKind::Summary { threshold: 100 }
        );
        assert_eq!("ban".parse::<ActionKind>().unwrap(), ActionKind::Ban);
        assert!("summary_x".parse::<ActionKind>().is_err());
        assert!("tldr".parse::<ActionKind>().is_err());
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("  one two\n\nthree\tfour "), 4);
    }

    #[test]
    fn test_history_summarized_thresholds() {
        let mut history = History::new();
        history.record("abc", ActionKind::Summary { threshold: 20 });
        history.record("abc", ActionKind::Tldr);
        history.record("abc", ActionKind::Summary { threshold: 100 });
        history.record("other", ActionKind::Summary { threshold: 50 });

        let thresholds: Vec<u32> = history.summarized_thresholds("abc").into_iter().collect();
        assert_eq!(thresholds, vec![20, 100]);
        assert!(history.is_completed("abc", ActionKind::Tldr));
        assert!(!history.is_completed("abc", ActionKind::ReplyAck));
    }

    #[test]
    fn test_intent_keys_and_parents() {
        let intent = ActionIntent::BanUser {
            username: "troll".to_string(),
            karma: -95,
            reason: "karma".to_string(),
        };
        assert_eq!(intent.kind(), ActionKind::Ban);
        assert_eq!(intent.item_id(), "troll");
        assert_eq!(intent.reply_parent(), None);
        assert_eq!(intent.generation_kind(), None);

        let intent = ActionIntent::GenerateSummary {
            post_id: "p1".to_string(),
            title: "Thread".to_string(),
            threshold: 50,
            comment_count: 61,
        };
        assert_eq!(intent.reply_parent().as_deref(), Some("t3_p1"));
        assert_eq!(intent.item_id(), "t3_p1");
        assert_eq!(intent.to_string(), "summary_50(t3_p1)");
    }

    #[test]
    fn test_post_and_comment_keys_do_not_collide() {
        let on_post = ActionIntent::GenerateTldr {
            target: ItemRef::Post("abc".to_string()),
            author: "alice".to_string(),
            text: "long".to_string(),
        };
        let on_comment = ActionIntent::GenerateTldr {
            target: ItemRef::Comment("abc".to_string()),
            author: "alice".to_string(),
            text: "long".to_string(),
        };
        assert_eq!(on_post.item_id(), "t3_abc");
        assert_eq!(on_comment.item_id(), "t1_abc");

        let mut history = History::new();
        history.record(on_post.item_id(), on_post.kind());
        assert!(!history.is_completed(&on_comment.item_id(), on_comment.kind()));
    }

    #[test]
    fn test_action_kind_serializes_as_key() {
        let json = serde_json::to_string(&ActionKind::Summary { threshold: 20 }).unwrap();
        assert_eq!(json, "\"summary_20\"");
        let kind: ActionKind = serde_json::from_str("\"reply_ack\"").unwrap();
        assert_eq!(kind, ActionKind::ReplyAck);
    }
}
