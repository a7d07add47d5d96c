//! Eligibility rules.
//!
//! Everything here is a pure function of one item snapshot, the completed
//! history and the current time. Caps, cooldowns and claims are applied later
//! by the orchestrator and dispatcher.

use chrono::{DateTime, Duration, Utc};
use modbot_core::{
    ActionIntent, ActionKind, BotConfig, Comment, ConfigError, DiscussionThread, History, Item,
    PatternSet, Post, UserReputationFlag,
};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

pub struct Evaluator {
    bot_username: String,
    tldr_word_threshold: usize,
    comment_word_threshold: usize,
    milestones: Vec<u32>,
    negative_karma_threshold: i64,
    ban_reason: String,
    max_age: Duration,
    summon: PatternSet,
    hostile: PatternSet,
    bots: PatternSet,
    moderators: HashSet<String>,
}

impl Evaluator {
    pub fn from_config(config: &BotConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            bot_username: config.bot_username.clone(),
            tldr_word_threshold: config.tldr_word_threshold,
            comment_word_threshold: config.comment_word_threshold,
            milestones: config.sorted_milestones(),
            negative_karma_threshold: config.negative_karma_threshold,
            ban_reason: config.ban_reason.clone(),
            max_age: Duration::hours(config.max_age_hours),
            summon: config.summon_matcher()?,
            hostile: config.hostile_matcher()?,
            bots: config.bot_matcher()?,
            moderators: HashSet::new(),
        })
    }

    /// Moderators are never banned.
    pub fn with_moderators<I, S>(mut self, moderators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.moderators = moderators
            .into_iter()
            .map(|name| name.as_ref().to_lowercase())
            .collect();
        self
    }

    pub fn evaluate(&self, item: &Item, history: &History, now: DateTime<Utc>) -> Vec<ActionIntent> {
        let intents = match item {
            Item::Post(post) => self.evaluate_post(post, history, now),
            Item::Comment(comment) => self.evaluate_comment(comment, history, now),
            Item::Thread(thread) => self.evaluate_thread(thread, now),
            Item::Reputation(flag) => self.evaluate_flag(flag, history),
        };
        for intent in &intents {
            debug!("Eligible: {}", intent);
        }
        intents
    }

    fn is_self(&self, author: &str) -> bool {
        author.eq_ignore_ascii_case(&self.bot_username)
    }

    fn is_recent(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - created_at <= self.max_age
    }

    /// Whether the bot may talk to `author` about `text` at all.
    fn may_converse(&self, author: &str, text: &str) -> bool {
        if self.bots.is_match(author) {
            debug!("Not conversing with bot-like author {}", author);
            return false;
        }
        if self.hostile.is_match(text) {
            debug!("Not answering hostile text from {}", author);
            return false;
        }
        true
    }

    fn evaluate_post(&self, post: &Post, history: &History, now: DateTime<Utc>) -> Vec<ActionIntent> {
        if self.is_self(&post.author) || !self.is_recent(post.created_at, now) {
            return Vec::new();
        }

        let mut intents = Vec::new();
        let key = post.fullname();
        let text = post.full_text();

        if post.word_count >= self.tldr_word_threshold
            && !history.is_completed(&key, ActionKind::Tldr)
        {
            intents.push(ActionIntent::GenerateTldr {
                target: post.item_ref(),
                author: post.author.clone(),
                text: text.clone(),
            });
        }

        if self.summon.is_match(&text)
            && !history.is_completed(&key, ActionKind::SummonAck)
            && self.may_converse(&post.author, &text)
        {
            intents.push(ActionIntent::RespondToSummon {
                target: post.item_ref(),
                author: post.author.clone(),
                text,
            });
        }

        intents
    }

    fn evaluate_comment(
        &self,
        comment: &Comment,
        history: &History,
        now: DateTime<Utc>,
    ) -> Vec<ActionIntent> {
        if self.is_self(&comment.author) || !self.is_recent(comment.created_at, now) {
            return Vec::new();
        }

        let mut intents = Vec::new();
        let key = comment.fullname();

        if comment.word_count >= self.comment_word_threshold
            && !history.is_completed(&key, ActionKind::Tldr)
        {
            intents.push(ActionIntent::GenerateTldr {
                target: comment.item_ref(),
                author: comment.author.clone(),
                text: comment.body.clone(),
            });
        }

        let conversational = self.may_converse(&comment.author, &comment.body);

        if let Some(parent) = &comment.parent_comment_id {
            if history.is_bot_reply(parent)
                && !history.is_completed(&key, ActionKind::ReplyAck)
                && conversational
            {
                intents.push(ActionIntent::RespondToReply {
                    comment: comment.clone(),
                    bot_reply_id: parent.clone(),
                });
            }
        }

        if self.summon.is_match(&comment.body)
            && !history.is_completed(&key, ActionKind::SummonAck)
            && conversational
        {
            intents.push(ActionIntent::RespondToSummon {
                target: comment.item_ref(),
                author: comment.author.clone(),
                text: comment.body.clone(),
            });
        }

        intents
    }

    fn evaluate_thread(&self, thread: &DiscussionThread, now: DateTime<Utc>) -> Vec<ActionIntent> {
        if !self.is_recent(thread.created_at, now) {
            return Vec::new();
        }

        milestone_to_summarize(&self.milestones, thread.comment_count, &thread.summarized)
            .map(|threshold| ActionIntent::GenerateSummary {
                post_id: thread.post_id.clone(),
                title: thread.title.clone(),
                threshold,
                comment_count: thread.comment_count,
            })
            .into_iter()
            .collect()
    }

    fn evaluate_flag(&self, flag: &UserReputationFlag, history: &History) -> Vec<ActionIntent> {
        if flag.karma >= self.negative_karma_threshold {
            return Vec::new();
        }
        if self.is_self(&flag.username) || self.moderators.contains(&flag.username.to_lowercase()) {
            debug!("Not banning protected user {}", flag.username);
            return Vec::new();
        }
        if history.is_completed(&flag.username, ActionKind::Ban) {
            return Vec::new();
        }

        vec![ActionIntent::BanUser {
            username: flag.username.clone(),
            karma: flag.karma,
            reason: self.ban_reason.clone(),
        }]
    }
}

/// The highest threshold reached by `comment_count`, unless it or any higher
/// threshold was already summarized. `thresholds` must be sorted ascending.
pub fn milestone_to_summarize(
    thresholds: &[u32],
    comment_count: u32,
    summarized: &BTreeSet<u32>,
) -> Option<u32> {
    let reached = thresholds
        .iter()
        .copied()
        .take_while(|threshold| *threshold <= comment_count)
        .last()?;

    if summarized.range(reached..).next().is_some() {
        return None;
    }
    Some(reached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use modbot_core::{word_count, ItemRef};

    fn evaluator() -> Evaluator {
        Evaluator::from_config(&BotConfig::default()).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn post(id: &str, words: usize, comments: u32) -> Post {
        let body = vec!["word"; words].join(" ");
        Post {
            id: id.to_string(),
            author: "alice".to_string(),
            title: "A long read".to_string(),
            word_count: word_count(&body),
            body,
            created_at: now() - Duration::hours(1),
            num_comments: comments,
        }
    }

    fn comment(id: &str, parent: Option<&str>, author: &str, body: &str) -> Comment {
        Comment {
            id: id.to_string(),
            post_id: "p1".to_string(),
            parent_comment_id: parent.map(str::to_string),
            author: author.to_string(),
            body: body.to_string(),
            word_count: word_count(body),
            created_at: now() - Duration::minutes(5),
            depth: if parent.is_some() { 1 } else { 0 },
            post_title: Some("Thread".to_string()),
        }
    }

    fn thread(count: u32, summarized: &[u32]) -> DiscussionThread {
        DiscussionThread {
            post_id: "p1".to_string(),
            title: "Busy thread".to_string(),
            comment_count: count,
            created_at: now() - Duration::hours(2),
            summarized: summarized.iter().copied().collect(),
        }
    }

    fn flag(username: &str, karma: i64) -> UserReputationFlag {
        UserReputationFlag {
            username: username.to_string(),
            karma,
            flagged_at: now(),
            source: "AutoModerator: karma".to_string(),
            outcome: None,
        }
    }

    #[test]
    fn test_long_post_gets_one_tldr() {
        let evaluator = evaluator();
        let mut history = History::new();
        let item = Item::Post(post("p1", 300, 0));

        let intents = evaluator.evaluate(&item, &history, now());
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].kind(), ActionKind::Tldr);
        assert_eq!(intents[0].reply_parent().as_deref(), Some("t3_p1"));

        history.record("t3_p1", ActionKind::Tldr);
        assert!(evaluator.evaluate(&item, &history, now()).is_empty());
    }

    #[test]
    fn test_tldr_threshold_boundary() {
        let evaluator = evaluator();
        let history = History::new();

        assert!(evaluator
            .evaluate(&Item::Post(post("p1", 269, 0)), &history, now())
            .is_empty());
        assert_eq!(
            evaluator
                .evaluate(&Item::Post(post("p1", 270, 0)), &history, now())
                .len(),
            1
        );
    }

    #[test]
    fn test_long_comment_tldr() {
        let evaluator = evaluator();
        let body = vec!["token"; 300].join(" ");
        let item = Item::Comment(comment("c1", None, "bob", &body));

        let intents = evaluator.evaluate(&item, &History::new(), now());
        assert!(matches!(
            &intents[..],
            [ActionIntent::GenerateTldr { target: ItemRef::Comment(id), .. }] if id == "c1"
        ));
    }

    #[test]
    fn test_old_items_are_ignored() {
        let evaluator = evaluator();
        let mut old = post("p1", 500, 150);
        old.created_at = now() - Duration::hours(25);

        assert!(evaluator
            .evaluate(&Item::Post(old.clone()), &History::new(), now())
            .is_empty());
        let old_thread = DiscussionThread::from_post(&old, &History::new());
        assert!(evaluator
            .evaluate(&Item::Thread(old_thread), &History::new(), now())
            .is_empty());
    }

    #[test]
    fn test_own_posts_are_ignored() {
        let evaluator = evaluator();
        let mut own = post("p1", 500, 0);
        own.author = "optimist_prime".to_string();
        assert!(evaluator
            .evaluate(&Item::Post(own), &History::new(), now())
            .is_empty());
    }

    #[test]
    fn test_milestone_rule() {
        let thresholds = [20, 50, 100];
        let none = BTreeSet::new();

        assert_eq!(milestone_to_summarize(&thresholds, 15, &none), None);
        assert_eq!(milestone_to_summarize(&thresholds, 20, &none), Some(20));
        assert_eq!(milestone_to_summarize(&thresholds, 120, &none), Some(100));

        let done_100: BTreeSet<u32> = [100].into_iter().collect();
        assert_eq!(milestone_to_summarize(&thresholds, 120, &done_100), None);

        // A higher summarized threshold covers lower ones when the count drops.
        assert_eq!(milestone_to_summarize(&thresholds, 60, &done_100), None);

        let done_20: BTreeSet<u32> = [20].into_iter().collect();
        assert_eq!(milestone_to_summarize(&thresholds, 55, &done_20), Some(50));
    }

    #[test]
    fn test_thread_jump_yields_single_summary() {
        let evaluator = evaluator();
        let intents = evaluator.evaluate(&Item::Thread(thread(120, &[])), &History::new(), now());

        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].kind(), ActionKind::Summary { threshold: 100 });

        let later = evaluator.evaluate(&Item::Thread(thread(120, &[100])), &History::new(), now());
        assert!(later.is_empty());
    }

    #[test]
    fn test_reply_to_bot_reply() {
        let evaluator = evaluator();
        let mut history = History::new();
        history.add_bot_reply("bot1");
        let item = Item::Comment(comment("c2", Some("bot1"), "carol", "Why do you think so?"));

        let intents = evaluator.evaluate(&item, &history, now());
        assert!(matches!(
            &intents[..],
            [ActionIntent::RespondToReply { bot_reply_id, .. }] if bot_reply_id == "bot1"
        ));

        history.record("t1_c2", ActionKind::ReplyAck);
        assert!(evaluator.evaluate(&item, &history, now()).is_empty());

        let unrelated = Item::Comment(comment("c3", Some("other"), "carol", "Why?"));
        assert!(evaluator.evaluate(&unrelated, &history, now()).is_empty());
    }

    #[test]
    fn test_summon_phrases_and_patterns() {
        let evaluator = evaluator();
        let history = History::new();

        for body in [
            "Hey Bot, what do you make of this?",
            "hey   bot thoughts?",
            "paging u/Optimist_Prime here",
            "can the modbot weigh in",
        ] {
            let item = Item::Comment(comment("c1", None, "dave", body));
            let intents = evaluator.evaluate(&item, &history, now());
            assert_eq!(intents.len(), 1, "expected a summon for {body:?}");
            assert_eq!(intents[0].kind(), ActionKind::SummonAck);
        }

        let item = Item::Comment(comment("c1", None, "dave", "they bot the stock"));
        assert!(evaluator.evaluate(&item, &history, now()).is_empty());
    }

    #[test]
    fn test_reply_and_summon_on_same_comment() {
        let evaluator = evaluator();
        let mut history = History::new();
        history.add_bot_reply("bot1");
        let item = Item::Comment(comment("c2", Some("bot1"), "erin", "hey bot, follow up?"));

        let kinds: Vec<_> = evaluator
            .evaluate(&item, &history, now())
            .iter()
            .map(ActionIntent::kind)
            .collect();
        assert_eq!(kinds, vec![ActionKind::ReplyAck, ActionKind::SummonAck]);
    }

    #[test]
    fn test_bots_and_hostile_text_are_not_answered() {
        let evaluator = evaluator();
        let mut history = History::new();
        history.add_bot_reply("bot1");

        let automod = Item::Comment(comment("c1", Some("bot1"), "AutoModerator", "hey bot"));
        assert!(evaluator.evaluate(&automod, &history, now()).is_empty());

        let helper = Item::Comment(comment("c2", None, "summarizer_bot", "hey bot"));
        assert!(evaluator.evaluate(&helper, &history, now()).is_empty());

        let hostile = Item::Comment(comment("c3", Some("bot1"), "frank", "shut up, stupid bot"));
        assert!(evaluator.evaluate(&hostile, &history, now()).is_empty());
    }

    #[test]
    fn test_ban_rule() {
        let evaluator = evaluator().with_moderators(["ModOne"]);
        let mut history = History::new();

        let intents = evaluator.evaluate(&Item::Reputation(flag("troll", -95)), &history, now());
        assert!(matches!(
            &intents[..],
            [ActionIntent::BanUser { username, karma: -95, .. }] if username == "troll"
        ));

        assert!(evaluator
            .evaluate(&Item::Reputation(flag("meh", -80)), &history, now())
            .is_empty());
        assert!(evaluator
            .evaluate(&Item::Reputation(flag("modone", -200)), &history, now())
            .is_empty());

        history.record("troll", ActionKind::Ban);
        assert!(evaluator
            .evaluate(&Item::Reputation(flag("troll", -95)), &history, now())
            .is_empty());
    }

    #[test]
    fn test_post_record_does_not_cover_comment_with_same_id() {
        let evaluator = evaluator();
        let mut history = History::new();
        history.record("t3_abc", ActionKind::Tldr);

        let body = vec!["token"; 320].join(" ");
        let item = Item::Comment(comment("abc", None, "bob", &body));
        let intents = evaluator.evaluate(&item, &history, now());
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].item_id(), "t1_abc");

        assert!(evaluator
            .evaluate(&Item::Post(post("abc", 300, 0)), &history, now())
            .is_empty());
    }
}
