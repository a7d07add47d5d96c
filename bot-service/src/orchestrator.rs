use crate::dispatcher::{DispatchOutcome, DispatchPlan, Dispatcher};
use crate::evaluator::Evaluator;
use crate::notifier::Notifier;
use crate::summary::{FailureStage, RunSummary};
use chrono::{DateTime, Duration, Utc};
use database::Database;
use llm_interface::ContentGenerator;
use modbot_core::{
    ActionIntent, ActionKind, BanOutcome, BotConfig, CoreError, DiscussionThread, ErrorReporter,
    History, Item, Platform, UserReputationFlag,
};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MODERATORS_KEY: &str = "moderators";
const MODERATORS_REFRESHED_KEY: &str = "moderators_refreshed_at";

/// Which shared cap an action counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapClass {
    LongForm,
    Conversation,
}

impl CapClass {
    fn of(kind: ActionKind) -> Option<Self> {
        match kind {
            ActionKind::Tldr | ActionKind::Summary { .. } => Some(CapClass::LongForm),
            ActionKind::ReplyAck | ActionKind::SummonAck => Some(CapClass::Conversation),
            ActionKind::Ban => None,
        }
    }
}

#[derive(Debug, Default)]
struct CapUsage {
    long_form_run: u32,
    long_form_day: u32,
    conversation_run: u32,
    conversation_day: u32,
}

/// Runs one fetch-evaluate-dispatch pass over the subreddit.
pub struct Orchestrator<P, G, N> {
    config: BotConfig,
    platform: P,
    generator: G,
    notifier: N,
    store: Database,
    dry_run: bool,
    reporter: ErrorReporter,
}

impl<P, G, N> Orchestrator<P, G, N>
where
    P: Platform,
    G: ContentGenerator,
    N: Notifier,
{
    /// `store` must already be connected and migrated.
    pub fn new(config: BotConfig, platform: P, generator: G, notifier: N, store: Database) -> Self {
        Self {
            config,
            platform,
            generator,
            notifier,
            store,
            dry_run: false,
            reporter: ErrorReporter::new(),
        }
    }

    /// Evaluate and log intents without generating or dispatching anything.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn store(&self) -> &Database {
        &self.store
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub async fn run_once(&self) -> Result<RunSummary, CoreError> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let mut summary = RunSummary::new(&run_id, &self.config.subreddit, self.dry_run);
        info!(
            run_id = %run_id,
            dry_run = self.dry_run,
            "Starting run on r/{}",
            self.config.subreddit
        );

        let moderators = self.moderators(&mut summary).await;
        let evaluator = match &moderators {
            Some(moderators) => Evaluator::from_config(&self.config)?.with_moderators(moderators),
            None => Evaluator::from_config(&self.config)?,
        };

        let posts = match self.platform.fetch_posts(self.config.fetch_limit).await {
            Ok(posts) => posts,
            Err(e) => {
                self.fetch_failed(&mut summary, "fetch_posts", &e);
                Vec::new()
            }
        };
        let comments = match self.platform.fetch_comments(self.config.fetch_limit).await {
            Ok(comments) => comments,
            Err(e) => {
                self.fetch_failed(&mut summary, "fetch_comments", &e);
                Vec::new()
            }
        };
        // Without a moderator list a ban could hit a moderator.
        let flags = if moderators.is_some() {
            match self.platform.fetch_reputation_flags().await {
                Ok(flags) => flags,
                Err(e) => {
                    self.fetch_failed(&mut summary, "fetch_reputation_flags", &e);
                    Vec::new()
                }
            }
        } else {
            warn!("Moderator list unavailable; skipping reputation flags this run");
            Vec::new()
        };

        let history = match self.store.load_history().await {
            Ok(history) => history,
            Err(e) => {
                // Nothing is dispatched without history.
                self.reporter.report_error(&e);
                summary.record_failure(FailureStage::Store, "load_history", &e);
                summary.finish();
                self.notify(&summary).await;
                return Err(e);
            }
        };
        debug!(
            "Fetched {} posts, {} comments, {} flags; {} completed actions on record",
            posts.len(),
            comments.len(),
            flags.len(),
            history.len()
        );

        let mut items = Vec::with_capacity(posts.len() * 2 + comments.len() + flags.len());
        for post in posts {
            items.push(Item::Thread(DiscussionThread::from_post(&post, &history)));
            items.push(Item::Post(post));
        }
        items.extend(comments.into_iter().map(Item::Comment));
        items.extend(flags.iter().cloned().map(Item::Reputation));

        let now = Utc::now();
        let intents: Vec<ActionIntent> = items
            .iter()
            .flat_map(|item| evaluator.evaluate(item, &history, now))
            .collect();
        let plans = build_plans(intents);
        summary.planned = plans.iter().map(|plan| plan.len() as u32).sum();
        info!("{} intents in {} dispatch plans", summary.planned, plans.len());

        let bans = self.execute(&plans, &history, &mut summary, started).await;
        summary.reputation = reputation_outcomes(flags, &plans, &bans);

        summary.finish();
        if !self.dry_run {
            self.persist(&mut summary).await;
        }

        self.notify(&summary).await;

        info!("{}", summary);
        Ok(summary)
    }

    async fn notify(&self, summary: &RunSummary) {
        if !summary.has_errors() {
            return;
        }
        if let Err(e) = self.notifier.notify(summary).await {
            warn!("Failed to send run notification: {}", e);
        }
    }

    /// Returns the outcome of every ban plan that reached the dispatcher.
    async fn execute(
        &self,
        plans: &[DispatchPlan],
        history: &History,
        summary: &mut RunSummary,
        started: Instant,
    ) -> HashMap<String, BanOutcome> {
        let mut bans = HashMap::new();
        let dispatcher = Dispatcher::new(
            &self.platform,
            &self.store,
            Duration::seconds(self.config.claim_ttl_secs),
        );
        let mut usage = match self.daily_usage(Utc::now()).await {
            Ok(usage) => usage,
            Err(e) => {
                // Unknown daily usage counts as a full day.
                self.reporter.report_error(&e);
                summary.record_failure(FailureStage::Store, "daily_usage", &e);
                CapUsage {
                    long_form_day: self.config.max_tldr_per_day,
                    conversation_day: self.config.max_replies_per_day,
                    ..CapUsage::default()
                }
            }
        };

        for (index, plan) in plans.iter().enumerate() {
            let Some(primary) = plan.primary() else {
                continue;
            };

            if started.elapsed() >= self.config.run_budget() {
                let remaining: u32 = plans[index..].iter().map(|p| p.len() as u32).sum();
                warn!("Run budget spent; deferring {} intents", remaining);
                summary.deferred += remaining;
                break;
            }

            let class = CapClass::of(primary.kind());
            if !self.within_caps(class, &usage) {
                debug!("Deferring {}: cap reached", plan);
                summary.deferred += plan.len() as u32;
                continue;
            }

            if class == Some(CapClass::Conversation) {
                match self.cooling_down(primary).await {
                    Ok(false) => {}
                    Ok(true) => {
                        debug!("Deferring {}: author cooling down", plan);
                        summary.deferred += plan.len() as u32;
                        continue;
                    }
                    Err(e) => {
                        self.reporter.report_warning(&e);
                        summary.deferred += plan.len() as u32;
                        continue;
                    }
                }
            }

            if self.dry_run {
                info!("Dry run: would dispatch {}", plan);
                count_usage(class, &mut usage);
                continue;
            }

            let text = match primary.generation_kind() {
                Some(kind) => {
                    let context = match self.build_context(primary, history).await {
                        Ok(context) => context,
                        Err(e) => {
                            self.reporter.report_warning(&e);
                            summary.record_failure(FailureStage::Fetch, plan.to_string(), &e);
                            continue;
                        }
                    };
                    match self.generator.generate(kind, &context).await {
                        Ok(generation) => {
                            summary.tokens_used += generation.total_tokens();
                            Some(generation.text)
                        }
                        Err(e) => {
                            self.reporter.report_error(&e);
                            summary.record_failure(FailureStage::Generation, plan.to_string(), &e);
                            continue;
                        }
                    }
                }
                None => None,
            };

            let outcome = dispatcher
                .dispatch(plan, text.as_deref(), &summary.run_id, Utc::now())
                .await;
            match outcome {
                Ok(DispatchOutcome::Completed(records)) => {
                    let done = records.len() as u32;
                    summary.completed += done;
                    summary.skipped += plan.len() as u32 - done;
                    count_usage(class, &mut usage);
                    record_ban(primary, BanOutcome::Banned, &mut bans);
                }
                Ok(DispatchOutcome::Skipped) => {
                    summary.skipped += plan.len() as u32;
                    record_ban(primary, BanOutcome::Skipped, &mut bans);
                }
                Err(e) => {
                    self.reporter.report_error(&e);
                    summary.record_failure(FailureStage::Dispatch, plan.to_string(), &e);
                    record_ban(primary, BanOutcome::Failed, &mut bans);
                }
            }
        }
        bans
    }

    /// Moderators from the settings cache, refreshed from the platform when stale.
    /// `None` when no list could be obtained.
    async fn moderators(&self, summary: &mut RunSummary) -> Option<Vec<String>> {
        let cached = self.cached_moderators().await;
        let max_age = Duration::days(self.config.moderator_cache_days);
        if let Some((list, refreshed_at)) = &cached {
            if Utc::now() - *refreshed_at < max_age {
                debug!("Using {} cached moderators", list.len());
                return Some(list.clone());
            }
        }

        match self.platform.fetch_moderators().await {
            Ok(list) => {
                info!("Refreshed moderator list ({} moderators)", list.len());
                if let Err(e) = self.cache_moderators(&list).await {
                    self.reporter.report_warning(&e);
                }
                Some(list)
            }
            Err(e) => {
                self.fetch_failed(summary, "fetch_moderators", &e);
                cached.map(|(list, _)| list)
            }
        }
    }

    async fn cached_moderators(&self) -> Option<(Vec<String>, DateTime<Utc>)> {
        let list = self.store.get_setting(MODERATORS_KEY).await.ok()??;
        let refreshed = self.store.get_setting(MODERATORS_REFRESHED_KEY).await.ok()??;
        let list: Vec<String> = serde_json::from_str(&list).ok()?;
        let refreshed_at = DateTime::parse_from_rfc3339(&refreshed).ok()?.with_timezone(&Utc);
        Some((list, refreshed_at))
    }

    async fn cache_moderators(&self, list: &[String]) -> Result<(), CoreError> {
        self.store
            .save_setting(MODERATORS_KEY, &serde_json::to_string(list)?)
            .await?;
        self.store
            .save_setting(MODERATORS_REFRESHED_KEY, &Utc::now().to_rfc3339())
            .await
    }

    async fn daily_usage(&self, now: DateTime<Utc>) -> Result<CapUsage, CoreError> {
        let since = now - Duration::hours(24);
        let mut long_form = vec![ActionKind::Tldr];
        long_form.extend(
            self.config
                .sorted_milestones()
                .into_iter()
                .map(|threshold| ActionKind::Summary { threshold }),
        );

        Ok(CapUsage {
            long_form_day: self.store.count_completed_since(&long_form, since).await?,
            conversation_day: self
                .store
                .count_completed_since(&[ActionKind::ReplyAck, ActionKind::SummonAck], since)
                .await?,
            ..CapUsage::default()
        })
    }

    fn within_caps(&self, class: Option<CapClass>, usage: &CapUsage) -> bool {
        match class {
            Some(CapClass::LongForm) => {
                usage.long_form_run < self.config.max_tldr_per_run
                    && usage.long_form_day < self.config.max_tldr_per_day
            }
            Some(CapClass::Conversation) => {
                usage.conversation_run < self.config.max_replies_per_run
                    && usage.conversation_day < self.config.max_replies_per_day
            }
            None => true,
        }
    }

    async fn cooling_down(&self, intent: &ActionIntent) -> Result<bool, CoreError> {
        let Some(author) = intent.target_author() else {
            return Ok(false);
        };
        let since = Utc::now() - Duration::hours(self.config.same_user_cooldown_hours);
        let recent = self.store.count_replies_to_author_since(author, since).await?;
        Ok(recent >= self.config.same_user_replies_before_cooldown)
    }

    async fn build_context(&self, intent: &ActionIntent, history: &History) -> Result<String, CoreError> {
        let context = match intent {
            ActionIntent::GenerateTldr { author, text, .. } => {
                format!("Author: u/{author}\n\n{text}")
            }
            ActionIntent::GenerateSummary {
                post_id,
                title,
                comment_count,
                ..
            } => {
                let comments = self
                    .platform
                    .fetch_thread_comments(post_id, self.config.fetch_limit)
                    .await?;
                let mut context = format!("Thread: {title}\nComments: {comment_count}\n\n");
                for comment in comments.iter().filter(|c| !history.is_bot_reply(&c.id)) {
                    context.push_str(&format!("{}: {}\n", comment.author, comment.body.trim()));
                }
                context
            }
            ActionIntent::RespondToReply {
                comment,
                bot_reply_id,
            } => {
                let mut context = String::new();
                if let Some(title) = &comment.post_title {
                    context.push_str(&format!("Thread: {title}\n\n"));
                }
                if let Some(earlier) = self.store.get_bot_reply(bot_reply_id).await? {
                    context.push_str(&format!("Your earlier comment:\n{}\n\n", earlier.body));
                }
                context.push_str(&format!("u/{} replied:\n{}", comment.author, comment.body));
                context
            }
            ActionIntent::RespondToSummon { author, text, .. } => {
                format!("u/{author} called on you:\n{text}")
            }
            ActionIntent::BanUser { .. } => {
                return Err(CoreError::Internal {
                    message: format!("{intent} needs no generated text"),
                })
            }
        };
        Ok(context)
    }

    async fn persist(&self, summary: &mut RunSummary) {
        if let Err(e) = self.store.save_run(&summary.to_run_record()).await {
            self.reporter.report_error(&e);
            summary.record_failure(FailureStage::Store, "save_run", &e);
        }

        let cutoff = Utc::now() - Duration::days(self.config.record_retention_days);
        if let Err(e) = self.store.prune_before(cutoff).await {
            self.reporter.report_warning(&e);
            summary.record_failure(FailureStage::Store, "prune_before", &e);
        }
    }

    fn fetch_failed(&self, summary: &mut RunSummary, operation: &str, error: &CoreError) {
        self.reporter.report_error(error);
        summary.record_failure(FailureStage::Fetch, operation, error);
    }
}

/// One posted reply counts once, however many keys it completed.
fn count_usage(class: Option<CapClass>, usage: &mut CapUsage) {
    match class {
        Some(CapClass::LongForm) => {
            usage.long_form_run += 1;
            usage.long_form_day += 1;
        }
        Some(CapClass::Conversation) => {
            usage.conversation_run += 1;
            usage.conversation_day += 1;
        }
        None => {}
    }
}

fn record_ban(intent: &ActionIntent, outcome: BanOutcome, bans: &mut HashMap<String, BanOutcome>) {
    if let ActionIntent::BanUser { username, .. } = intent {
        bans.insert(username.clone(), outcome);
    }
}

/// Attaches ban decisions to the fetched flags. A flag that produced no ban
/// intent was skipped; a ban intent that was deferred or dry-run stays
/// undecided.
fn reputation_outcomes(
    flags: Vec<UserReputationFlag>,
    plans: &[DispatchPlan],
    bans: &HashMap<String, BanOutcome>,
) -> Vec<UserReputationFlag> {
    let intended: HashSet<&str> = plans
        .iter()
        .filter_map(|plan| match plan.primary() {
            Some(ActionIntent::BanUser { username, .. }) => Some(username.as_str()),
            _ => None,
        })
        .collect();

    flags
        .into_iter()
        .map(|mut flag| {
            flag.outcome = if intended.contains(flag.username.as_str()) {
                bans.get(&flag.username).copied()
            } else {
                Some(BanOutcome::Skipped)
            };
            flag
        })
        .collect()
}

/// Drops duplicate intents and merges conversational intents on the same
/// comment into one plan, so a single reply answers both.
pub fn build_plans(intents: Vec<ActionIntent>) -> Vec<DispatchPlan> {
    let mut seen = HashSet::new();
    let mut conversation_index: HashMap<String, usize> = HashMap::new();
    let mut plans: Vec<DispatchPlan> = Vec::new();

    for intent in intents {
        let item_id = intent.item_id();
        if !seen.insert((item_id.clone(), intent.kind())) {
            continue;
        }
        if intent.kind().is_conversational() {
            if let Some(&index) = conversation_index.get(&item_id) {
                plans[index].intents.push(intent);
                continue;
            }
            conversation_index.insert(item_id, plans.len());
        }
        plans.push(DispatchPlan::single(intent));
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use modbot_core::{Comment, ItemRef};

    fn comment(id: &str) -> Comment {
        Comment {
            id: id.to_string(),
            post_id: "p1".to_string(),
            parent_comment_id: Some("bot1".to_string()),
            author: "erin".to_string(),
            body: "hey bot, follow up?".to_string(),
            word_count: 4,
            created_at: Utc::now(),
            depth: 1,
            post_title: None,
        }
    }

    fn summon(id: &str) -> ActionIntent {
        ActionIntent::RespondToSummon {
            target: ItemRef::Comment(id.to_string()),
            author: "erin".to_string(),
            text: "hey bot, follow up?".to_string(),
        }
    }

    #[test]
    fn test_conversational_intents_are_coalesced() {
        let plans = build_plans(vec![
            ActionIntent::RespondToReply {
                comment: comment("c1"),
                bot_reply_id: "bot1".to_string(),
            },
            ActionIntent::GenerateTldr {
                target: ItemRef::Post("p1".to_string()),
                author: "alice".to_string(),
                text: "long".to_string(),
            },
            summon("c1"),
            summon("c2"),
        ]);

        assert_eq!(plans.len(), 3);
        let kinds: Vec<_> = plans[0].intents.iter().map(ActionIntent::kind).collect();
        assert_eq!(kinds, vec![ActionKind::ReplyAck, ActionKind::SummonAck]);
        assert_eq!(plans[1].primary().map(ActionIntent::kind), Some(ActionKind::Tldr));
        assert_eq!(
            plans[2].primary().map(ActionIntent::item_id).as_deref(),
            Some("t1_c2")
        );
    }

    #[test]
    fn test_duplicate_intents_are_dropped() {
        let plans = build_plans(vec![summon("c1"), summon("c1")]);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].len(), 1);
    }

    fn flag(username: &str, karma: i64) -> UserReputationFlag {
        UserReputationFlag {
            username: username.to_string(),
            karma,
            flagged_at: Utc::now(),
            source: "AutoModerator: karma".to_string(),
            outcome: None,
        }
    }

    fn ban(username: &str) -> ActionIntent {
        ActionIntent::BanUser {
            username: username.to_string(),
            karma: -80,
            reason: "negative karma".to_string(),
        }
    }

    #[test]
    fn test_reputation_outcomes() {
        let plans = build_plans(vec![ban("troll"), ban("spammer"), ban("later")]);
        let bans: HashMap<String, BanOutcome> = [
            ("troll".to_string(), BanOutcome::Banned),
            ("spammer".to_string(), BanOutcome::Failed),
        ]
        .into_iter()
        .collect();

        let flags = vec![
            flag("troll", -80),
            flag("spammer", -90),
            flag("later", -70),
            flag("mildly", -5),
        ];
        let outcomes: Vec<_> = reputation_outcomes(flags, &plans, &bans)
            .into_iter()
            .map(|flag| (flag.username, flag.outcome))
            .collect();

        assert_eq!(
            outcomes,
            vec![
                ("troll".to_string(), Some(BanOutcome::Banned)),
                ("spammer".to_string(), Some(BanOutcome::Failed)),
                ("later".to_string(), None),
                ("mildly".to_string(), Some(BanOutcome::Skipped)),
            ]
        );
    }

    #[test]
    fn test_cap_classes() {
        assert_eq!(CapClass::of(ActionKind::Tldr), Some(CapClass::LongForm));
        assert_eq!(
            CapClass::of(ActionKind::Summary { threshold: 50 }),
            Some(CapClass::LongForm)
        );
        assert_eq!(CapClass::of(ActionKind::SummonAck), Some(CapClass::Conversation));
        assert_eq!(CapClass::of(ActionKind::Ban), None);
    }
}
