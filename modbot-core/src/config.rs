//! Bot configuration.
//!
//! Loaded once from a TOML file at startup and passed explicitly to the
//! components that need it. Secrets are never read from the file; they come
//! from the environment.

use crate::ConfigError;
use regex::{Regex, RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

pub const REDDIT_CLIENT_ID_VAR: &str = "REDDIT_CLIENT_ID";
pub const REDDIT_CLIENT_SECRET_VAR: &str = "REDDIT_CLIENT_SECRET";
pub const REDDIT_USERNAME_VAR: &str = "REDDIT_USERNAME";
pub const REDDIT_PASSWORD_VAR: &str = "REDDIT_PASSWORD";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub subreddit: String,
    pub bot_username: String,
    pub database_url: String,

    pub tldr_word_threshold: usize,
    pub comment_word_threshold: usize,
    pub milestone_thresholds: Vec<u32>,
    pub negative_karma_threshold: i64,

    pub summon_phrases: Vec<String>,
    pub summon_patterns: Vec<String>,
    pub hostile_patterns: Vec<String>,
    pub bot_indicators: Vec<String>,

    pub max_context_chars: usize,
    pub max_age_hours: i64,
    pub max_tldr_per_run: u32,
    pub max_tldr_per_day: u32,
    pub max_replies_per_run: u32,
    pub max_replies_per_day: u32,
    pub min_reply_words: u32,
    pub max_reply_words: u32,
    pub same_user_cooldown_hours: i64,
    pub same_user_replies_before_cooldown: u32,
    pub moderator_cache_days: i64,

    pub ban_reason: String,
    pub moderation_bot: String,

    /// Informational only; the external scheduler owns the interval.
    pub run_interval_secs: u64,
    pub run_budget_secs: u64,
    pub claim_ttl_secs: i64,
    pub record_retention_days: i64,
    pub fetch_limit: u32,

    pub llm: LlmSettings,
    pub reddit: RedditSettings,
    pub notify: NotifySettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    OpenAi,
    Claude,
}

impl LlmProviderKind {
    pub fn api_key_var(&self) -> &'static str {
        match self {
            LlmProviderKind::OpenAi => "OPENAI_API_KEY",
            LlmProviderKind::Claude => "ANTHROPIC_API_KEY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LlmProviderKind,
    pub model: String,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub max_output_tokens: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::OpenAi,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            timeout_secs: 60,
            max_output_tokens: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedditSettings {
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for RedditSettings {
    fn default() -> Self {
        Self {
            user_agent: format!("modbot/{} (batch moderation bot)", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub webhook_url: Option<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            subreddit: "accelerate".to_string(),
            bot_username: "Optimist_Prime".to_string(),
            database_url: "sqlite://data/modbot.db".to_string(),
            tldr_word_threshold: 270,
            comment_word_threshold: 300,
            milestone_thresholds: vec![20, 50, 100],
            negative_karma_threshold: -80,
            summon_phrases: vec!["hey bot".to_string(), "optimist prime".to_string()],
            summon_patterns: vec![
                r"u/Optimist[\-_]?Prime\b".to_string(),
                r"\b(hey|hi|hello|yo|sup)\s+(optimist\s*prime|bot|mod\s*bot|tldr\s*bot)\b"
                    .to_string(),
                r"\bI('m| am)?\s*(summon|summoning|calling|paging)\s+(the\s+)?(bot|optimist)\b"
                    .to_string(),
                r"\bmod\s*bot\b".to_string(),
            ],
            hostile_patterns: vec![
                r"\b(stupid|dumb|useless|trash|garbage)\s+(bot|ai)\b".to_string(),
                r"\bfuck\s*(off|you|this)\b".to_string(),
                r"\bshut\s*(up|the\s*fuck)\b".to_string(),
                r"\bkill\s+yourself\b".to_string(),
                r"\bgo\s+away\b".to_string(),
                r"\bnobody\s+(asked|cares)\b".to_string(),
            ],
            bot_indicators: vec![
                r"bot$".to_string(),
                r"auto[\-_]?mod".to_string(),
                r"^AutoModerator$".to_string(),
            ],
            max_context_chars: 12_000,
            max_age_hours: 24,
            max_tldr_per_run: 1,
            max_tldr_per_day: 40,
            max_replies_per_run: 1,
            max_replies_per_day: 30,
            min_reply_words: 10,
            max_reply_words: 75,
            same_user_cooldown_hours: 1,
            same_user_replies_before_cooldown: 2,
            moderator_cache_days: 3,
            ban_reason: "Negative community karma".to_string(),
            moderation_bot: "AutoModerator".to_string(),
            run_interval_secs: 180,
            run_budget_secs: 150,
            claim_ttl_secs: 600,
            record_retention_days: 30,
            fetch_limit: 100,
            llm: LlmSettings::default(),
            reddit: RedditSettings::default(),
            notify: NotifySettings::default(),
        }
    }
}

impl BotConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
                path: path.display().to_string(),
            },
            std::io::ErrorKind::PermissionDenied => ConfigError::PermissionDenied {
                path: path.display().to_string(),
            },
            _ => ConfigError::InvalidFormat {
                details: format!("{}: {e}", path.display()),
            },
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: BotConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subreddit.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "subreddit".to_string(),
            });
        }
        if self.bot_username.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "bot_username".to_string(),
            });
        }
        if self.milestone_thresholds.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "milestone_thresholds must not be empty".to_string(),
            });
        }
        if self.milestone_thresholds.contains(&0) {
            return Err(ConfigError::InvalidValue {
                field: "milestone_thresholds".to_string(),
                value: "0".to_string(),
            });
        }
        if self.negative_karma_threshold >= 0 {
            return Err(ConfigError::InvalidValue {
                field: "negative_karma_threshold".to_string(),
                value: self.negative_karma_threshold.to_string(),
            });
        }
        if self.tldr_word_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tldr_word_threshold".to_string(),
                value: "0".to_string(),
            });
        }
        if self.max_context_chars == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_context_chars".to_string(),
                value: "0".to_string(),
            });
        }
        if self.min_reply_words > self.max_reply_words {
            return Err(ConfigError::ValidationFailed {
                reason: format!(
                    "min_reply_words ({}) exceeds max_reply_words ({})",
                    self.min_reply_words, self.max_reply_words
                ),
            });
        }
        check_range("max_age_hours", self.max_age_hours, 1..=8_760)?;
        check_range("same_user_cooldown_hours", self.same_user_cooldown_hours, 0..=720)?;
        check_range("moderator_cache_days", self.moderator_cache_days, 1..=365)?;
        check_range("claim_ttl_secs", self.claim_ttl_secs, 1..=7 * 86_400)?;
        check_range("record_retention_days", self.record_retention_days, 1..=3_650)?;

        // Pruned records must be older than every window that reads them.
        let read_window_hours = self.max_age_hours.max(self.same_user_cooldown_hours).max(24);
        if self.record_retention_days * 24 <= read_window_hours {
            return Err(ConfigError::ValidationFailed {
                reason: format!(
                    "record_retention_days ({}) must outlast the {}h lookback window",
                    self.record_retention_days, read_window_hours
                ),
            });
        }

        self.summon_matcher()?;
        PatternSet::compile("hostile_patterns", &[], &self.hostile_patterns)?;
        PatternSet::compile("bot_indicators", &[], &self.bot_indicators)?;
        Ok(())
    }

    /// Thresholds sorted ascending with duplicates removed.
    pub fn sorted_milestones(&self) -> Vec<u32> {
        let mut thresholds = self.milestone_thresholds.clone();
        thresholds.sort_unstable();
        thresholds.dedup();
        thresholds
    }

    pub fn summon_matcher(&self) -> Result<PatternSet, ConfigError> {
        PatternSet::compile("summon", &self.summon_phrases, &self.summon_patterns)
    }

    pub fn hostile_matcher(&self) -> Result<PatternSet, ConfigError> {
        PatternSet::compile("hostile_patterns", &[], &self.hostile_patterns)
    }

    pub fn bot_matcher(&self) -> Result<PatternSet, ConfigError> {
        PatternSet::compile("bot_indicators", &[], &self.bot_indicators)
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.run_budget_secs)
    }

    pub fn llm_api_key(&self) -> Result<String, ConfigError> {
        require_env(self.llm.provider.api_key_var())
    }
}

fn check_range(field: &str, value: i64, range: RangeInclusive<i64>) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        })
    }
}

/// Script-app credentials for the Reddit password grant.
#[derive(Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl RedditCredentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            client_id: require_env(REDDIT_CLIENT_ID_VAR)?,
            client_secret: require_env(REDDIT_CLIENT_SECRET_VAR)?,
            username: require_env(REDDIT_USERNAME_VAR)?,
            password: require_env(REDDIT_PASSWORD_VAR)?,
        })
    }
}

impl std::fmt::Debug for RedditCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedditCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

fn require_env(var_name: &str) -> Result<String, ConfigError> {
    match std::env::var(var_name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvironmentVariable {
            var_name: var_name.to_string(),
        }),
    }
}

/// Case-insensitive matcher built from literal phrases and raw regexes.
#[derive(Debug, Clone)]
pub struct PatternSet {
    set: RegexSet,
}

impl PatternSet {
    pub fn compile(field: &str, phrases: &[String], patterns: &[String]) -> Result<Self, ConfigError> {
        let mut sources: Vec<String> = phrases
            .iter()
            .filter(|phrase| !phrase.trim().is_empty())
            .map(|phrase| phrase_pattern(phrase))
            .collect();
        sources.extend(patterns.iter().cloned());

        for source in &sources {
            Regex::new(source).map_err(|e| ConfigError::InvalidValue {
                field: field.to_string(),
                value: format!("{source}: {e}"),
            })?;
        }

        let set = RegexSetBuilder::new(&sources)
            .case_insensitive(true)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: field.to_string(),
                value: e.to_string(),
            })?;
        Ok(Self { set })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.set.is_match(text)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

// Literal phrase with any run of whitespace between words. Word boundaries are
// only anchored on edges that are word characters.
fn phrase_pattern(phrase: &str) -> String {
    let trimmed = phrase.trim();
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let words: Vec<String> = trimmed.split_whitespace().map(regex::escape).collect();
    let start = if trimmed.starts_with(is_word) { r"\b" } else { "" };
    let end = if trimmed.ends_with(is_word) { r"\b" } else { "" };
    format!("{start}{}{end}", words.join(r"\s+"))
}
