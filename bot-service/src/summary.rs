use chrono::{DateTime, Utc};
use database::RunRecord;
use modbot_core::{CoreError, ErrorExt, UserReputationFlag};
use serde::Serialize;
use std::fmt;

/// Where in the run a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fetch,
    Generation,
    Dispatch,
    Store,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureStage::Fetch => "fetch",
            FailureStage::Generation => "generation",
            FailureStage::Dispatch => "dispatch",
            FailureStage::Store => "store",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntentFailure {
    pub stage: FailureStage,
    /// Intent or fetch the failure belongs to, e.g. `tldr_posted(abc123)`.
    pub item: String,
    pub error_code: String,
    pub message: String,
}

impl fmt::Display for IntentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.stage, self.item, self.error_code, self.message
        )
    }
}

/// Outcome of one `run_once` invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub subreddit: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    /// Intents produced by evaluation, before caps and claims.
    pub planned: u32,
    pub completed: u32,
    pub skipped: u32,
    pub deferred: u32,
    pub tokens_used: u64,
    pub errors: Vec<IntentFailure>,
    /// Flags seen this run with the ban decision taken on each.
    pub reputation: Vec<UserReputationFlag>,
}

impl RunSummary {
    pub fn new(run_id: impl Into<String>, subreddit: impl Into<String>, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            subreddit: subreddit.into(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            planned: 0,
            completed: 0,
            skipped: 0,
            deferred: 0,
            tokens_used: 0,
            errors: Vec::new(),
            reputation: Vec::new(),
        }
    }

    pub fn record_failure(&mut self, stage: FailureStage, item: impl Into<String>, error: &CoreError) {
        self.errors.push(IntentFailure {
            stage,
            item: item.into(),
            error_code: error.error_code(),
            message: error.to_string(),
        });
    }

    pub fn failed(&self) -> u32 {
        self.errors
            .iter()
            .filter(|failure| matches!(failure.stage, FailureStage::Generation | FailureStage::Dispatch))
            .count() as u32
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn to_run_record(&self) -> RunRecord {
        RunRecord {
            id: self.run_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or_else(Utc::now),
            completed: self.completed,
            skipped: self.skipped,
            deferred: self.deferred,
            failed: self.failed(),
            tokens_used: self.tokens_used,
            errors: self.errors.iter().map(ToString::to_string).collect(),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} on r/{}: {} planned, {} completed, {} skipped, {} deferred, {} failed, {} tokens",
            self.run_id,
            self.subreddit,
            self.planned,
            self.completed,
            self.skipped,
            self.deferred,
            self.failed(),
            self.tokens_used
        )
    }
}
