use chrono::{DateTime, Duration, Utc};
use database::{ClaimOutcome, Database};
use modbot_core::{ActionIntent, ActionRecord, BotReply, Comment, CoreError, ErrorExt, Platform};
use std::fmt;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Intents carried out by a single platform call. The first intent decides
/// what is sent; the rest are completed alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPlan {
    pub intents: Vec<ActionIntent>,
}

impl DispatchPlan {
    pub fn single(intent: ActionIntent) -> Self {
        Self {
            intents: vec![intent],
        }
    }

    pub fn primary(&self) -> Option<&ActionIntent> {
        self.intents.first()
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

impl fmt::Display for DispatchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.intents.iter().map(ToString::to_string).collect();
        f.write_str(&names.join("+"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The platform confirmed the action; one record per claimed intent.
    Completed(Vec<ActionRecord>),
    /// Every key was already completed or held by an overlapping run.
    Skipped,
}

/// Completion attempts after the platform has confirmed an action.
const COMPLETE_ATTEMPTS: u32 = 3;
const COMPLETE_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(200);

/// Claims, performs and records actions so each key completes at most once.
pub struct Dispatcher<'a, P> {
    platform: &'a P,
    store: &'a Database,
    claim_ttl: Duration,
}

impl<'a, P: Platform> Dispatcher<'a, P> {
    pub fn new(platform: &'a P, store: &'a Database, claim_ttl: Duration) -> Self {
        Self {
            platform,
            store,
            claim_ttl,
        }
    }

    /// `text` is the generated reply body; bans ignore it.
    ///
    /// Once the platform confirms an action the claims are never released,
    /// even when recording it fails; the next run adopts the live reply instead
    /// of posting a second one.
    pub async fn dispatch(
        &self,
        plan: &DispatchPlan,
        text: Option<&str>,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, CoreError> {
        let (claimed, reclaimed) = self.claim_all(plan, run_id, now).await?;
        let Some(&primary) = claimed.first() else {
            debug!("Skipping {}: already handled", plan);
            return Ok(DispatchOutcome::Skipped);
        };

        if reclaimed {
            if let Some(existing) = self.orphaned_reply(primary).await? {
                info!("Adopting reply {} left by an earlier run for {}", existing.id, plan);
                let records = self.complete_all(&claimed, run_id).await;
                self.remember_reply(primary, existing.id, &existing.body).await;
                return records.map(DispatchOutcome::Completed);
            }
        }

        let reply_id = match self.perform(primary, text).await {
            Ok(reply_id) => reply_id,
            Err(e) => {
                self.release_all(&claimed, run_id).await;
                return Err(e);
            }
        };

        let records = self.complete_all(&claimed, run_id).await;
        if let (Some(id), Some(body)) = (reply_id, text) {
            self.remember_reply(primary, id, body).await;
        }

        let records = records?;
        info!("Completed {}", plan);
        Ok(DispatchOutcome::Completed(records))
    }

    /// Claims every key of the plan. The flag is set when any claim was taken
    /// over from a run that never completed it.
    async fn claim_all<'p>(
        &self,
        plan: &'p DispatchPlan,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(Vec<&'p ActionIntent>, bool), CoreError> {
        let mut claimed = Vec::with_capacity(plan.len());
        let mut reclaimed = false;
        for intent in &plan.intents {
            let result = self
                .store
                .try_claim(
                    &intent.item_id(),
                    intent.kind(),
                    intent.target_author(),
                    run_id,
                    now,
                    self.claim_ttl,
                )
                .await;
            match result {
                Ok(ClaimOutcome::Claimed) => claimed.push(intent),
                Ok(ClaimOutcome::Reclaimed) => {
                    reclaimed = true;
                    claimed.push(intent);
                }
                Ok(ClaimOutcome::Refused) => debug!("Claim refused for {}", intent),
                Err(e) => {
                    self.release_all(&claimed, run_id).await;
                    return Err(e);
                }
            }
        }
        Ok((claimed, reclaimed))
    }

    /// A reply a crashed run posted but never recorded. Bans are idempotent
    /// on the platform and are simply repeated.
    async fn orphaned_reply(&self, intent: &ActionIntent) -> Result<Option<Comment>, CoreError> {
        let Some(parent) = intent.reply_parent() else {
            return Ok(None);
        };
        for reply in self.platform.find_own_replies(&parent).await? {
            if self.store.get_bot_reply(&reply.id).await?.is_none() {
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }

    async fn release_all(&self, claimed: &[&ActionIntent], run_id: &str) {
        for intent in claimed {
            if let Err(e) = self.store.release(&intent.item_id(), intent.kind(), run_id).await {
                warn!("Could not release claim on {}: {}", intent, e);
            }
        }
    }

    /// Completes every claimed key, carrying on past failures. Keys that could
    /// not be completed stay claimed until their claim goes stale.
    async fn complete_all(
        &self,
        claimed: &[&ActionIntent],
        run_id: &str,
    ) -> Result<Vec<ActionRecord>, CoreError> {
        let mut records = Vec::with_capacity(claimed.len());
        let mut failure = None;
        for intent in claimed {
            match self.complete(intent, run_id).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!("Could not record completed {}: {}", intent, e);
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(records),
        }
    }

    async fn complete(&self, intent: &ActionIntent, run_id: &str) -> Result<ActionRecord, CoreError> {
        let item_id = intent.item_id();
        let mut attempt = 1;
        loop {
            match self
                .store
                .complete(&item_id, intent.kind(), run_id, Utc::now())
                .await
            {
                Ok(record) => return Ok(record),
                Err(e) if attempt < COMPLETE_ATTEMPTS => {
                    warn!("Recording {} failed (attempt {}): {}", intent, attempt, e);
                    sleep(COMPLETE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn remember_reply(&self, primary: &ActionIntent, id: String, body: &str) {
        let reply = BotReply {
            id,
            target_id: primary.item_id(),
            kind: primary.kind(),
            body: body.to_string(),
            created_at: Utc::now(),
        };
        // The reply is live; losing this row only hides follow-ups to it.
        if let Err(e) = self.store.save_bot_reply(&reply).await {
            e.log_warn();
        }
    }

    /// Returns the id of the posted reply, or `None` for bans.
    async fn perform(&self, intent: &ActionIntent, text: Option<&str>) -> Result<Option<String>, CoreError> {
        if let ActionIntent::BanUser {
            username,
            karma,
            reason,
        } = intent
        {
            let note = format!("community karma {karma}");
            self.platform.ban_user(username, reason, &note).await?;
            return Ok(None);
        }

        let parent = intent.reply_parent().ok_or_else(|| CoreError::Internal {
            message: format!("{intent} has no reply target"),
        })?;
        let text = text
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| CoreError::InvalidInput {
                message: format!("no reply text for {intent}"),
            })?;

        let reply_id = self.platform.post_reply(&parent, text).await?;
        Ok(Some(reply_id))
    }
}
