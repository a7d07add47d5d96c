use chrono::{DateTime, Duration, Utc};
use modbot_core::{ActionKind, ActionRecord, BotReply, CoreError, DatabaseError, History};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

mod tests;

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "create_action_records",
        "CREATE TABLE IF NOT EXISTS action_records (
            item_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'completed')),
            target_author TEXT,
            run_id TEXT NOT NULL,
            claimed_at INTEGER NOT NULL,
            completed_at INTEGER,
            PRIMARY KEY (item_id, kind)
        )",
    ),
    (
        "index_action_records_completed",
        "CREATE INDEX IF NOT EXISTS idx_action_records_completed
            ON action_records (status, kind, completed_at)",
    ),
    (
        "create_bot_replies",
        "CREATE TABLE IF NOT EXISTS bot_replies (
            id TEXT PRIMARY KEY,
            target_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
    ),
    (
        "create_runs",
        "CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            completed INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            deferred INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            tokens_used INTEGER NOT NULL,
            errors TEXT NOT NULL
        )",
    ),
    (
        "create_settings",
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
    ),
];

/// Result of [`Database::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Fresh claim; nobody has acted on the key.
    Claimed,
    /// Took over a claim whose run went quiet past the ttl.
    Reclaimed,
    /// Completed, or held by a live claim.
    Refused,
}

impl ClaimOutcome {
    pub fn is_held(&self) -> bool {
        !matches!(self, ClaimOutcome::Refused)
    }
}

/// One finished invocation, as persisted for the stats report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed: u32,
    pub skipped: u32,
    pub deferred: u32,
    pub failed: u32,
    pub tokens_used: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotStats {
    pub total_runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_tokens: u64,
    pub failed_intents: u64,
    pub actions_by_kind: BTreeMap<String, u64>,
    pub bot_replies: u64,
    pub bans_issued: u64,
}

/// SQLite-backed state store for completed actions, bot replies and run history.
pub struct Database {
    connection_string: String,
    pool: Option<SqlitePool>,
}

impl Database {
    pub fn new(connection_string: String) -> Self {
        Self {
            connection_string,
            pool: None,
        }
    }

    pub async fn connect(&mut self) -> Result<(), CoreError> {
        let options = SqliteConnectOptions::from_str(&self.connection_string)
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: format!("invalid database url {}: {e}", self.connection_string),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        if let Some(parent) = database_dir(&self.connection_string) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            })?;

        info!("Connected to state store at {}", self.connection_string);
        self.pool = Some(pool);
        Ok(())
    }

    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        let pool = self.pool()?;
        for (name, sql) in MIGRATIONS {
            sqlx::query(sql)
                .execute(pool)
                .await
                .map_err(|e| DatabaseError::MigrationFailed {
                    migration: format!("{name}: {e}"),
                })?;
            debug!("Applied migration {}", name);
        }
        Ok(())
    }

    /// Completed actions plus every reply the bot has posted.
    pub async fn load_history(&self) -> Result<History, CoreError> {
        let pool = self.pool()?;
        let mut history = History::new();

        let rows = sqlx::query("SELECT item_id, kind FROM action_records WHERE status = 'completed'")
            .fetch_all(pool)
            .await
            .map_err(sql_error)?;
        for row in rows {
            let item_id: String = row.try_get("item_id").map_err(sql_error)?;
            let kind: String = row.try_get("kind").map_err(sql_error)?;
            match kind.parse::<ActionKind>() {
                Ok(kind) => history.record(item_id, kind),
                Err(e) => warn!("Skipping unreadable action record for {}: {}", item_id, e),
            }
        }

        let reply_ids = sqlx::query("SELECT id FROM bot_replies")
            .fetch_all(pool)
            .await
            .map_err(sql_error)?;
        for row in reply_ids {
            let id: String = row.try_get("id").map_err(sql_error)?;
            history.add_bot_reply(id);
        }

        debug!("Loaded history with {} completed actions", history.len());
        Ok(history)
    }

    /// Reserves `(item_id, kind)` for `run_id`. A key that is completed or held
    /// by a live claim is refused. A claim older than `claim_ttl` is taken over
    /// and reported as [`ClaimOutcome::Reclaimed`]: its run may have acted
    /// before it stopped, so the caller must check before acting again.
    pub async fn try_claim(
        &self,
        item_id: &str,
        kind: ActionKind,
        target_author: Option<&str>,
        run_id: &str,
        now: DateTime<Utc>,
        claim_ttl: Duration,
    ) -> Result<ClaimOutcome, CoreError> {
        let pool = self.pool()?;
        let kind_key = kind.to_string();

        let taken_over = sqlx::query(
            "UPDATE action_records SET run_id = ?, claimed_at = ?, target_author = ?
             WHERE item_id = ? AND kind = ? AND status = 'pending' AND claimed_at < ?",
        )
        .bind(run_id)
        .bind(now.timestamp())
        .bind(target_author)
        .bind(item_id)
        .bind(&kind_key)
        .bind((now - claim_ttl).timestamp())
        .execute(pool)
        .await
        .map_err(sql_error)?;
        if taken_over.rows_affected() > 0 {
            warn!("Took over abandoned claim on {} {}", kind_key, item_id);
            return Ok(ClaimOutcome::Reclaimed);
        }

        let inserted = sqlx::query(
            "INSERT INTO action_records (item_id, kind, status, target_author, run_id, claimed_at)
             VALUES (?, ?, 'pending', ?, ?, ?)
             ON CONFLICT (item_id, kind) DO NOTHING",
        )
        .bind(item_id)
        .bind(&kind_key)
        .bind(target_author)
        .bind(run_id)
        .bind(now.timestamp())
        .execute(pool)
        .await
        .map_err(sql_error)?;

        if inserted.rows_affected() == 1 {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::Refused)
        }
    }

    /// Turns this run's claim into a completed record.
    pub async fn complete(
        &self,
        item_id: &str,
        kind: ActionKind,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ActionRecord, CoreError> {
        let pool = self.pool()?;
        let updated = sqlx::query(
            "UPDATE action_records SET status = 'completed', completed_at = ?
             WHERE item_id = ? AND kind = ? AND run_id = ? AND status = 'pending'",
        )
        .bind(now.timestamp())
        .bind(item_id)
        .bind(kind.to_string())
        .bind(run_id)
        .execute(pool)
        .await
        .map_err(sql_error)?;

        if updated.rows_affected() != 1 {
            return Err(DatabaseError::ConstraintViolation {
                constraint: format!("no pending claim on {kind} {item_id} for run {run_id}"),
            }
            .into());
        }

        self.get_record(item_id, kind)
            .await?
            .ok_or_else(|| {
                DatabaseError::QueryFailed {
                    query: format!("completed record {kind} {item_id} not found"),
                }
                .into()
            })
    }

    /// Drops this run's pending claim so a later run can retry the action.
    pub async fn release(&self, item_id: &str, kind: ActionKind, run_id: &str) -> Result<(), CoreError> {
        let pool = self.pool()?;
        sqlx::query(
            "DELETE FROM action_records
             WHERE item_id = ? AND kind = ? AND run_id = ? AND status = 'pending'",
        )
        .bind(item_id)
        .bind(kind.to_string())
        .bind(run_id)
        .execute(pool)
        .await
        .map_err(sql_error)?;
        Ok(())
    }

    /// Completed record for the key, if any. Pending claims are not returned.
    pub async fn get_record(
        &self,
        item_id: &str,
        kind: ActionKind,
    ) -> Result<Option<ActionRecord>, CoreError> {
        let pool = self.pool()?;
        let row = sqlx::query(
            "SELECT item_id, kind, target_author, completed_at FROM action_records
             WHERE item_id = ? AND kind = ? AND status = 'completed'",
        )
        .bind(item_id)
        .bind(kind.to_string())
        .fetch_optional(pool)
        .await
        .map_err(sql_error)?;

        row.map(|row| -> Result<ActionRecord, CoreError> {
            let completed_at: i64 = row.try_get("completed_at").map_err(sql_error)?;
            Ok(ActionRecord {
                item_id: row.try_get("item_id").map_err(sql_error)?,
                kind,
                target_author: row.try_get("target_author").map_err(sql_error)?,
                completed_at: from_timestamp(completed_at)?,
            })
        })
        .transpose()
    }

    pub async fn count_completed_since(
        &self,
        kinds: &[ActionKind],
        since: DateTime<Utc>,
    ) -> Result<u32, CoreError> {
        let pool = self.pool()?;
        let mut total = 0u32;
        for kind in kinds {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM action_records
                 WHERE status = 'completed' AND kind = ? AND completed_at >= ?",
            )
            .bind(kind.to_string())
            .bind(since.timestamp())
            .fetch_one(pool)
            .await
            .map_err(sql_error)?;
            total += count as u32;
        }
        Ok(total)
    }

    /// Conversational replies sent to `author` since `since`.
    pub async fn count_replies_to_author_since(
        &self,
        author: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, CoreError> {
        let pool = self.pool()?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM action_records
             WHERE status = 'completed' AND kind IN (?, ?)
               AND lower(target_author) = lower(?) AND completed_at >= ?",
        )
        .bind(ActionKind::ReplyAck.to_string())
        .bind(ActionKind::SummonAck.to_string())
        .bind(author)
        .bind(since.timestamp())
        .fetch_one(pool)
        .await
        .map_err(sql_error)?;
        Ok(count as u32)
    }

    pub async fn save_bot_reply(&self, reply: &BotReply) -> Result<(), CoreError> {
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO bot_replies (id, target_id, kind, body, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&reply.id)
        .bind(&reply.target_id)
        .bind(reply.kind.to_string())
        .bind(&reply.body)
        .bind(reply.created_at.timestamp())
        .execute(pool)
        .await
        .map_err(sql_error)?;
        Ok(())
    }

    pub async fn get_bot_reply(&self, id: &str) -> Result<Option<BotReply>, CoreError> {
        let pool = self.pool()?;
        let row = sqlx::query(
            "SELECT id, target_id, kind, body, created_at FROM bot_replies WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(sql_error)?;

        row.map(|row| -> Result<BotReply, CoreError> {
            let kind: String = row.try_get("kind").map_err(sql_error)?;
            let created_at: i64 = row.try_get("created_at").map_err(sql_error)?;
            Ok(BotReply {
                id: row.try_get("id").map_err(sql_error)?,
                target_id: row.try_get("target_id").map_err(sql_error)?,
                kind: kind
                    .parse()
                    .map_err(|details| DatabaseError::CorruptRecord { details })?,
                body: row.try_get("body").map_err(sql_error)?,
                created_at: from_timestamp(created_at)?,
            })
        })
        .transpose()
    }

    pub async fn save_run(&self, run: &RunRecord) -> Result<(), CoreError> {
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO runs (id, started_at, finished_at, completed, skipped, deferred, failed, tokens_used, errors)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(run.started_at.timestamp())
        .bind(run.finished_at.timestamp())
        .bind(run.completed as i64)
        .bind(run.skipped as i64)
        .bind(run.deferred as i64)
        .bind(run.failed as i64)
        .bind(run.tokens_used as i64)
        .bind(serde_json::to_string(&run.errors)?)
        .execute(pool)
        .await
        .map_err(sql_error)?;
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<BotStats, CoreError> {
        let pool = self.pool()?;
        let mut stats = BotStats::default();

        let row = sqlx::query(
            "SELECT COUNT(*) AS runs, MAX(finished_at) AS last_run,
                    COALESCE(SUM(tokens_used), 0) AS tokens, COALESCE(SUM(failed), 0) AS failed
             FROM runs",
        )
        .fetch_one(pool)
        .await
        .map_err(sql_error)?;
        stats.total_runs = row.try_get::<i64, _>("runs").map_err(sql_error)? as u64;
        stats.total_tokens = row.try_get::<i64, _>("tokens").map_err(sql_error)? as u64;
        stats.failed_intents = row.try_get::<i64, _>("failed").map_err(sql_error)? as u64;
        stats.last_run_at = row
            .try_get::<Option<i64>, _>("last_run")
            .map_err(sql_error)?
            .map(from_timestamp)
            .transpose()?;

        let rows = sqlx::query(
            "SELECT kind, COUNT(*) AS total FROM action_records
             WHERE status = 'completed' GROUP BY kind",
        )
        .fetch_all(pool)
        .await
        .map_err(sql_error)?;
        for row in rows {
            let kind: String = row.try_get("kind").map_err(sql_error)?;
            let total: i64 = row.try_get("total").map_err(sql_error)?;
            if kind == ActionKind::Ban.to_string() {
                stats.bans_issued = total as u64;
            }
            stats.actions_by_kind.insert(kind, total as u64);
        }

        let replies: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bot_replies")
            .fetch_one(pool)
            .await
            .map_err(sql_error)?;
        stats.bot_replies = replies as u64;

        Ok(stats)
    }

    pub async fn save_setting(&self, key: &str, value: &str) -> Result<(), CoreError> {
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(pool)
        .await
        .map_err(sql_error)?;
        Ok(())
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, CoreError> {
        let pool = self.pool()?;
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await
            .map_err(sql_error)?;
        Ok(value)
    }

    /// Deletes completed records and bot replies older than `cutoff`. Ban
    /// records are kept: a reputation flag has no age window.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let pool = self.pool()?;
        let records = sqlx::query(
            "DELETE FROM action_records
             WHERE status = 'completed' AND kind != ? AND completed_at < ?",
        )
        .bind(ActionKind::Ban.to_string())
        .bind(cutoff.timestamp())
        .execute(pool)
        .await
        .map_err(sql_error)?;
        let replies = sqlx::query("DELETE FROM bot_replies WHERE created_at < ?")
            .bind(cutoff.timestamp())
            .execute(pool)
            .await
            .map_err(sql_error)?;

        let pruned = records.rows_affected() + replies.rows_affected();
        if pruned > 0 {
            info!("Pruned {} records older than {}", pruned, cutoff);
        }
        Ok(pruned)
    }

    fn pool(&self) -> Result<&SqlitePool, CoreError> {
        self.pool.as_ref().ok_or_else(|| {
            DatabaseError::ConnectionFailed {
                reason: "database not connected".to_string(),
            }
            .into()
        })
    }
}

fn sql_error(error: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db_error) = &error {
        if db_error.message().contains("database is locked") {
            return DatabaseError::DatabaseLocked.into();
        }
    }
    DatabaseError::Sql(error).into()
}

// Directory holding the database file, for file-backed sqlite urls.
fn database_dir(connection_string: &str) -> Option<&Path> {
    let path = connection_string
        .strip_prefix("sqlite://")
        .or_else(|| connection_string.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Path::new(path)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
}

fn from_timestamp(seconds: i64) -> Result<DateTime<Utc>, CoreError> {
    DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
        DatabaseError::CorruptRecord {
            details: format!("timestamp out of range: {seconds}"),
        }
        .into()
    })
}
