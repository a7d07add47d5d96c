#[cfg(test)]
mod tests {
    use crate::{ClaimOutcome, Database, RunRecord};
    use chrono::{Duration, Utc};
    use modbot_core::{ActionKind, BotReply};
    use std::env;

    async fn setup_test_db() -> Database {
        let db_path = env::temp_dir().join(format!("test_modbot_{}.db", uuid::Uuid::new_v4()));
        let db_url = format!("sqlite://{}", db_path.display());

        let mut db = Database::new(db_url);
        db.connect()
            .await
            .expect("Failed to connect to test database");
        db.run_migrations().await.expect("Failed to run migrations");

        db
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = setup_test_db().await;
        db.run_migrations().await.expect("second migration run");
        assert!(db.load_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_basic_functionality() {
        let db = setup_test_db().await;

        db.save_setting("test_key", "test_value")
            .await
            .expect("Failed to save setting");
        db.save_setting("test_key", "updated")
            .await
            .expect("Failed to overwrite setting");
        let value = db
            .get_setting("test_key")
            .await
            .expect("Failed to get setting");
        assert_eq!(value, Some("updated".to_string()));
        assert_eq!(db.get_setting("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unconnected_database_errors() {
        let db = Database::new("sqlite::memory:".to_string());
        assert!(db.load_history().await.is_err());
    }

    #[tokio::test]
    async fn test_claim_complete_visible_in_history() {
        let db = setup_test_db().await;
        let now = Utc::now();
        let ttl = Duration::minutes(10);

        assert_eq!(
            db.try_claim("p1", ActionKind::Tldr, Some("alice"), "run-1", now, ttl)
                .await
                .unwrap(),
            ClaimOutcome::Claimed
        );

        // Pending claims are not history.
        let history = db.load_history().await.unwrap();
        assert!(!history.is_completed("p1", ActionKind::Tldr));
        assert!(db.get_record("p1", ActionKind::Tldr).await.unwrap().is_none());

        let record = db.complete("p1", ActionKind::Tldr, "run-1", now).await.unwrap();
        assert_eq!(record.item_id, "p1");
        assert_eq!(record.kind, ActionKind::Tldr);
        assert_eq!(record.target_author.as_deref(), Some("alice"));

        let history = db.load_history().await.unwrap();
        assert!(history.is_completed("p1", ActionKind::Tldr));

        // A completed key can never be claimed again.
        assert_eq!(
            db.try_claim("p1", ActionKind::Tldr, None, "run-2", now + Duration::hours(2), ttl)
                .await
                .unwrap(),
            ClaimOutcome::Refused
        );
    }

    #[tokio::test]
    async fn test_overlapping_claim_is_refused() {
        let db = setup_test_db().await;
        let now = Utc::now();
        let ttl = Duration::minutes(10);

        assert_eq!(
            db.try_claim("troll", ActionKind::Ban, Some("troll"), "run-a", now, ttl)
                .await
                .unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            db.try_claim("troll", ActionKind::Ban, Some("troll"), "run-b", now, ttl)
                .await
                .unwrap(),
            ClaimOutcome::Refused
        );

        // The second run cannot complete a claim it does not hold.
        assert!(db.complete("troll", ActionKind::Ban, "run-b", now).await.is_err());
        assert!(db.complete("troll", ActionKind::Ban, "run-a", now).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_and_stale_claims() {
        let db = setup_test_db().await;
        let now = Utc::now();
        let ttl = Duration::minutes(10);

        assert_eq!(
            db.try_claim("c1", ActionKind::ReplyAck, None, "run-1", now, ttl)
                .await
                .unwrap(),
            ClaimOutcome::Claimed
        );
        db.release("c1", ActionKind::ReplyAck, "run-1").await.unwrap();
        assert_eq!(
            db.try_claim("c1", ActionKind::ReplyAck, None, "run-2", now, ttl)
                .await
                .unwrap(),
            ClaimOutcome::Claimed
        );

        // run-2 went quiet; after the ttl the key is taken over, and flagged as such.
        let later = now + Duration::minutes(11);
        assert_eq!(
            db.try_claim("c1", ActionKind::ReplyAck, None, "run-3", later, ttl)
                .await
                .unwrap(),
            ClaimOutcome::Reclaimed
        );
        assert!(db.complete("c1", ActionKind::ReplyAck, "run-2", later).await.is_err());

        // Only one run can take over the same abandoned claim.
        assert_eq!(
            db.try_claim("c1", ActionKind::ReplyAck, None, "run-4", later, ttl)
                .await
                .unwrap(),
            ClaimOutcome::Refused
        );
        assert!(db.complete("c1", ActionKind::ReplyAck, "run-3", later).await.is_ok());
    }

    #[tokio::test]
    async fn test_counts_for_caps_and_cooldown() {
        let db = setup_test_db().await;
        let now = Utc::now();
        let ttl = Duration::minutes(10);

        for (item, kind, author) in [
            ("c1", ActionKind::ReplyAck, "Bob"),
            ("c2", ActionKind::SummonAck, "bob"),
            ("c3", ActionKind::ReplyAck, "carol"),
            ("p1", ActionKind::Tldr, "bob"),
        ] {
            assert_eq!(
                db.try_claim(item, kind, Some(author), "run-1", now, ttl)
                    .await
                    .unwrap(),
                ClaimOutcome::Claimed
            );
            db.complete(item, kind, "run-1", now).await.unwrap();
        }

        let since = now - Duration::hours(1);
        assert_eq!(db.count_replies_to_author_since("BOB", since).await.unwrap(), 2);
        assert_eq!(
            db.count_completed_since(&[ActionKind::ReplyAck, ActionKind::SummonAck], since)
                .await
                .unwrap(),
            3
        );
        assert_eq!(
            db.count_completed_since(&[ActionKind::Tldr], now + Duration::seconds(5))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_bot_replies_and_summaries_in_history() {
        let db = setup_test_db().await;
        let now = Utc::now();

        let reply = BotReply {
            id: "r1".to_string(),
            target_id: "t3_p1".to_string(),
            kind: ActionKind::Summary { threshold: 50 },
            body: "Digest".to_string(),
            created_at: now,
        };
        db.save_bot_reply(&reply).await.unwrap();
        db.save_bot_reply(&reply).await.unwrap();
        assert_eq!(db.get_bot_reply("r1").await.unwrap(), Some(reply));

        db.try_claim(
            "p1",
            ActionKind::Summary { threshold: 50 },
            None,
            "run-1",
            now,
            Duration::minutes(10),
        )
        .await
        .unwrap();
        db.complete("p1", ActionKind::Summary { threshold: 50 }, "run-1", now)
            .await
            .unwrap();

        let history = db.load_history().await.unwrap();
        assert!(history.is_bot_reply("r1"));
        assert_eq!(
            history.summarized_thresholds("p1").into_iter().collect::<Vec<_>>(),
            vec![50]
        );
    }

    #[tokio::test]
    async fn test_runs_and_stats() {
        let db = setup_test_db().await;
        let now = Utc::now();

        db.try_claim("troll", ActionKind::Ban, Some("troll"), "run-1", now, Duration::minutes(10))
            .await
            .unwrap();
        db.complete("troll", ActionKind::Ban, "run-1", now).await.unwrap();

        for (id, tokens) in [("run-1", 120u64), ("run-2", 80u64)] {
            db.save_run(&RunRecord {
                id: id.to_string(),
                started_at: now,
                finished_at: now,
                completed: 1,
                skipped: 0,
                deferred: 0,
                failed: 1,
                tokens_used: tokens,
                errors: vec!["generation failed".to_string()],
            })
            .await
            .unwrap();
        }

        let stats = db.get_stats().await.unwrap();
        assert_eq!(stats.total_runs, 2);
        assert_eq!(stats.total_tokens, 200);
        assert_eq!(stats.failed_intents, 2);
        assert_eq!(stats.bans_issued, 1);
        assert_eq!(stats.actions_by_kind.get("ban"), Some(&1));
        assert_eq!(stats.last_run_at.map(|t| t.timestamp()), Some(now.timestamp()));
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_records() {
        let db = setup_test_db().await;
        let now = Utc::now();
        let old = now - Duration::days(40);
        let ttl = Duration::minutes(10);

        db.try_claim("old", ActionKind::Tldr, None, "run-1", old, ttl).await.unwrap();
        db.complete("old", ActionKind::Tldr, "run-1", old).await.unwrap();
        db.try_claim("new", ActionKind::Tldr, None, "run-2", now, ttl).await.unwrap();
        db.complete("new", ActionKind::Tldr, "run-2", now).await.unwrap();

        let pruned = db.prune_before(now - Duration::days(30)).await.unwrap();
        assert_eq!(pruned, 1);

        let history = db.load_history().await.unwrap();
        assert!(!history.is_completed("old", ActionKind::Tldr));
        assert!(history.is_completed("new", ActionKind::Tldr));
    }

    #[tokio::test]
    async fn test_prune_keeps_ban_records() {
        let db = setup_test_db().await;
        let now = Utc::now();
        let old = now - Duration::days(90);
        let ttl = Duration::minutes(10);

        for (item, kind) in [("troll", ActionKind::Ban), ("t3_old", ActionKind::Tldr)] {
            db.try_claim(item, kind, Some("troll"), "run-1", old, ttl).await.unwrap();
            db.complete(item, kind, "run-1", old).await.unwrap();
        }

        let pruned = db.prune_before(now + Duration::days(1)).await.unwrap();
        assert_eq!(pruned, 1);

        let history = db.load_history().await.unwrap();
        assert!(history.is_completed("troll", ActionKind::Ban));
        assert!(!history.is_completed("t3_old", ActionKind::Tldr));
        assert_eq!(
            db.try_claim("troll", ActionKind::Ban, Some("troll"), "run-2", now, ttl)
                .await
                .unwrap(),
            ClaimOutcome::Refused
        );
    }
}
