#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use claims::{assert_none, assert_ok, assert_some};
use insta::assert_compact_json_snapshot;
use oban::{
    LeaderConfig, LifelineConfig, NewJob, Oban, Outcome, PrunerConfig, StagerConfig, UniqueSpec,
    Worker, setup_database,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use tokio::sync::Barrier;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::postgres::Postgres;

    /// Set up a Postgres container and an installed pool.
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let container = Postgres::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }

    /// Engine defaults tuned for tests: fast staging, fast leases.
    pub(super) fn test_engine<Context: Clone + Send + Sync + 'static>(
        pool: PgPool,
        context: Context,
    ) -> Oban<Context> {
        Oban::new(pool, context)
            .node("test-node")
            .stager(StagerConfig {
                interval: Duration::from_millis(100),
                limit: 20_000,
            })
            .leader(LeaderConfig {
                lease: Duration::from_secs(2),
            })
    }

    /// Poll `check` until it returns true or the timeout lapses.
    pub(super) async fn eventually<F>(timeout: Duration, mut check: F) -> bool
    where
        F: AsyncFnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if check().await {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

use test_utils::{eventually, setup_test_db, test_engine};

async fn job_state(pool: &PgPool, id: i64) -> String {
    sqlx::query_scalar::<_, String>("SELECT state::text FROM oban_jobs WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("job must exist")
}

async fn all_jobs(pool: &PgPool) -> anyhow::Result<Vec<(String, Value)>> {
    let rows = sqlx::query_as::<_, (String, Value)>(
        "SELECT worker, args FROM oban_jobs ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[tokio::test]
async fn jobs_execute_and_complete() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct EchoJob {
        value: String,
    }

    impl Worker for EchoJob {
        const NAME: &'static str = "echo";
        type Context = ();

        async fn perform(&self, _ctx: Self::Context) -> anyhow::Result<Outcome> {
            Ok(Outcome::Done)
        }
    }

    let (pool, _container) = setup_test_db().await?;

    let oban = test_engine(pool.clone(), ())
        .register::<EchoJob>()
        .queue("default", 2);

    let inserted = oban
        .enqueue(&EchoJob {
            value: "hello".to_owned(),
        })
        .await?;
    assert!(!inserted.conflicted);

    let handle = oban.start().await?;
    let id = inserted.job.id;

    assert!(
        eventually(Duration::from_secs(10), async || {
            job_state(&pool, id).await == "completed"
        })
        .await,
        "job should complete"
    );

    let completed_at = sqlx::query_scalar::<_, Option<chrono::DateTime<chrono::Utc>>>(
        "SELECT completed_at FROM oban_jobs WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await?;
    assert_some!(completed_at);

    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unique_jobs_conflict_within_their_group() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;

    let oban = test_engine(pool.clone(), ()).queue("default", 1);

    let job = || {
        NewJob::builder("uniq")
            .args(json!({"id": 1}))
            .schedule_in(Duration::from_secs(3600))
            .unique(UniqueSpec::new())
            .build()
            .expect("job must build")
    };

    let first = oban.insert(job()).await?;
    let second = oban.insert(job()).await?;

    assert!(!first.conflicted);
    assert!(second.conflicted);
    assert_eq!(first.job.id, second.job.id);

    assert_compact_json_snapshot!(all_jobs(&pool).await?, @r#"[["uniq", {"id": 1}]]"#);

    // Different args fingerprint differently.
    let other = oban
        .insert(assert_ok!(
            NewJob::builder("uniq")
                .args(json!({"id": 2}))
                .unique(UniqueSpec::new())
                .build()
        ))
        .await?;
    assert!(!other.conflicted);

    let batch = oban.insert_all([job(), job()]).await?;
    assert!(batch.iter().all(|result| result.conflicted));

    // Batched inserts resolve conflicts per row and keep input order.
    let mixed = oban
        .insert_all([
            job(),
            NewJob::builder("plain").build()?,
            NewJob::builder("plain").build()?,
        ])
        .await?;

    assert!(mixed[0].conflicted);
    assert_eq!(mixed[0].job.id, first.job.id);
    assert!(!mixed[1].conflicted);
    assert!(!mixed[2].conflicted);
    assert_eq!(mixed[1].job.worker, "plain");
    assert_ne!(mixed[1].job.id, mixed[2].job.id);

    Ok(())
}

#[tokio::test]
async fn failed_jobs_retry_until_success() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct RetryContext {
        runs: Arc<AtomicU8>,
    }

    #[derive(Serialize, Deserialize)]
    struct FlakyJob;

    impl Worker for FlakyJob {
        const NAME: &'static str = "flaky";
        const MAX_ATTEMPTS: i32 = 3;

        type Context = RetryContext;

        fn backoff(_attempt: i32) -> Duration {
            Duration::ZERO
        }

        async fn perform(&self, ctx: Self::Context) -> anyhow::Result<Outcome> {
            let run = ctx.runs.fetch_add(1, Ordering::SeqCst);

            if run < 2 {
                anyhow::bail!("flaked on run {run}");
            }

            Ok(Outcome::Done)
        }
    }

    let (pool, _container) = setup_test_db().await?;

    let context = RetryContext {
        runs: Arc::new(AtomicU8::new(0)),
    };

    let oban = test_engine(pool.clone(), context)
        .register::<FlakyJob>()
        .queue("default", 1);

    let id = oban.enqueue(&FlakyJob).await?.job.id;
    let handle = oban.start().await?;

    assert!(
        eventually(Duration::from_secs(20), async || {
            job_state(&pool, id).await == "completed"
        })
        .await,
        "job should complete on the third attempt"
    );

    let (attempt, error_count, attempted_by_count) = sqlx::query_as::<_, (i32, Option<i32>, i32)>(
        "SELECT attempt, array_length(errors, 1), array_length(attempted_by, 1) \
         FROM oban_jobs WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await?;

    assert_eq!(attempt, 3);
    assert_eq!(error_count, Some(2));
    assert_eq!(attempted_by_count, 3);

    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn single_attempt_jobs_discard_on_failure() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct DoomedJob;

    impl Worker for DoomedJob {
        const NAME: &'static str = "doomed";
        const MAX_ATTEMPTS: i32 = 1;

        type Context = ();

        async fn perform(&self, _ctx: Self::Context) -> anyhow::Result<Outcome> {
            anyhow::bail!("always fails")
        }
    }

    let (pool, _container) = setup_test_db().await?;

    let oban = test_engine(pool.clone(), ())
        .register::<DoomedJob>()
        .queue("default", 1);

    let id = oban.enqueue(&DoomedJob).await?.job.id;
    let handle = oban.start().await?;

    assert!(
        eventually(Duration::from_secs(10), async || {
            job_state(&pool, id).await == "discarded"
        })
        .await,
        "job should go straight to discarded"
    );

    let (error_count, discarded_at) = sqlx::query_as::<_, (Option<i32>, Option<chrono::DateTime<chrono::Utc>>)>(
        "SELECT array_length(errors, 1), discarded_at FROM oban_jobs WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await?;

    assert_eq!(error_count, Some(1));
    assert_some!(discarded_at);

    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn panicking_jobs_are_recorded_as_failures() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct PanickyJob;

    impl Worker for PanickyJob {
        const NAME: &'static str = "panicky";
        const MAX_ATTEMPTS: i32 = 1;

        type Context = ();

        async fn perform(&self, _ctx: Self::Context) -> anyhow::Result<Outcome> {
            panic!("kaboom")
        }
    }

    let (pool, _container) = setup_test_db().await?;

    let oban = test_engine(pool.clone(), ())
        .register::<PanickyJob>()
        .queue("default", 1);

    let id = oban.enqueue(&PanickyJob).await?.job.id;
    let handle = oban.start().await?;

    assert!(
        eventually(Duration::from_secs(10), async || {
            job_state(&pool, id).await == "discarded"
        })
        .await,
        "panicked job should be discarded"
    );

    let error = sqlx::query_scalar::<_, String>(
        "SELECT errors[1] ->> 'error' FROM oban_jobs WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await?;
    assert!(error.contains("kaboom"), "unexpected error: {error}");

    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cancelling_workers_record_their_reason() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct UnwantedJob;

    impl Worker for UnwantedJob {
        const NAME: &'static str = "unwanted";
        type Context = ();

        async fn perform(&self, _ctx: Self::Context) -> anyhow::Result<Outcome> {
            Ok(Outcome::Cancel("no longer needed".to_owned()))
        }
    }

    let (pool, _container) = setup_test_db().await?;

    let oban = test_engine(pool.clone(), ())
        .register::<UnwantedJob>()
        .queue("default", 1);

    let id = oban.enqueue(&UnwantedJob).await?.job.id;
    let handle = oban.start().await?;

    assert!(
        eventually(Duration::from_secs(10), async || {
            job_state(&pool, id).await == "cancelled"
        })
        .await,
        "job should be cancelled"
    );

    let reason = sqlx::query_scalar::<_, String>(
        "SELECT errors[1] ->> 'error' FROM oban_jobs WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(reason, "no longer needed");

    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn dispatch_prefers_lower_priority_and_lower_id() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct HoldContext {
        started: Arc<Barrier>,
        release: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct HoldJob {
        block: bool,
    }

    impl Worker for HoldJob {
        const NAME: &'static str = "hold";
        type Context = HoldContext;

        async fn perform(&self, ctx: Self::Context) -> anyhow::Result<Outcome> {
            if self.block {
                ctx.started.wait().await;
                ctx.release.wait().await;
            }

            Ok(Outcome::Done)
        }
    }

    let (pool, _container) = setup_test_db().await?;

    let context = HoldContext {
        started: Arc::new(Barrier::new(3)),
        release: Arc::new(Barrier::new(3)),
    };

    let oban = test_engine(pool.clone(), context.clone())
        .register::<HoldJob>()
        .queue("default", 2);

    // Urgent jobs arrive after a lower-priority one, so ids alone would
    // dispatch the wrong rows.
    let laggard = oban
        .insert(
            NewJob::builder("hold")
                .args(json!({"block": false}))
                .priority(1)
                .build()?,
        )
        .await?
        .job
        .id;
    let urgent_1 = oban
        .insert(
            NewJob::builder("hold")
                .args(json!({"block": true}))
                .priority(0)
                .build()?,
        )
        .await?
        .job
        .id;
    let urgent_2 = oban
        .insert(
            NewJob::builder("hold")
                .args(json!({"block": true}))
                .priority(0)
                .build()?,
        )
        .await?
        .job
        .id;

    let handle = oban.start().await?;

    context.started.wait().await;

    let executing = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM oban_jobs WHERE state = 'executing' ORDER BY id",
    )
    .fetch_all(&pool)
    .await?;

    assert_eq!(executing, vec![urgent_1, urgent_2]);
    assert_eq!(job_state(&pool, laggard).await, "available");

    context.release.wait().await;

    assert!(
        eventually(Duration::from_secs(10), async || {
            job_state(&pool, laggard).await == "completed"
        })
        .await,
        "the lower-priority job should run after the budget frees up"
    );

    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn scheduled_jobs_are_staged_when_due() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct LaterJob;

    impl Worker for LaterJob {
        const NAME: &'static str = "later";
        type Context = ();

        async fn perform(&self, _ctx: Self::Context) -> anyhow::Result<Outcome> {
            Ok(Outcome::Done)
        }
    }

    let (pool, _container) = setup_test_db().await?;

    let oban = test_engine(pool.clone(), ())
        .register::<LaterJob>()
        .queue("default", 1);

    let inserted = oban
        .insert(
            NewJob::builder("later")
                .schedule_in(Duration::from_secs(1))
                .build()?,
        )
        .await?;

    assert_eq!(job_state(&pool, inserted.job.id).await, "scheduled");

    let handle = oban.start().await?;

    assert!(
        eventually(Duration::from_secs(10), async || {
            job_state(&pool, inserted.job.id).await == "completed"
        })
        .await,
        "scheduled job should stage and run once due"
    );

    // Shutdown triggered from a separate task; the handle only waits.
    let trigger = handle.shutdown_trigger();
    tokio::spawn(async move { trigger.shutdown() });
    handle.wait_for_shutdown().await;

    Ok(())
}

#[tokio::test]
async fn snoozed_jobs_run_again_without_spending_attempts() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct SnoozeContext {
        runs: Arc<AtomicU8>,
    }

    #[derive(Serialize, Deserialize)]
    struct SnoozyJob;

    impl Worker for SnoozyJob {
        const NAME: &'static str = "snoozy";
        type Context = SnoozeContext;

        async fn perform(&self, ctx: Self::Context) -> anyhow::Result<Outcome> {
            if ctx.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Outcome::Snooze(1))
            } else {
                Ok(Outcome::Done)
            }
        }
    }

    let (pool, _container) = setup_test_db().await?;

    let context = SnoozeContext {
        runs: Arc::new(AtomicU8::new(0)),
    };

    let oban = test_engine(pool.clone(), context)
        .register::<SnoozyJob>()
        .queue("default", 1);

    let id = oban.enqueue(&SnoozyJob).await?.job.id;
    let handle = oban.start().await?;

    assert!(
        eventually(Duration::from_secs(15), async || {
            job_state(&pool, id).await == "completed"
        })
        .await,
        "snoozed job should run again and complete"
    );

    let (attempt, error_count) = sqlx::query_as::<_, (i32, Option<i32>)>(
        "SELECT attempt, array_length(errors, 1) FROM oban_jobs WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await?;

    assert_eq!(attempt, 1, "snooze must hand the attempt back");
    assert_none!(error_count);

    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn leadership_is_claimed_and_stolen_after_expiry() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;

    // Another node held the lease but its lease has lapsed.
    sqlx::query(
        "INSERT INTO oban_leaders (name, node, elected_at, expires_at) \
         VALUES ('oban', 'ghost', now() - interval '60 seconds', now() - interval '30 seconds')",
    )
    .execute(&pool)
    .await?;

    let oban = test_engine(pool.clone(), ()).queue("default", 1);
    let handle = oban.start().await?;

    assert!(
        eventually(Duration::from_secs(5), async || handle.is_leader()).await,
        "an expired lease should be stolen"
    );

    let (count, node) = sqlx::query_as::<_, (i64, String)>(
        "SELECT count(*), min(node) FROM oban_leaders",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(count, 1);
    assert_eq!(node, "test-node");

    // A clean shutdown resigns, so a successor claims without waiting out
    // the lease.
    handle.shutdown().await;

    let leaders = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM oban_leaders")
        .fetch_one(&pool)
        .await?;
    assert_eq!(leaders, 0);

    let successor = test_engine(pool.clone(), ())
        .node("successor")
        .queue("default", 1);
    let successor_handle = successor.start().await?;

    assert!(
        eventually(Duration::from_secs(5), async || successor_handle.is_leader()).await,
        "the successor should claim promptly"
    );

    successor_handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn lifeline_rescues_orphans_without_spending_attempts() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;

    // A job left executing by a node that no longer heartbeats.
    let orphan = sqlx::query_scalar::<_, i64>(
        "INSERT INTO oban_jobs (state, queue, worker, attempt, max_attempts, attempted_at, attempted_by) \
         VALUES ('executing', 'other', 'ghost_worker', 1, 3, now(), ARRAY['dead-node']) \
         RETURNING id",
    )
    .fetch_one(&pool)
    .await?;

    // One that already exhausted its budget cannot be retried.
    let exhausted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO oban_jobs (state, queue, worker, attempt, max_attempts, attempted_at, attempted_by) \
         VALUES ('executing', 'other', 'ghost_worker', 3, 3, now(), ARRAY['dead-node']) \
         RETURNING id",
    )
    .fetch_one(&pool)
    .await?;

    let oban = test_engine(pool.clone(), ())
        .lifeline(LifelineConfig {
            interval: Duration::from_secs(1),
            max_age: 5,
        })
        .queue("default", 1);

    let handle = oban.start().await?;

    assert!(
        eventually(Duration::from_secs(10), async || {
            job_state(&pool, orphan).await == "available"
        })
        .await,
        "the orphan should be rescued to available"
    );

    let (attempt, attempted_by) = sqlx::query_as::<_, (i32, Vec<String>)>(
        "SELECT attempt, attempted_by FROM oban_jobs WHERE id = $1",
    )
    .bind(orphan)
    .fetch_one(&pool)
    .await?;

    assert_eq!(attempt, 1, "rescue must not change the attempt");
    assert_eq!(attempted_by, vec!["dead-node".to_owned()]);

    assert_eq!(job_state(&pool, exhausted).await, "discarded");

    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn pruner_deletes_only_expired_terminal_jobs() -> anyhow::Result<()> {
    async fn insert_aged(pool: &PgPool, state: &str, ago: i64) -> anyhow::Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(&format!(
            "INSERT INTO oban_jobs (state, worker, {state}_at) \
             VALUES ('{state}', 'aged', now() - make_interval(secs => $1)) \
             RETURNING id"
        ))
        .bind(ago as f64)
        .fetch_one(pool)
        .await?;

        Ok(id)
    }

    let (pool, _container) = setup_test_db().await?;

    insert_aged(&pool, "completed", 61).await?;
    insert_aged(&pool, "cancelled", 61).await?;
    insert_aged(&pool, "discarded", 61).await?;

    let fresh_completed = insert_aged(&pool, "completed", 59).await?;
    let fresh_discarded = insert_aged(&pool, "discarded", 59).await?;
    let waiting = sqlx::query_scalar::<_, i64>(
        "INSERT INTO oban_jobs (state, worker, scheduled_at) \
         VALUES ('scheduled', 'aged', now() + interval '1 hour') RETURNING id",
    )
    .fetch_one(&pool)
    .await?;

    let oban = test_engine(pool.clone(), ())
        .pruner(PrunerConfig {
            interval: Duration::from_secs(1),
            max_age: 60,
            limit: 10_000,
        })
        .queue("default", 1);

    let handle = oban.start().await?;

    assert!(
        eventually(Duration::from_secs(10), async || {
            let count = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM oban_jobs")
                .fetch_one(&pool)
                .await
                .unwrap_or(i64::MAX);
            count == 3
        })
        .await,
        "expired terminal jobs should be pruned"
    );

    let survivors = sqlx::query_scalar::<_, i64>("SELECT id FROM oban_jobs ORDER BY id")
        .fetch_all(&pool)
        .await?;
    assert_eq!(survivors, vec![fresh_completed, fresh_discarded, waiting]);

    handle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn startup_rejects_invalid_configuration() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct BadCronJob;

    impl Worker for BadCronJob {
        const NAME: &'static str = "bad_cron";
        type Context = ();

        fn cron() -> Option<oban::CronSpec> {
            Some("not a cron".into())
        }

        async fn perform(&self, _ctx: Self::Context) -> anyhow::Result<Outcome> {
            Ok(Outcome::Done)
        }
    }

    // Lazy pools never connect, and validation fails before any query runs.
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgresql://postgres@localhost/oban_config_test")?;

    let zero_limit = Oban::new(pool.clone(), ()).queue("default", 0);
    assert!(matches!(
        zero_limit.start().await,
        Err(oban::Error::InvalidConfig(_))
    ));

    let blank_queue = Oban::new(pool.clone(), ()).queue("   ", 5);
    assert!(matches!(
        blank_queue.start().await,
        Err(oban::Error::InvalidConfig(_))
    ));

    let bad_cron = Oban::new(pool, ())
        .register::<BadCronJob>()
        .queue("default", 5);
    assert!(matches!(
        bad_cron.start().await,
        Err(oban::Error::InvalidCron { .. })
    ));

    Ok(())
}
