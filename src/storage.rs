//! The SQL layer. Every statement the engine runs lives here.
//!
//! Row locking is the engine's only concurrency primitive: fetches take
//! `FOR UPDATE SKIP LOCKED` so producers never receive the same row twice,
//! and acknowledgements re-lock with `FOR UPDATE` so results for rows that
//! were rescued in the meantime are silently dropped.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::job::NewJob;
use crate::schema::{ErrorRecord, Job, JobState};

const JOB_COLUMNS: &str = "id, state, queue, worker, args, meta, tags, errors, \
     attempt, max_attempts, priority, attempted_by, inserted_at, scheduled_at, \
     attempted_at, completed_at, cancelled_at, discarded_at";

const UNIQ_INDEX: &str = "oban_jobs_uniq_key_index";

/// A single acknowledgement, flushed in batches by a producer.
#[derive(Debug, Clone)]
pub(crate) struct Ack {
    pub(crate) id: i64,
    pub(crate) state: JobState,
    pub(crate) error: Option<ErrorRecord>,
    pub(crate) scheduled_at: Option<DateTime<Utc>>,
    /// Snoozed jobs give the consumed attempt back.
    pub(crate) restore_attempt: bool,
}

/// Insert a job, resolving uniqueness conflicts against the partial index.
///
/// Returns the persisted row and whether it collided with an existing one.
/// The caller is expected to have stamped uniqueness metadata already.
pub(crate) async fn insert_job(pool: &PgPool, job: &NewJob) -> Result<(Job, bool), sqlx::Error> {
    let state = initial_state(job, Utc::now());

    let insert = format!(
        r"
        INSERT INTO oban_jobs
            (state, queue, worker, args, meta, tags, priority, max_attempts, scheduled_at)
        VALUES
            ($1, $2, $3, $4, $5, $6, $7, $8, coalesce($9, now()))
        RETURNING {JOB_COLUMNS}
        ",
    );

    // A colliding row can leave its uniqueness group between our failed
    // insert and the follow-up select. Retry the pair a few times rather
    // than reporting a phantom conflict.
    for _ in 0..3 {
        let inserted = sqlx::query_as::<_, Job>(&insert)
            .bind(state)
            .bind(&job.queue)
            .bind(&job.worker)
            .bind(&job.args)
            .bind(Value::Object(job.meta.clone()))
            .bind(&job.tags)
            .bind(job.priority)
            .bind(job.max_attempts)
            .bind(job.scheduled_at)
            .fetch_one(pool)
            .await;

        match inserted {
            Ok(row) => return Ok((row, false)),
            Err(error) if is_uniq_violation(&error) => {
                let uniq_key = job
                    .meta
                    .get("uniq_key")
                    .and_then(Value::as_str)
                    .unwrap_or_default();

                match fetch_job_by_uniq_key(pool, uniq_key).await? {
                    Some(existing) => return Ok((existing, true)),
                    None => continue,
                }
            }
            Err(error) => return Err(error),
        }
    }

    Err(sqlx::Error::RowNotFound)
}

async fn fetch_job_by_uniq_key(pool: &PgPool, uniq_key: &str) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM oban_jobs WHERE uniq_key = $1 LIMIT 1"
    ))
    .bind(uniq_key)
    .fetch_optional(pool)
    .await
}

fn is_uniq_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => {
            db_error.is_unique_violation() && db_error.constraint() == Some(UNIQ_INDEX)
        }
        _ => false,
    }
}

fn initial_state(job: &NewJob, now: DateTime<Utc>) -> JobState {
    match job.scheduled_at {
        Some(at) if at > now => JobState::Scheduled,
        _ => JobState::Available,
    }
}

fn meta_uniq_key(meta: &Value) -> Option<String> {
    meta.get("uniq_key")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Insert a batch of jobs in one statement, resolving uniqueness conflicts
/// per row.
///
/// Rows blocked by the partial index are skipped with `ON CONFLICT DO
/// NOTHING`; the colliders are then looked up in a single follow-up select.
/// Results come back in input order with the same `(job, conflicted)` shape
/// as [`insert_job`].
pub(crate) async fn insert_jobs(
    pool: &PgPool,
    jobs: &[NewJob],
) -> Result<Vec<(Job, bool)>, sqlx::Error> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let states: Vec<JobState> = jobs.iter().map(|job| initial_state(job, now)).collect();
    let queues: Vec<&str> = jobs.iter().map(|job| job.queue.as_str()).collect();
    let workers: Vec<&str> = jobs.iter().map(|job| job.worker.as_str()).collect();
    let args: Vec<Value> = jobs.iter().map(|job| job.args.clone()).collect();
    let metas: Vec<Value> = jobs
        .iter()
        .map(|job| Value::Object(job.meta.clone()))
        .collect();
    let tags: Vec<Value> = jobs.iter().map(|job| Value::from(job.tags.clone())).collect();
    let priorities: Vec<i16> = jobs.iter().map(|job| job.priority).collect();
    let max_attempts: Vec<i32> = jobs.iter().map(|job| job.max_attempts).collect();
    let scheduled_ats: Vec<Option<DateTime<Utc>>> =
        jobs.iter().map(|job| job.scheduled_at).collect();

    let inserted = sqlx::query_as::<_, Job>(&format!(
        r"
        WITH specs AS (
            SELECT *
            FROM unnest(
                $1::oban_job_state[], $2::text[], $3::text[], $4::jsonb[], $5::jsonb[],
                $6::jsonb[], $7::smallint[], $8::integer[], $9::timestamptz[]
            ) AS t(state, queue, worker, args, meta, tags, priority, max_attempts, scheduled_at)
        )
        INSERT INTO oban_jobs
            (state, queue, worker, args, meta, tags, priority, max_attempts, scheduled_at)
        SELECT state, queue, worker, args, meta,
               ARRAY(SELECT jsonb_array_elements_text(specs.tags)),
               priority, max_attempts, coalesce(scheduled_at, now())
        FROM specs
        ON CONFLICT (uniq_key) WHERE uniq_key IS NOT NULL DO NOTHING
        RETURNING {JOB_COLUMNS}
        ",
    ))
    .bind(&states)
    .bind(&queues)
    .bind(&workers)
    .bind(&args)
    .bind(&metas)
    .bind(&tags)
    .bind(&priorities)
    .bind(&max_attempts)
    .bind(&scheduled_ats)
    .fetch_all(pool)
    .await?;

    // Returned rows carry their fingerprint in meta, so fresh inserts match
    // back to inputs by key. Rows without one insert unconditionally and
    // come back in spec order.
    let mut fresh_by_key: HashMap<String, Vec<Job>> = HashMap::new();
    let mut keyless: VecDeque<Job> = VecDeque::new();

    for row in inserted {
        match meta_uniq_key(&row.meta) {
            Some(key) => fresh_by_key.entry(key).or_default().push(row),
            None => keyless.push_back(row),
        }
    }

    let mut results: Vec<Option<(Job, bool)>> = vec![None; jobs.len()];
    let mut unresolved: Vec<(usize, String)> = Vec::new();

    for (index, job) in jobs.iter().enumerate() {
        match job.meta.get("uniq_key").and_then(Value::as_str) {
            None => {
                let row = keyless.pop_front().ok_or(sqlx::Error::RowNotFound)?;
                results[index] = Some((row, false));
            }
            Some(key) => match fresh_by_key.get_mut(key).and_then(Vec::pop) {
                Some(row) => results[index] = Some((row, false)),
                None => unresolved.push((index, key.to_owned())),
            },
        }
    }

    if !unresolved.is_empty() {
        let keys: Vec<String> = unresolved.iter().map(|(_, key)| key.clone()).collect();

        let existing = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM oban_jobs WHERE uniq_key = ANY($1)"
        ))
        .bind(&keys)
        .fetch_all(pool)
        .await?;

        let existing_by_key: HashMap<String, Job> = existing
            .into_iter()
            .filter_map(|row| meta_uniq_key(&row.meta).map(|key| (key, row)))
            .collect();

        for (index, key) in unresolved {
            match existing_by_key.get(&key) {
                Some(row) => results[index] = Some((row.clone(), true)),
                // The collider left its group between the two statements;
                // retry this row alone.
                None => results[index] = Some(insert_job(pool, &jobs[index]).await?),
            }
        }
    }

    results
        .into_iter()
        .map(|result| result.ok_or(sqlx::Error::RowNotFound))
        .collect()
}

/// Lock up to `demand` available jobs for a queue and move them to
/// `executing`, stamping the attempt bookkeeping in the same statement.
///
/// Rows come back in dispatch order: `(priority, scheduled_at, id)`.
pub(crate) async fn fetch_jobs(
    pool: &PgPool,
    queue: &str,
    demand: i64,
    node: &str,
) -> Result<Vec<Job>, sqlx::Error> {
    let mut jobs = sqlx::query_as::<_, Job>(&format!(
        r"
        WITH candidates AS (
            SELECT id
            FROM oban_jobs
            WHERE state = 'available'
              AND queue = $1
              AND attempt < max_attempts
            ORDER BY priority ASC, scheduled_at ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE oban_jobs
        SET state = 'executing',
            attempt = attempt + 1,
            attempted_at = now(),
            attempted_by = array_append(attempted_by, $3)
        FROM candidates
        WHERE oban_jobs.id = candidates.id
        RETURNING {JOB_COLUMNS}
        ",
    ))
    .bind(queue)
    .bind(demand)
    .bind(node)
    .fetch_all(pool)
    .await?;

    // UPDATE ... RETURNING does not promise the CTE's ordering.
    jobs.sort_by(|a, b| {
        (a.priority, a.scheduled_at, a.id).cmp(&(b.priority, b.scheduled_at, b.id))
    });

    Ok(jobs)
}

/// Flush a batch of acknowledgements in one statement.
///
/// Only rows still `executing` are touched: anything rescued by the
/// lifeline in between keeps its rescued state and this producer's result
/// for it is discarded.
pub(crate) async fn ack_jobs(pool: &PgPool, acks: &[Ack]) -> Result<u64, sqlx::Error> {
    if acks.is_empty() {
        return Ok(0);
    }

    let ids: Vec<i64> = acks.iter().map(|ack| ack.id).collect();
    let states: Vec<JobState> = acks.iter().map(|ack| ack.state).collect();
    let errors: Vec<Option<Json<ErrorRecord>>> = acks
        .iter()
        .map(|ack| ack.error.clone().map(Json))
        .collect();
    let reschedules: Vec<Option<DateTime<Utc>>> = acks.iter().map(|ack| ack.scheduled_at).collect();
    let restores: Vec<bool> = acks.iter().map(|ack| ack.restore_attempt).collect();

    let result = sqlx::query(
        r"
        WITH acks AS (
            SELECT *
            FROM unnest($1::bigint[], $2::oban_job_state[], $3::jsonb[], $4::timestamptz[], $5::boolean[])
                AS t(id, next_state, error, reschedule_at, restore_attempt)
        ),
        locked AS (
            SELECT oban_jobs.id
            FROM oban_jobs
            JOIN acks USING (id)
            WHERE oban_jobs.state = 'executing'
            FOR UPDATE OF oban_jobs
        )
        UPDATE oban_jobs
        SET state = acks.next_state,
            attempt = CASE
                WHEN acks.restore_attempt THEN greatest(oban_jobs.attempt - 1, 0)
                ELSE oban_jobs.attempt
            END,
            errors = CASE
                WHEN acks.error IS NULL THEN oban_jobs.errors
                ELSE array_append(oban_jobs.errors, acks.error)
            END,
            scheduled_at = coalesce(acks.reschedule_at, oban_jobs.scheduled_at),
            completed_at = CASE WHEN acks.next_state = 'completed' THEN now() ELSE oban_jobs.completed_at END,
            cancelled_at = CASE WHEN acks.next_state = 'cancelled' THEN now() ELSE oban_jobs.cancelled_at END,
            discarded_at = CASE WHEN acks.next_state = 'discarded' THEN now() ELSE oban_jobs.discarded_at END
        FROM acks
        JOIN locked ON locked.id = acks.id
        WHERE oban_jobs.id = acks.id
        ",
    )
    .bind(&ids)
    .bind(&states)
    .bind(&errors)
    .bind(&reschedules)
    .bind(&restores)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Move due `scheduled`/`retryable` rows to `available`.
///
/// Returns the queues that gained work, with duplicates, for notify fan-out.
pub(crate) async fn stage_jobs(pool: &PgPool, limit: i64) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        r"
        WITH staged AS (
            SELECT id
            FROM oban_jobs
            WHERE state IN ('scheduled', 'retryable')
              AND scheduled_at <= now()
            ORDER BY scheduled_at ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE oban_jobs
        SET state = 'available'
        FROM staged
        WHERE oban_jobs.id = staged.id
        RETURNING oban_jobs.queue
        ",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Delete terminal rows whose terminal timestamp is older than `max_age`
/// seconds. Returns the number of rows deleted, at most `limit`.
pub(crate) async fn prune_jobs(pool: &PgPool, max_age: u64, limit: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        WITH expired AS (
            SELECT id
            FROM oban_jobs
            WHERE (state = 'completed' AND completed_at < now() - make_interval(secs => $1))
               OR (state = 'cancelled' AND cancelled_at < now() - make_interval(secs => $1))
               OR (state = 'discarded' AND discarded_at < now() - make_interval(secs => $1))
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        DELETE FROM oban_jobs
        USING expired
        WHERE oban_jobs.id = expired.id
        ",
    )
    .bind(max_age as f64)
    .bind(limit)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Rescue `executing` rows whose producer heartbeat is missing or stale.
///
/// Rescued rows go back to `available` with their attempt untouched, except
/// rows that already spent their whole budget, which are discarded with a
/// recorded rescue error. Returns `(queue, state)` per rescued row.
pub(crate) async fn rescue_orphans(
    pool: &PgPool,
    producer_max_age: u64,
) -> Result<Vec<(String, JobState)>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (String, JobState)>(
        r"
        WITH orphans AS (
            SELECT id
            FROM oban_jobs
            WHERE state = 'executing'
              AND NOT EXISTS (
                  SELECT 1
                  FROM oban_producers
                  WHERE oban_producers.queue = oban_jobs.queue
                    AND oban_producers.node = oban_jobs.attempted_by[array_length(oban_jobs.attempted_by, 1)]
                    AND oban_producers.updated_at > now() - make_interval(secs => $1)
              )
            FOR UPDATE SKIP LOCKED
        )
        UPDATE oban_jobs
        SET state = CASE
                WHEN attempt >= max_attempts THEN 'discarded'::oban_job_state
                ELSE 'available'::oban_job_state
            END,
            discarded_at = CASE WHEN attempt >= max_attempts THEN now() ELSE discarded_at END,
            errors = CASE
                WHEN attempt >= max_attempts THEN array_append(
                    errors,
                    jsonb_build_object(
                        'attempt', attempt,
                        'at', now(),
                        'error', 'orphaned with no attempts remaining'
                    )
                )
                ELSE errors
            END
        FROM orphans
        WHERE oban_jobs.id = orphans.id
        RETURNING oban_jobs.queue, oban_jobs.state
        ",
    )
    .bind(producer_max_age as f64)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Attempt to claim or renew the cluster lease. Returns whether `node` is
/// the leader afterwards.
///
/// The upsert only succeeds when the row is ours already or the previous
/// lease has lapsed, so exactly one node holds an unexpired lease.
pub(crate) async fn claim_leadership(
    pool: &PgPool,
    name: &str,
    node: &str,
    lease_secs: f64,
) -> Result<bool, sqlx::Error> {
    let claimed = sqlx::query_scalar::<_, String>(
        r"
        INSERT INTO oban_leaders (name, node, elected_at, expires_at)
        VALUES ($1, $2, now(), now() + make_interval(secs => $3))
        ON CONFLICT (name) DO UPDATE
        SET node = excluded.node,
            elected_at = now(),
            expires_at = now() + make_interval(secs => $3)
        WHERE oban_leaders.node = excluded.node
           OR oban_leaders.expires_at < now()
        RETURNING node
        ",
    )
    .bind(name)
    .bind(node)
    .bind(lease_secs)
    .fetch_optional(pool)
    .await?;

    Ok(claimed.as_deref() == Some(node))
}

/// Give up the lease if we hold it, forcing a prompt election elsewhere.
pub(crate) async fn resign_leadership(
    pool: &PgPool,
    name: &str,
    node: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM oban_leaders WHERE name = $1 AND node = $2")
        .bind(name)
        .bind(node)
        .execute(pool)
        .await?;

    Ok(())
}

/// Register a producer heartbeat row on startup.
pub(crate) async fn insert_producer(
    pool: &PgPool,
    uuid: Uuid,
    node: &str,
    queue: &str,
    meta: Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO oban_producers (uuid, node, queue, meta, started_at, updated_at)
        VALUES ($1, $2, $3, $4, now(), now())
        ",
    )
    .bind(uuid)
    .bind(node)
    .bind(queue)
    .bind(meta)
    .execute(pool)
    .await?;

    Ok(())
}

/// Refresh a producer's heartbeat.
pub(crate) async fn touch_producer(pool: &PgPool, uuid: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE oban_producers SET updated_at = now() WHERE uuid = $1")
        .bind(uuid)
        .execute(pool)
        .await?;

    Ok(())
}

/// Remove a producer row on clean shutdown.
pub(crate) async fn delete_producer(pool: &PgPool, uuid: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM oban_producers WHERE uuid = $1")
        .bind(uuid)
        .execute(pool)
        .await?;

    Ok(())
}

/// Drop heartbeat rows from producers that stopped without cleaning up.
pub(crate) async fn delete_stale_producers(
    pool: &PgPool,
    max_age: u64,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM oban_producers WHERE updated_at < now() - make_interval(secs => $1)")
            .bind(max_age as f64)
            .execute(pool)
            .await?;

    Ok(result.rows_affected())
}

/// Emit a notification on the shared channel.
pub(crate) async fn notify<'e, E: PgExecutor<'e>>(
    executor: E,
    channel: &str,
    payload: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel)
        .bind(payload)
        .execute(executor)
        .await?;

    Ok(())
}
