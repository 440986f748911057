//! The per-(node, queue) producer: fetches available jobs up to its
//! concurrency budget, dispatches them to worker tasks, and acknowledges
//! results in batches.

use anyhow::anyhow;
use chrono::Utc;
use futures_util::FutureExt;
use serde_json::json;
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info_span, trace, warn};
use uuid::Uuid;

use crate::job_registry::{JobRegistry, RegisteredWorker, WorkerMeta};
use crate::schema::{ErrorRecord, Job, JobState};
use crate::storage::{self, Ack};
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use crate::worker::{Backoff, Outcome};

/// Fallback poll cadence when no notifications arrive.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How often the producer refreshes its heartbeat row.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub(crate) struct Producer<Context> {
    pub(crate) pool: PgPool,
    pub(crate) queue: String,
    pub(crate) limit: usize,
    pub(crate) node: String,
    pub(crate) uuid: Uuid,
    pub(crate) registry: Arc<JobRegistry<Context>>,
    pub(crate) context: Context,
    pub(crate) waker: Arc<Notify>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) drain_grace: Duration,
}

impl<Context: Clone + Send + Sync + 'static> Producer<Context> {
    /// Run the fetch/dispatch/ack loop until shutdown, then drain.
    pub(crate) async fn run(mut self) {
        let meta = json!({ "local_limit": self.limit });
        if let Err(error) =
            storage::insert_producer(&self.pool, self.uuid, &self.node, &self.queue, meta).await
        {
            error!(%error, queue = %self.queue, "Failed to register producer");
        }

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut in_flight: JoinSet<Ack> = JoinSet::new();
        let mut acks: Vec<Ack> = Vec::new();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = self.waker.notified() => {
                    trace!(queue = %self.queue, "Woken by notification");
                }
                _ = poll.tick() => {}
                _ = heartbeat.tick() => {
                    if let Err(error) = storage::touch_producer(&self.pool, self.uuid).await {
                        warn!(%error, queue = %self.queue, "Failed to refresh producer heartbeat");
                    }
                }
                Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                    collect(finished, &mut acks);

                    while let Some(finished) = in_flight.try_join_next() {
                        collect(finished, &mut acks);
                    }
                }
            }

            self.flush(&mut acks).await;

            let demand = self.limit.saturating_sub(in_flight.len());
            if demand == 0 {
                continue;
            }

            match storage::fetch_jobs(&self.pool, &self.queue, demand as i64, &self.node).await {
                Ok(jobs) => {
                    for job in jobs {
                        self.dispatch(job, &mut in_flight);
                    }
                }
                // Transient; the next tick retries.
                Err(error) => error!(%error, queue = %self.queue, "Failed to fetch jobs"),
            }
        }

        self.drain(in_flight, acks).await;
    }

    fn dispatch(&self, job: Job, in_flight: &mut JoinSet<Ack>) {
        let registered = self.registry.get(&job.worker).cloned();
        let context = self.context.clone();

        let span = info_span!(
            "job",
            job.id = %job.id,
            job.worker = %job.worker,
            job.queue = %job.queue,
            job.attempt = %job.attempt,
        );

        in_flight.spawn(execute(job, registered, context).instrument(span));
    }

    async fn flush(&self, acks: &mut Vec<Ack>) {
        if acks.is_empty() {
            return;
        }

        match storage::ack_jobs(&self.pool, acks).await {
            Ok(_) => acks.clear(),
            // Kept for the next flush; the rows stay executing until then.
            Err(error) => error!(%error, queue = %self.queue, "Failed to flush acknowledgements"),
        }
    }

    /// Stop fetching, wait out in-flight jobs up to the grace window, then
    /// abandon stragglers. Abandoned rows are left `executing` for the
    /// lifeline to rescue.
    async fn drain(self, mut in_flight: JoinSet<Ack>, mut acks: Vec<Ack>) {
        debug!(queue = %self.queue, in_flight = in_flight.len(), "Draining producer…");

        let deadline = tokio::time::Instant::now() + self.drain_grace;

        while !in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, in_flight.join_next()).await {
                Ok(Some(finished)) => collect(finished, &mut acks),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        queue = %self.queue,
                        abandoned = in_flight.len(),
                        "Jobs outlived the shutdown grace window",
                    );
                    in_flight.abort_all();
                    break;
                }
            }
        }

        self.flush(&mut acks).await;
        if !acks.is_empty() {
            self.flush(&mut acks).await;
        }

        if let Err(error) = storage::delete_producer(&self.pool, self.uuid).await {
            warn!(%error, queue = %self.queue, "Failed to delete producer row");
        }
    }
}

fn collect(finished: Result<Ack, JoinError>, acks: &mut Vec<Ack>) {
    match finished {
        Ok(ack) => acks.push(ack),
        Err(error) if error.is_cancelled() => {}
        Err(error) => error!(%error, "Job task failed to join"),
    }
}

async fn execute<Context: Clone + Send + Sync + 'static>(
    job: Job,
    registered: Option<RegisteredWorker<Context>>,
    context: Context,
) -> Ack {
    debug!("Running job…");

    let result = with_sentry_transaction(&job.worker, async || {
        let Some(registered) = &registered else {
            return Err(anyhow!("unknown worker {:?}", job.worker));
        };

        let run = (registered.run)(context, job.args.clone());
        let caught = AssertUnwindSafe(run).catch_unwind();

        let result = match registered.meta.timeout {
            Some(limit) => match tokio::time::timeout(limit, caught).await {
                Ok(result) => result,
                Err(_) => Ok(Err(anyhow!("job timed out after {}s", limit.as_secs()))),
            },
            None => caught.await,
        };

        result.unwrap_or_else(|panic| Err(try_to_extract_panic_info(&*panic)))
    })
    .await;

    assess(&job, registered.as_ref().map(|registered| &registered.meta), result)
}

/// Map a worker result onto the acknowledgement state machine.
fn assess(job: &Job, meta: Option<&WorkerMeta>, result: anyhow::Result<Outcome>) -> Ack {
    match result {
        Ok(Outcome::Done) => {
            debug!("Job completed");
            ack(job, JobState::Completed, None, None, false)
        }
        Ok(Outcome::Snooze(seconds)) => {
            debug!(seconds, "Job snoozed");
            let at = crate::job::add_delay(Utc::now(), Duration::from_secs(seconds));
            ack(job, JobState::Scheduled, None, Some(at), true)
        }
        Ok(Outcome::Cancel(reason)) => {
            debug!(%reason, "Job cancelled");
            let record = error_record(job, reason);
            ack(job, JobState::Cancelled, Some(record), None, false)
        }
        Ok(Outcome::Discard(reason)) => {
            debug!(%reason, "Job discarded");
            let record = error_record(job, reason);
            ack(job, JobState::Discarded, Some(record), None, false)
        }
        Err(error) => {
            warn!("Failed to run job: {error:#}");
            let record = error_record(job, format!("{error:#}"));

            if job.attempt < job.max_attempts {
                let backoff = meta
                    .map(|meta| (meta.backoff)(job.attempt))
                    .unwrap_or_else(|| Backoff::default().delay(job.attempt));
                let at = crate::job::add_delay(Utc::now(), backoff);

                ack(job, JobState::Retryable, Some(record), Some(at), false)
            } else {
                ack(job, JobState::Discarded, Some(record), None, false)
            }
        }
    }
}

fn ack(
    job: &Job,
    state: JobState,
    error: Option<ErrorRecord>,
    scheduled_at: Option<chrono::DateTime<Utc>>,
    restore_attempt: bool,
) -> Ack {
    Ack {
        id: job.id,
        state,
        error,
        scheduled_at,
        restore_attempt,
    }
}

fn error_record(job: &Job, error: String) -> ErrorRecord {
    ErrorRecord {
        attempt: job.attempt,
        at: Utc::now(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn executing_job(attempt: i32, max_attempts: i32) -> Job {
        Job {
            id: 7,
            state: JobState::Executing,
            queue: "default".to_owned(),
            worker: "test".to_owned(),
            args: json!({}),
            meta: json!({}),
            tags: Vec::new(),
            errors: Vec::new(),
            attempt,
            max_attempts,
            priority: 0,
            attempted_by: vec!["node".to_owned()],
            inserted_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            scheduled_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            attempted_at: Some(Utc::now()),
            completed_at: None,
            cancelled_at: None,
            discarded_at: None,
        }
    }

    #[test]
    fn success_acks_completed() {
        let ack = assess(&executing_job(1, 3), None, Ok(Outcome::Done));

        assert_eq!(ack.state, JobState::Completed);
        assert!(ack.error.is_none());
        assert!(!ack.restore_attempt);
    }

    #[test]
    fn snooze_reschedules_and_restores_the_attempt() {
        let ack = assess(&executing_job(1, 3), None, Ok(Outcome::Snooze(60)));

        assert_eq!(ack.state, JobState::Scheduled);
        assert!(ack.restore_attempt);
        assert!(ack.scheduled_at.is_some_and(|at| at > Utc::now()));
    }

    #[test]
    fn cancel_and_discard_record_the_reason() {
        let cancelled = assess(
            &executing_job(1, 3),
            None,
            Ok(Outcome::Cancel("not needed".to_owned())),
        );
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert_eq!(
            cancelled.error.expect("reason must be recorded").error,
            "not needed"
        );

        let discarded = assess(
            &executing_job(1, 3),
            None,
            Ok(Outcome::Discard("bad input".to_owned())),
        );
        assert_eq!(discarded.state, JobState::Discarded);
    }

    #[test]
    fn failure_with_attempts_remaining_schedules_a_retry() {
        let ack = assess(&executing_job(1, 3), None, Err(anyhow!("boom")));

        assert_eq!(ack.state, JobState::Retryable);
        assert!(ack.scheduled_at.is_some_and(|at| at > Utc::now()));

        let record = ack.error.expect("failure must be recorded");
        assert_eq!(record.attempt, 1);
        assert!(record.error.contains("boom"));
    }

    #[test]
    fn failure_on_the_last_attempt_discards() {
        let ack = assess(&executing_job(3, 3), None, Err(anyhow!("boom")));

        assert_eq!(ack.state, JobState::Discarded);
        assert!(ack.error.is_some());
    }

    #[test]
    fn single_attempt_jobs_discard_on_first_failure() {
        let ack = assess(&executing_job(1, 1), None, Err(anyhow!("boom")));

        assert_eq!(ack.state, JobState::Discarded);
    }
}
