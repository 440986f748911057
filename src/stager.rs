//! The leader-only scheduler plugin.
//!
//! Two duties on separate cadences: staging moves due `scheduled` and
//! `retryable` rows to `available` every second, and cron materialization
//! inserts recurring jobs at each minute boundary. Producers are woken
//! through the shared notification channel, locally and on every other node.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace};

use crate::cron::Expression;
use crate::errors::Error;
use crate::job::NewJob;
use crate::job_registry::WorkerMeta;
use crate::notifier::{NOTIFY_CHANNEL, QueueNotification};
use crate::schema::JobState;
use crate::storage;
use crate::unique::{UniqueField, UniqueSpec, apply_unique_meta};

/// Staging configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagerConfig {
    /// How often due jobs are staged.
    pub interval: Duration,
    /// Maximum rows staged per pass.
    pub limit: i64,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            limit: 20_000,
        }
    }
}

/// A cron worker with its expression parsed and its zone resolved.
pub(crate) struct CronEntry {
    pub(crate) worker: &'static str,
    pub(crate) queue: &'static str,
    pub(crate) priority: i16,
    pub(crate) max_attempts: i32,
    pub(crate) expression: Expression,
    pub(crate) timezone: Tz,
}

impl CronEntry {
    /// Resolve a worker's cron spec, falling back to the engine zone.
    ///
    /// Parse failures abort engine startup.
    pub(crate) fn resolve(meta: &WorkerMeta, default_timezone: Tz) -> Result<Option<Self>, Error> {
        let Some(spec) = &meta.cron else {
            return Ok(None);
        };

        Ok(Some(Self {
            worker: meta.name,
            queue: meta.queue,
            priority: meta.priority,
            max_attempts: meta.max_attempts,
            expression: Expression::parse(&spec.expr)?,
            timezone: spec.timezone.unwrap_or(default_timezone),
        }))
    }

    /// Build the job inserted for a matching minute.
    ///
    /// The uniqueness spec fingerprints `(worker, minute bucket)` across
    /// every state, so duplicate ticks and leader handovers within the same
    /// minute collapse into one row no matter what the first insert is
    /// doing by then.
    fn materialize(&self, minute: DateTime<Utc>) -> Result<NewJob, Error> {
        let unique = UniqueSpec::new()
            .by_fields([UniqueField::Worker])
            .within(60)
            .in_states([
                JobState::Scheduled,
                JobState::Available,
                JobState::Executing,
                JobState::Retryable,
                JobState::Completed,
                JobState::Cancelled,
                JobState::Discarded,
            ]);

        NewJob::builder(self.worker)
            .queue(self.queue)
            .priority(self.priority)
            .max_attempts(self.max_attempts)
            .scheduled_at(minute)
            .unique(unique)
            .build()
    }
}

pub(crate) struct Stager {
    pub(crate) pool: PgPool,
    pub(crate) config: StagerConfig,
    pub(crate) crontab: Vec<CronEntry>,
    pub(crate) leadership: watch::Receiver<bool>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Stager {
    pub(crate) async fn run(mut self) {
        let mut stage_tick = tokio::time::interval(self.config.interval);
        stage_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cron_sleep = Box::pin(tokio::time::sleep(duration_to_next_minute(Utc::now())));

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = stage_tick.tick() => {
                    if *self.leadership.borrow() {
                        if let Err(error) = self.stage().await {
                            error!(%error, "Staging pass failed");
                        }
                    }
                }
                _ = &mut cron_sleep => {
                    let now = Utc::now();

                    if *self.leadership.borrow() {
                        self.evaluate_cron(now).await;
                    }

                    cron_sleep
                        .as_mut()
                        .reset(tokio::time::Instant::now() + duration_to_next_minute(now));
                }
            }
        }
    }

    /// Move due jobs to `available` and wake the affected queues.
    async fn stage(&self) -> Result<(), sqlx::Error> {
        let queues = storage::stage_jobs(&self.pool, self.config.limit).await?;

        if queues.is_empty() {
            return Ok(());
        }

        trace!(staged = queues.len(), "Staged jobs");

        let queues: BTreeSet<String> = queues.into_iter().collect();

        for queue in queues {
            storage::notify(&self.pool, NOTIFY_CHANNEL, &QueueNotification::payload(&queue))
                .await?;
        }

        Ok(())
    }

    /// Insert one job per cron worker whose expression matches this minute.
    async fn evaluate_cron(&self, now: DateTime<Utc>) {
        let minute = truncate_to_minute(now);

        for entry in &self.crontab {
            let local = minute.with_timezone(&entry.timezone);

            if !entry.expression.matches(&local) {
                continue;
            }

            let job = match entry.materialize(minute) {
                Ok(mut job) => match apply_unique_meta(&mut job) {
                    Ok(()) => job,
                    Err(error) => {
                        error!(%error, worker = entry.worker, "Failed to fingerprint cron job");
                        continue;
                    }
                },
                Err(error) => {
                    error!(%error, worker = entry.worker, "Failed to build cron job");
                    continue;
                }
            };

            match storage::insert_job(&self.pool, &job).await {
                Ok((job, false)) => {
                    debug!(worker = entry.worker, job.id, "Materialized cron job");

                    let payload = QueueNotification::payload(&job.queue);
                    if let Err(error) = storage::notify(&self.pool, NOTIFY_CHANNEL, &payload).await
                    {
                        error!(%error, "Failed to notify after cron insert");
                    }
                }
                Ok((_, true)) => {
                    trace!(worker = entry.worker, "Cron job already materialized this minute");
                }
                Err(error) => {
                    error!(%error, worker = entry.worker, "Failed to insert cron job");
                }
            }
        }
    }
}

fn truncate_to_minute(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_second(0)
        .and_then(|time| time.with_nanosecond(0))
        .unwrap_or(time)
}

fn duration_to_next_minute(now: DateTime<Utc>) -> Duration {
    let next = truncate_to_minute(now) + chrono::Duration::minutes(1);

    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}
