//! The worker contract: the trait user code implements, the outcome it
//! returns, and the retry backoff policy.

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

use crate::cron::CronSpec;
use crate::job::DEFAULT_QUEUE;
use crate::unique::UniqueSpec;

/// What a worker decided about its job.
///
/// Raising an error from [`Worker::perform`] is not an outcome: errors are
/// recorded and retried until the attempt budget runs out, then the job is
/// discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The job succeeded and is complete.
    Done,
    /// Put the job back to `scheduled`, to run again after the given number
    /// of seconds. The attempt is not counted against the retry budget.
    Snooze(u64),
    /// Cancel the job. Terminal; the reason is recorded in `errors`.
    Cancel(String),
    /// Discard the job regardless of remaining attempts. Terminal.
    Discard(String),
}

/// Trait for defining background workers that can be enqueued and executed.
///
/// The implementing type is the job's argument payload: it is serialized on
/// enqueue and deserialized before each attempt.
pub trait Worker: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the worker.
    ///
    /// This MUST be unique for the whole application, and stable across
    /// deploys since it is persisted on job rows.
    const NAME: &'static str;

    /// Queue where this worker's jobs run.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// Retry budget for this worker's jobs.
    const MAX_ATTEMPTS: i32 = 20;

    /// Default priority, `0..=9`, lower is more urgent.
    const PRIORITY: i16 = 0;

    /// The application data provided to this worker at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Deduplication applied when this worker's jobs are inserted.
    fn unique() -> Option<UniqueSpec> {
        None
    }

    /// Recurring schedule. Jobs are materialized by the cluster leader for
    /// every matching minute.
    fn cron() -> Option<CronSpec> {
        None
    }

    /// Maximum execution time per attempt. Exceeding it counts as a failed
    /// attempt.
    fn timeout() -> Option<Duration> {
        None
    }

    /// Delay before a failed attempt becomes available again.
    fn backoff(attempt: i32) -> Duration {
        Backoff::default().delay(attempt)
    }

    /// Execute the job.
    fn perform(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<Outcome>> + Send;
}

/// Exponential backoff with jitter: `min(max, base * 2^(attempt-1))` plus a
/// uniform random `0..=base` seconds when jitter is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Base delay in seconds, also the jitter bound.
    pub base: u64,
    /// Upper clamp for the exponential term, in seconds.
    pub max: u64,
    /// Whether to add random jitter.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: 15,
            max: 86_400,
            jitter: true,
        }
    }
}

impl Backoff {
    /// The delay to apply after the given attempt number (1-based).
    pub fn delay(&self, attempt: i32) -> Duration {
        let attempt = attempt.max(1) as u32;
        let exponential = self
            .base
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(self.max);

        let jitter = if self.jitter {
            rand::thread_rng().gen_range(0..=self.base)
        } else {
            0
        };

        Duration::from_secs(capped.saturating_add(jitter))
    }
}
