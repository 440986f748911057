//! Construction and validation of jobs before they are inserted.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::errors::Error;
use crate::unique::UniqueSpec;
use crate::worker::Worker;

/// The default queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// The default retry budget for new jobs.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 20;

/// A job spec: everything needed to insert a row, before the database has
/// assigned an identity.
///
/// Build one with [`NewJob::builder`], or from a [`Worker`] value with
/// [`NewJob::from_worker`] which fills in the worker's configured defaults.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Worker identifier, resolved through the registry at execution time.
    pub worker: String,
    /// Queue name.
    pub queue: String,
    /// User arguments, serialized as a JSON object.
    pub args: Value,
    /// Engine bookkeeping. Uniqueness metadata lands here on insert.
    pub meta: Map<String, Value>,
    /// Normalized tags.
    pub tags: Vec<String>,
    /// Dispatch priority, `0..=9`, lower is more urgent.
    pub priority: i16,
    /// Retry budget, at least 1.
    pub max_attempts: i32,
    /// When the job should become eligible. `None` means immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Optional deduplication spec applied on insert.
    pub unique: Option<UniqueSpec>,
}

impl NewJob {
    /// Start building a job for the named worker.
    pub fn builder(worker: impl Into<String>) -> NewJobBuilder {
        NewJobBuilder {
            job: NewJob {
                worker: worker.into(),
                queue: DEFAULT_QUEUE.to_owned(),
                args: Value::Object(Map::new()),
                meta: Map::new(),
                tags: Vec::new(),
                priority: 0,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                scheduled_at: None,
                unique: None,
            },
        }
    }

    /// Build a job spec from a worker value, applying the worker's
    /// configured queue, priority, retry budget, and uniqueness.
    pub fn from_worker<W: Worker>(worker: &W) -> Result<Self, Error> {
        let args = serde_json::to_value(worker)?;

        let mut builder = Self::builder(W::NAME)
            .queue(W::QUEUE)
            .priority(W::PRIORITY)
            .max_attempts(W::MAX_ATTEMPTS)
            .args(args);

        if let Some(unique) = W::unique() {
            builder = builder.unique(unique);
        }

        builder.build()
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.worker.trim().is_empty() {
            return Err(Error::invalid_job("worker must not be blank"));
        }

        if self.queue.trim().is_empty() {
            return Err(Error::invalid_job("queue must not be blank"));
        }

        if self.max_attempts < 1 {
            return Err(Error::invalid_job("max_attempts must be greater than 0"));
        }

        if !(0..=9).contains(&self.priority) {
            return Err(Error::invalid_job("priority must be between 0 and 9"));
        }

        Ok(())
    }
}

/// Builder for [`NewJob`]. Validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct NewJobBuilder {
    job: NewJob,
}

impl NewJobBuilder {
    /// Route the job to the named queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.job.queue = queue.into();
        self
    }

    /// Set the user arguments. Non-object values are accepted but uncommon.
    pub fn args(mut self, args: Value) -> Self {
        self.job.args = args;
        self
    }

    /// Merge a key into the job's metadata.
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.job.meta.insert(key.into(), value);
        self
    }

    /// Set the tags. They are normalized on build: trimmed, lowercased,
    /// deduplicated, and sorted.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the dispatch priority, `0..=9`.
    pub fn priority(mut self, priority: i16) -> Self {
        self.job.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.job.max_attempts = max_attempts;
        self
    }

    /// Run the job at a specific instant.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.job.scheduled_at = Some(at);
        self
    }

    /// Run the job after a delay from now. Overrides `scheduled_at`.
    pub fn schedule_in(mut self, delay: Duration) -> Self {
        self.job.scheduled_at = Some(add_delay(Utc::now(), delay));
        self
    }

    /// Deduplicate inserts according to the given spec.
    pub fn unique(mut self, spec: UniqueSpec) -> Self {
        self.job.unique = Some(spec);
        self
    }

    /// Validate and produce the job spec.
    pub fn build(mut self) -> Result<NewJob, Error> {
        self.job.tags = normalize_tags(&self.job.tags);
        self.job.validate()?;
        Ok(self.job)
    }
}

/// Saturating `now + delay`, clamped to the far end of the chrono range.
pub(crate) fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut tags: Vec<String> = tags
        .iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();

    tags.sort();
    tags.dedup();
    tags
}
