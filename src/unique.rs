//! The unique-insert protocol.
//!
//! A job may carry a [`UniqueSpec`] describing which of its fields make up
//! its identity. Before insertion the selected fields are canonically
//! serialized, hashed, and written into the job's meta as `uniq_key`
//! together with a `uniq_bmp` bitmap of the states in which an existing job
//! blocks a new one. The database exposes `uniq_key` through a stored
//! generated column only while the row's state is in the bitmap, and a
//! partial unique index enforces at-most-one live candidate. Enforcement
//! therefore lives in one place for the whole cluster, and lapses on its own
//! when a job leaves the group.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::errors::Error;
use crate::job::NewJob;
use crate::schema::JobState;

/// Job fields that can participate in the uniqueness fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniqueField {
    /// The worker identifier.
    Worker,
    /// The queue name.
    Queue,
    /// The user arguments, optionally filtered by `keys`.
    Args,
    /// The metadata object, optionally filtered by `keys`.
    Meta,
}

/// Declares how duplicate inserts of a job are collapsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueSpec {
    /// Fields hashed into the fingerprint.
    pub fields: Vec<UniqueField>,
    /// When non-empty, only these top-level entries of `args`/`meta` count.
    pub keys: Vec<String>,
    /// Bucket window in seconds. `None` deduplicates without a time bound.
    pub period: Option<u64>,
    /// States in which an existing job blocks a new insert.
    pub group: Vec<JobState>,
}

impl Default for UniqueSpec {
    fn default() -> Self {
        Self {
            fields: vec![UniqueField::Worker, UniqueField::Queue, UniqueField::Args],
            keys: Vec::new(),
            period: None,
            group: vec![
                JobState::Scheduled,
                JobState::Available,
                JobState::Executing,
                JobState::Retryable,
                JobState::Completed,
            ],
        }
    }
}

impl UniqueSpec {
    /// The default spec: one live job per `(worker, queue, args)`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the fingerprint to the given fields.
    pub fn by_fields(mut self, fields: impl IntoIterator<Item = UniqueField>) -> Self {
        self.fields = fields.into_iter().collect();
        self
    }

    /// Only consider the given top-level keys of `args`/`meta`.
    pub fn by_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Expire duplicates after `seconds`: collisions only occur within the
    /// same time bucket.
    pub fn within(mut self, seconds: u64) -> Self {
        self.period = Some(seconds.max(1));
        self
    }

    /// Override the states in which an existing job blocks a new one.
    pub fn in_states(mut self, group: impl IntoIterator<Item = JobState>) -> Self {
        self.group = group.into_iter().collect();
        self
    }

    /// Encode the group as sorted bit indexes over the non-suspended states.
    pub(crate) fn bitmap(&self) -> Vec<u8> {
        let mut bits: Vec<u8> = self.group.iter().filter_map(|state| state.uniq_bit()).collect();
        bits.sort_unstable();
        bits.dedup();
        bits
    }
}

/// Stamp `uniq_key` and `uniq_bmp` into the job's meta, if it has a spec.
///
/// The fingerprint timestamp is the job's `scheduled_at` when present so
/// that period buckets are stable for pre-scheduled work, falling back to
/// the insertion wall clock.
pub(crate) fn apply_unique_meta(job: &mut NewJob) -> Result<(), Error> {
    let Some(spec) = job.unique.clone() else {
        return Ok(());
    };

    let at = job.scheduled_at.unwrap_or_else(Utc::now);
    let key = fingerprint(&spec, job, at)?;
    let bitmap = spec.bitmap();

    job.meta.insert("uniq_key".to_owned(), Value::String(key));
    job.meta.insert(
        "uniq_bmp".to_owned(),
        Value::Array(bitmap.into_iter().map(Value::from).collect()),
    );

    Ok(())
}

/// Compute the canonical fingerprint for a job under a spec.
///
/// Canonical form: a JSON object of the selected fields serialized with
/// lexicographically ordered keys and no whitespace, hashed with SHA-256.
pub(crate) fn fingerprint(
    spec: &UniqueSpec,
    job: &NewJob,
    at: DateTime<Utc>,
) -> Result<String, Error> {
    let mut payload = Map::new();

    for field in &spec.fields {
        match field {
            UniqueField::Worker => {
                payload.insert("worker".to_owned(), Value::String(job.worker.clone()));
            }
            UniqueField::Queue => {
                payload.insert("queue".to_owned(), Value::String(job.queue.clone()));
            }
            UniqueField::Args => {
                payload.insert("args".to_owned(), filter_keys(&job.args, &spec.keys));
            }
            UniqueField::Meta => {
                let meta = Value::Object(job.meta.clone());
                payload.insert("meta".to_owned(), filter_keys(&meta, &spec.keys));
            }
        }
    }

    if let Some(period) = spec.period {
        let bucket = at.timestamp().div_euclid(period as i64);
        payload.insert("bucket".to_owned(), Value::from(bucket));
    }

    let canonical = serde_json::to_string(&Value::Object(payload))?;

    Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

fn filter_keys(value: &Value, keys: &[String]) -> Value {
    if keys.is_empty() {
        return value.clone();
    }

    match value {
        Value::Object(map) => {
            let filtered: Map<String, Value> = map
                .iter()
                .filter(|(key, _)| keys.contains(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();

            Value::Object(filtered)
        }
        other => other.clone(),
    }
}
