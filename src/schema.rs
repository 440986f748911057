//! Database schema definitions for SQLx.
//!
//! This module contains the row types backing the job system: the job
//! itself, the leader lease, and producer heartbeats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use sqlx::types::Json;

/// Lifecycle state of a job, mirroring the `oban_job_state` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "oban_job_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for its `scheduled_at` time to pass.
    Scheduled,
    /// Ready to be dispatched by a producer.
    Available,
    /// Currently running on some node.
    Executing,
    /// Failed, waiting out its backoff before becoming available again.
    Retryable,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempts or was discarded by the worker.
    Discarded,
    /// Cancelled by the worker or an operator.
    Cancelled,
    /// Reserved: held out of dispatch entirely.
    Suspended,
}

impl JobState {
    /// Whether the state is terminal. Terminal jobs are never re-dispatched.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Discarded | Self::Cancelled)
    }

    /// Bit index used by the uniqueness group bitmap.
    ///
    /// The order must stay in sync with the generated `uniq_key` column in
    /// the migration. `Suspended` is excluded from uniqueness entirely.
    pub(crate) fn uniq_bit(self) -> Option<u8> {
        match self {
            Self::Scheduled => Some(0),
            Self::Available => Some(1),
            Self::Executing => Some(2),
            Self::Retryable => Some(3),
            Self::Completed => Some(4),
            Self::Cancelled => Some(5),
            Self::Discarded => Some(6),
            Self::Suspended => None,
        }
    }
}

/// One recorded failure, appended to a job's `errors` array per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The attempt that produced this error.
    pub attempt: i32,
    /// When the error was recorded.
    pub at: DateTime<Utc>,
    /// The rendered error message.
    pub error: String,
}

/// A persisted job row.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Monotonic identifier assigned on insert.
    pub id: i64,
    /// Current lifecycle state.
    pub state: JobState,
    /// The queue this job is routed to.
    pub queue: String,
    /// Identifier resolved to executable code through the worker registry.
    pub worker: String,
    /// User-supplied arguments.
    pub args: Value,
    /// Engine bookkeeping, including uniqueness metadata.
    pub meta: Value,
    /// Normalized tags for grouping and filtering.
    pub tags: Vec<String>,
    /// Errors recorded on failed attempts, oldest first.
    pub errors: Vec<Json<ErrorRecord>>,
    /// Number of attempts made so far, counted on entry to `executing`.
    pub attempt: i32,
    /// Retry budget; the job is discarded once `attempt` reaches it.
    pub max_attempts: i32,
    /// Dispatch priority, lower is more urgent.
    pub priority: i16,
    /// Node identifiers that attempted this job, one per attempt.
    pub attempted_by: Vec<String>,
    /// When the row was inserted.
    pub inserted_at: DateTime<Utc>,
    /// When the job becomes eligible for staging.
    pub scheduled_at: DateTime<Utc>,
    /// When the job last entered `executing`.
    pub attempted_at: Option<DateTime<Utc>>,
    /// When the job completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the job was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// When the job was discarded.
    pub discarded_at: Option<DateTime<Utc>>,
}

/// The single-row leader lease in `oban_leaders`.
#[derive(Debug, Clone, FromRow)]
pub struct LeaderRow {
    /// Cluster name, the primary key. One lease per cluster.
    pub name: String,
    /// The node currently holding the lease.
    pub node: String,
    /// When the current holder was first elected.
    pub elected_at: DateTime<Utc>,
    /// When the lease lapses and becomes stealable.
    pub expires_at: DateTime<Utc>,
}

/// A producer heartbeat row in `oban_producers`.
#[derive(Debug, Clone, FromRow)]
pub struct ProducerRow {
    /// Unique identity of this producer instance.
    pub uuid: uuid::Uuid,
    /// The node the producer runs on.
    pub node: String,
    /// The queue the producer serves.
    pub queue: String,
    /// Operational metadata such as the local concurrency limit.
    pub meta: Value,
    /// When the producer started.
    pub started_at: DateTime<Utc>,
    /// Last heartbeat; stale values mark the producer's jobs as orphans.
    pub updated_at: DateTime<Utc>,
}

/// Install the schema into the connected database.
///
/// Runs the bundled migrations. Intended for tests and standalone
/// deployments; applications with their own migration pipeline can embed the
/// files under `migrations/` instead.
pub async fn setup_database(pool: &sqlx::PgPool) -> Result<(), crate::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
