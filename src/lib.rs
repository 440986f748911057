#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cron;
mod errors;
mod job;
mod job_registry;
mod leader;
mod lifeline;
mod notifier;
mod oban;
mod producer;
mod pruner;
/// Database schema definitions.
pub mod schema;
mod stager;
mod storage;
mod unique;
mod util;
mod worker;

/// Cron expression parsing and per-worker schedules.
pub use self::cron::{CronSpec, Expression};
/// Error type for engine and submission operations.
pub use self::errors::Error;
/// Job specs and their builder.
pub use self::job::{DEFAULT_QUEUE, NewJob, NewJobBuilder};
/// Orphan rescue configuration.
pub use self::lifeline::LifelineConfig;
/// The engine value, its handle, and its configuration.
pub use self::oban::{
    Configured, InsertResult, LeaderConfig, Oban, ObanHandle, ShutdownTrigger, Unconfigured,
};
/// Retention configuration.
pub use self::pruner::PrunerConfig;
/// Persisted row types.
pub use self::schema::{ErrorRecord, Job, JobState, setup_database};
/// Staging configuration.
pub use self::stager::StagerConfig;
/// Uniqueness specs for deduplicated inserts.
pub use self::unique::{UniqueField, UniqueSpec};
/// The worker contract.
pub use self::worker::{Backoff, Outcome, Worker};
