/// Errors surfaced by the engine and the submission API.
///
/// Failures inside user job code are never represented here. Those are
/// recorded on the job row itself and drive the retry state machine instead.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An error bubbled up from the database driver.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema installation failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A job or its arguments could not be serialized to JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A job spec failed validation before insertion.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// A cron expression could not be parsed.
    #[error("invalid cron expression {input:?}: {reason}")]
    InvalidCron {
        /// The expression as given.
        input: String,
        /// Why parsing rejected it.
        reason: String,
    },

    /// The engine configuration is unusable and startup was aborted.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn invalid_job(message: impl Into<String>) -> Self {
        Self::InvalidJob(message.into())
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
