//! The leader-only retention plugin.
//!
//! Deletes completed, cancelled, and discarded jobs once their terminal
//! timestamp is older than the configured age. Deletion runs in small
//! batches so no single pass holds locks for long; the per-run limit is a
//! soft bound and may be exceeded briefly when backlogs are large.

use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::storage;

/// Batch size per delete statement.
const BATCH_SIZE: i64 = 1_000;

/// Retention configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunerConfig {
    /// How often a pruning pass runs.
    pub interval: Duration,
    /// Terminal rows older than this many seconds are deleted.
    pub max_age: u64,
    /// Maximum rows deleted per pass.
    pub limit: i64,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_age: 86_400,
            limit: 10_000,
        }
    }
}

pub(crate) struct Pruner {
    pub(crate) pool: PgPool,
    pub(crate) config: PrunerConfig,
    pub(crate) leadership: watch::Receiver<bool>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Pruner {
    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = tick.tick() => {
                    if *self.leadership.borrow() {
                        if let Err(error) = self.prune().await {
                            error!(%error, "Pruning pass failed");
                        }
                    }
                }
            }
        }
    }

    async fn prune(&self) -> Result<(), sqlx::Error> {
        let mut remaining = self.config.limit;
        let mut deleted_total = 0u64;

        while remaining > 0 {
            let batch = remaining.min(BATCH_SIZE);
            let deleted = storage::prune_jobs(&self.pool, self.config.max_age, batch).await?;

            deleted_total += deleted;
            remaining -= batch;

            if deleted < batch as u64 {
                break;
            }
        }

        if deleted_total > 0 {
            debug!(deleted = deleted_total, "Pruned expired jobs");
        }

        Ok(())
    }
}
