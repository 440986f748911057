//! The leader-only orphan rescue plugin.
//!
//! Jobs stuck in `executing` after their producer vanished are returned to
//! `available` without touching their attempt count, so a crash does not
//! consume retry budget beyond the attempt that was already underway. Stale
//! producer heartbeat rows are dropped in the same pass.

use sqlx::PgPool;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::notifier::{NOTIFY_CHANNEL, QueueNotification};
use crate::schema::JobState;
use crate::storage;

/// Orphan rescue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifelineConfig {
    /// How often orphans are looked for.
    pub interval: Duration,
    /// Producers silent for longer than this many seconds count as dead.
    pub max_age: u64,
}

impl Default for LifelineConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_age: 60,
        }
    }
}

pub(crate) struct Lifeline {
    pub(crate) pool: PgPool,
    pub(crate) config: LifelineConfig,
    pub(crate) leadership: watch::Receiver<bool>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Lifeline {
    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = tick.tick() => {
                    if *self.leadership.borrow() {
                        if let Err(error) = self.rescue().await {
                            error!(%error, "Lifeline pass failed");
                        }
                    }
                }
            }
        }
    }

    async fn rescue(&self) -> Result<(), sqlx::Error> {
        let rescued = storage::rescue_orphans(&self.pool, self.config.max_age).await?;

        if !rescued.is_empty() {
            info!(rescued = rescued.len(), "Rescued orphaned jobs");

            let queues: BTreeSet<&String> = rescued
                .iter()
                .filter(|(_, state)| *state == JobState::Available)
                .map(|(queue, _)| queue)
                .collect();

            for queue in queues {
                storage::notify(&self.pool, NOTIFY_CHANNEL, &QueueNotification::payload(queue))
                    .await?;
            }
        }

        storage::delete_stale_producers(&self.pool, self.config.max_age).await?;

        Ok(())
    }
}
