//! Leader election over the `oban_leaders` lease row.
//!
//! Every node tries to claim or renew the lease at half the lease interval.
//! A node is leader iff the row currently names it; fencing comes from the
//! expiry check inside the claim statement, so a paused or partitioned
//! leader loses the lease without any coordination beyond the database.

use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::storage;

pub(crate) struct Leader {
    pub(crate) pool: PgPool,
    pub(crate) name: String,
    pub(crate) node: String,
    pub(crate) lease: Duration,
    pub(crate) leadership: watch::Sender<bool>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl Leader {
    pub(crate) async fn run(mut self) {
        let mut renew = tokio::time::interval(self.lease / 2);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = renew.tick() => self.claim().await,
            }
        }

        if *self.leadership.borrow() {
            if let Err(error) = storage::resign_leadership(&self.pool, &self.name, &self.node).await
            {
                warn!(%error, "Failed to resign leadership");
            }
        }

        self.leadership.send_replace(false);
    }

    async fn claim(&self) {
        let lease_secs = self.lease.as_secs_f64();

        match storage::claim_leadership(&self.pool, &self.name, &self.node, lease_secs).await {
            Ok(is_leader) => {
                let was_leader = *self.leadership.borrow();

                if is_leader && !was_leader {
                    info!(node = %self.node, "Acquired cluster leadership");
                } else if !is_leader && was_leader {
                    info!(node = %self.node, "Lost cluster leadership");
                }

                self.leadership.send_replace(is_leader);
            }
            Err(error) => {
                // Without a confirmed renewal the lease may have lapsed, so
                // stop acting as leader until the next successful claim.
                error!(%error, "Leadership claim failed");
                self.leadership.send_replace(false);
            }
        }
    }
}
