//! LISTEN/NOTIFY fan-in.
//!
//! One listener connection per engine subscribes to the shared channel and
//! wakes the local producer for whichever queue a notification names.
//! Notifications are purely an optimization: producers poll on a timer as
//! well, so lost or dropped messages only cost latency.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tracing::{debug, error};

/// The channel shared by all nodes of a cluster.
pub(crate) const NOTIFY_CHANNEL: &str = "oban_notify";

/// Wire format for queue wakeup notifications.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct QueueNotification {
    pub(crate) queue: String,
}

impl QueueNotification {
    pub(crate) fn payload(queue: &str) -> String {
        serde_json::to_string(&Self {
            queue: queue.to_owned(),
        })
        .unwrap_or_default()
    }
}

pub(crate) struct Notifier {
    listener: PgListener,
    wakers: HashMap<String, Arc<Notify>>,
}

impl Notifier {
    pub(crate) async fn connect(
        pool: &PgPool,
        wakers: HashMap<String, Arc<Notify>>,
    ) -> Result<Self, sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        Ok(Self { listener, wakers })
    }

    /// Forward notifications to local producers until shutdown.
    pub(crate) async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                message = self.listener.recv() => match message {
                    Ok(notification) => self.dispatch(notification.payload()),
                    Err(error) => {
                        // The listener reconnects on the next recv; producers
                        // keep polling in the meantime.
                        error!(%error, "Notification listener failed, reconnecting");
                    }
                }
            }
        }
    }

    fn dispatch(&self, payload: &str) {
        let parsed = serde_json::from_str::<QueueNotification>(payload);

        let Ok(notification) = parsed else {
            debug!(payload, "Ignoring malformed queue notification");
            return;
        };

        if let Some(waker) = self.wakers.get(&notification.queue) {
            waker.notify_one();
        }
    }
}
