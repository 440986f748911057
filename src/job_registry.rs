//! The process-local worker registry.
//!
//! Maps persisted worker names to the code that runs them plus the static
//! configuration the engine needs for cron materialization, uniqueness, and
//! backoff. User code writes it at startup through
//! [`Oban::register`](crate::Oban::register); the engine only reads it.

use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cron::CronSpec;
use crate::unique::UniqueSpec;
use crate::worker::{Outcome, Worker};

type RunFn<Context> =
    Arc<dyn Fn(Context, Value) -> BoxFuture<'static, anyhow::Result<Outcome>> + Send + Sync>;

/// Static configuration captured from a [`Worker`] implementation.
#[derive(Clone)]
pub(crate) struct WorkerMeta {
    pub(crate) name: &'static str,
    pub(crate) queue: &'static str,
    pub(crate) max_attempts: i32,
    pub(crate) priority: i16,
    pub(crate) cron: Option<CronSpec>,
    pub(crate) unique: Option<UniqueSpec>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) backoff: fn(i32) -> Duration,
}

/// A registered worker: its erased run function plus metadata.
pub(crate) struct RegisteredWorker<Context> {
    pub(crate) run: RunFn<Context>,
    pub(crate) meta: WorkerMeta,
}

impl<Context> Clone for RegisteredWorker<Context> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
            meta: self.meta.clone(),
        }
    }
}

pub(crate) struct JobRegistry<Context> {
    workers: HashMap<&'static str, RegisteredWorker<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            workers: self.workers.clone(),
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    pub(crate) fn register<W: Worker<Context = Context>>(&mut self) {
        let run: RunFn<Context> = Arc::new(|context, args| {
            let worker = serde_json::from_value::<W>(args);

            Box::pin(async move {
                let worker = worker?;
                worker.perform(context).await
            })
        });

        let meta = WorkerMeta {
            name: W::NAME,
            queue: W::QUEUE,
            max_attempts: W::MAX_ATTEMPTS,
            priority: W::PRIORITY,
            cron: W::cron(),
            unique: W::unique(),
            timeout: W::timeout(),
            backoff: W::backoff,
        };

        self.workers.insert(W::NAME, RegisteredWorker { run, meta });
    }

    pub(crate) fn get(&self, name: &str) -> Option<&RegisteredWorker<Context>> {
        self.workers.get(name)
    }

    /// Metadata for every worker carrying a cron spec.
    pub(crate) fn cron_workers(&self) -> impl Iterator<Item = &WorkerMeta> {
        self.workers
            .values()
            .map(|registered| &registered.meta)
            .filter(|meta| meta.cron.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct NoopWorker;

    impl Worker for NoopWorker {
        const NAME: &'static str = "noop";
        const QUEUE: &'static str = "quiet";
        const MAX_ATTEMPTS: i32 = 3;

        type Context = ();

        fn cron() -> Option<CronSpec> {
            Some("@hourly".into())
        }

        async fn perform(&self, _ctx: Self::Context) -> anyhow::Result<Outcome> {
            Ok(Outcome::Done)
        }
    }

    #[test]
    fn registration_captures_worker_metadata() {
        let mut registry = JobRegistry::<()>::default();
        registry.register::<NoopWorker>();

        let registered = registry.get("noop").expect("worker must be registered");
        assert_eq!(registered.meta.queue, "quiet");
        assert_eq!(registered.meta.max_attempts, 3);
        assert_eq!(registry.cron_workers().count(), 1);
    }

    #[tokio::test]
    async fn run_fn_deserializes_and_performs() {
        let mut registry = JobRegistry::<()>::default();
        registry.register::<NoopWorker>();

        let registered = registry.get("noop").expect("worker must be registered");
        let outcome = (registered.run)((), serde_json::json!(null)).await;

        assert_eq!(outcome.expect("perform must succeed"), Outcome::Done);
    }
}
