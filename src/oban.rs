//! The engine value: configuration, the submission API, and the supervisor
//! that runs producers, the leader loop, and the leader-gated plugins.

use futures_util::future::join_all;
use sqlx::PgPool;
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::errors::Error;
use crate::job::NewJob;
use crate::job_registry::JobRegistry;
use crate::leader::Leader;
use crate::lifeline::{Lifeline, LifelineConfig};
use crate::notifier::{NOTIFY_CHANNEL, Notifier, QueueNotification};
use crate::producer::Producer;
use crate::pruner::{Pruner, PrunerConfig};
use crate::schema::{Job, JobState};
use crate::stager::{CronEntry, Stager, StagerConfig};
use crate::storage;
use crate::unique::apply_unique_meta;
use crate::worker::Worker;

/// The lease row name shared by every node of a cluster.
const LEADER_NAME: &str = "oban";

/// How long producers wait for in-flight jobs on shutdown before abandoning
/// them to the lifeline.
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(15);

/// Leader election configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderConfig {
    /// Lease duration; renewal runs at half this interval.
    pub lease: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
        }
    }
}

/// Marker type for an engine with at least one queue configured.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;

/// Marker type for an engine without queues; it can insert but not start.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The result of inserting a job.
#[derive(Debug, Clone)]
pub struct InsertResult {
    /// The persisted row: the new job, or the colliding one on conflict.
    pub job: Job,
    /// Whether an existing job blocked this insert.
    pub conflicted: bool,
}

/// The engine value. Everything the components need is carried here
/// explicitly; there is no process-wide state.
pub struct Oban<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    pool: PgPool,
    context: Context,
    registry: JobRegistry<Context>,
    queues: HashMap<String, usize>,
    node: String,
    timezone: chrono_tz::Tz,
    stager: StagerConfig,
    pruner: PrunerConfig,
    lifeline: LifelineConfig,
    leader: LeaderConfig,
    drain_grace: Duration,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Send + Sync, State> std::fmt::Debug
    for Oban<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oban")
            .field("queues", &self.queues)
            .field("node", &self.node)
            .field("timezone", &self.timezone)
            .field("context", &self.context)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Oban<Context> {
    /// Create a new engine with the given connection pool and context.
    pub fn new(pool: PgPool, context: Context) -> Self {
        Self {
            pool,
            context,
            registry: JobRegistry::default(),
            queues: HashMap::new(),
            node: default_node(),
            timezone: chrono_tz::UTC,
            stager: StagerConfig::default(),
            pruner: PrunerConfig::default(),
            lifeline: LifelineConfig::default(),
            leader: LeaderConfig::default(),
            drain_grace: DEFAULT_DRAIN_GRACE,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Oban<Context, State> {
    /// Register a worker so its jobs can be executed and its cron schedule
    /// materialized.
    pub fn register<W: Worker<Context = Context>>(mut self) -> Self {
        self.registry.register::<W>();
        self
    }

    /// Run a producer for `queue` with the given concurrency limit.
    pub fn queue(mut self, queue: impl Into<String>, limit: usize) -> Oban<Context, Configured> {
        self.queues.insert(queue.into(), limit);

        Oban {
            pool: self.pool,
            context: self.context,
            registry: self.registry,
            queues: self.queues,
            node: self.node,
            timezone: self.timezone,
            stager: self.stager,
            pruner: self.pruner,
            lifeline: self.lifeline,
            leader: self.leader,
            drain_grace: self.drain_grace,
            _state: PhantomData,
        }
    }

    /// Override the node identifier recorded in `attempted_by` and producer
    /// rows. Defaults to the hostname and process id.
    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    /// Timezone used to evaluate cron expressions without their own zone.
    pub fn timezone(mut self, timezone: chrono_tz::Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Tune staging.
    pub fn stager(mut self, config: StagerConfig) -> Self {
        self.stager = config;
        self
    }

    /// Tune retention.
    pub fn pruner(mut self, config: PrunerConfig) -> Self {
        self.pruner = config;
        self
    }

    /// Tune orphan rescue.
    pub fn lifeline(mut self, config: LifelineConfig) -> Self {
        self.lifeline = config;
        self
    }

    /// Tune leader election.
    pub fn leader(mut self, config: LeaderConfig) -> Self {
        self.leader = config;
        self
    }

    /// How long producers wait for in-flight jobs on shutdown.
    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Insert a single job, honoring its uniqueness spec.
    pub async fn insert(&self, job: NewJob) -> Result<InsertResult, Error> {
        let mut job = job;
        apply_unique_meta(&mut job)?;

        let (job, conflicted) = storage::insert_job(&self.pool, &job).await?;

        if !conflicted && job.state == JobState::Available {
            let payload = QueueNotification::payload(&job.queue);

            if let Err(error) = storage::notify(&self.pool, NOTIFY_CHANNEL, &payload).await {
                // Producers poll as a fallback, so a lost wakeup only
                // delays the job.
                warn!(%error, queue = %job.queue, "Failed to notify after insert");
            }
        }

        Ok(InsertResult { job, conflicted })
    }

    /// Insert a batch of jobs in a single statement, with per-job conflict
    /// resolution.
    ///
    /// Results come back in input order; each entry carries the same
    /// `{job, conflicted}` shape as [`insert`](Self::insert).
    pub async fn insert_all(
        &self,
        jobs: impl IntoIterator<Item = NewJob>,
    ) -> Result<Vec<InsertResult>, Error> {
        let mut jobs: Vec<NewJob> = jobs.into_iter().collect();

        for job in &mut jobs {
            apply_unique_meta(job)?;
        }

        let results = storage::insert_jobs(&self.pool, &jobs).await?;

        let queues: BTreeSet<&str> = results
            .iter()
            .filter(|(job, conflicted)| !*conflicted && job.state == JobState::Available)
            .map(|(job, _)| job.queue.as_str())
            .collect();

        for queue in queues {
            let payload = QueueNotification::payload(queue);

            if let Err(error) = storage::notify(&self.pool, NOTIFY_CHANNEL, &payload).await {
                warn!(%error, queue, "Failed to notify after insert");
            }
        }

        Ok(results
            .into_iter()
            .map(|(job, conflicted)| InsertResult { job, conflicted })
            .collect())
    }

    /// Serialize a worker value and insert it with the worker's defaults.
    pub async fn enqueue<W: Worker>(&self, worker: &W) -> Result<InsertResult, Error> {
        self.insert(NewJob::from_worker(worker)?).await
    }
}

impl<Context: Clone + Send + Sync + 'static> Oban<Context, Configured> {
    /// Validate the configuration and start every component.
    ///
    /// Returns a handle used to observe leadership and to shut down. Fails
    /// loudly on invalid queues or unparsable cron expressions rather than
    /// running a partial engine.
    pub async fn start(&self) -> Result<ObanHandle, Error> {
        for (queue, limit) in &self.queues {
            if queue.trim().is_empty() {
                return Err(Error::invalid_config("queue names must not be blank"));
            }

            if *limit < 1 {
                return Err(Error::invalid_config(format!(
                    "queue {queue:?} limit must be positive"
                )));
            }
        }

        let mut crontab = Vec::new();
        for meta in self.registry.cron_workers() {
            if let Some(entry) = CronEntry::resolve(meta, self.timezone)? {
                crontab.push(entry);
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (leadership_tx, leadership_rx) = watch::channel(false);

        let wakers: HashMap<String, Arc<Notify>> = self
            .queues
            .keys()
            .map(|queue| (queue.clone(), Arc::new(Notify::new())))
            .collect();

        let notifier = Notifier::connect(&self.pool, wakers.clone()).await?;
        let registry = Arc::new(self.registry.clone());

        let mut handles = Vec::new();
        handles.push(tokio::spawn(notifier.run(shutdown_rx.clone())));

        for (queue, limit) in &self.queues {
            info!(queue = %queue, limit, "Starting producer…");

            let producer = Producer {
                pool: self.pool.clone(),
                queue: queue.clone(),
                limit: *limit,
                node: self.node.clone(),
                uuid: Uuid::new_v4(),
                registry: registry.clone(),
                context: self.context.clone(),
                waker: wakers[queue].clone(),
                shutdown: shutdown_rx.clone(),
                drain_grace: self.drain_grace,
            };

            let span = info_span!("producer", queue = %queue);
            handles.push(tokio::spawn(producer.run().instrument(span)));
        }

        let leader = Leader {
            pool: self.pool.clone(),
            name: LEADER_NAME.to_owned(),
            node: self.node.clone(),
            lease: self.leader.lease,
            leadership: leadership_tx,
            shutdown: shutdown_rx.clone(),
        };
        handles.push(tokio::spawn(leader.run()));

        let stager = Stager {
            pool: self.pool.clone(),
            config: self.stager,
            crontab,
            leadership: leadership_rx.clone(),
            shutdown: shutdown_rx.clone(),
        };
        handles.push(tokio::spawn(stager.run()));

        let pruner = Pruner {
            pool: self.pool.clone(),
            config: self.pruner,
            leadership: leadership_rx.clone(),
            shutdown: shutdown_rx.clone(),
        };
        handles.push(tokio::spawn(pruner.run()));

        let lifeline = Lifeline {
            pool: self.pool.clone(),
            config: self.lifeline,
            leadership: leadership_rx.clone(),
            shutdown: shutdown_rx,
        };
        handles.push(tokio::spawn(lifeline.run()));

        Ok(ObanHandle {
            shutdown: shutdown_tx,
            leadership: leadership_rx,
            handles,
        })
    }
}

/// Handle to a running engine.
#[derive(Debug)]
pub struct ObanHandle {
    shutdown: watch::Sender<bool>,
    leadership: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ObanHandle {
    /// Whether this node currently holds the cluster lease.
    pub fn is_leader(&self) -> bool {
        *self.leadership.borrow()
    }

    /// A watch that flips as leadership is gained or lost.
    pub fn leadership(&self) -> watch::Receiver<bool> {
        self.leadership.clone()
    }

    /// A cloneable trigger that signals shutdown from anywhere, such as a
    /// signal-handler task, while another task waits in
    /// [`wait_for_shutdown`](Self::wait_for_shutdown).
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Wait for every engine task to finish.
    ///
    /// This does not initiate shutdown: it returns once the components stop,
    /// however they were told to. Pair it with a
    /// [`shutdown_trigger`](Self::shutdown_trigger) held elsewhere, or call
    /// [`shutdown`](Self::shutdown) to signal and wait in one step.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Engine task panicked");
            }
        });
    }

    /// Signal every component to stop and wait for them to finish.
    ///
    /// Producers drain their in-flight jobs within the grace window and
    /// flush their remaining acknowledgements before returning.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.wait_for_shutdown().await;
    }
}

/// A cloneable handle that tells a running engine to begin shutting down.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    shutdown: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Signal every engine component to begin draining. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

fn default_node() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "oban".to_owned());

    format!("{host}-{}", std::process::id())
}
