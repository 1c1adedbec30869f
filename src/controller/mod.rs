//! Event/Work-Queue Controller
//!
//! Turns watch notifications into keys on a [`WorkQueue`] and runs a fixed
//! pool of workers that hand each key to a [`Reconciler`]. This is the only
//! place that decides between retrying and dropping a key.
//!
//! Retry policy: a failed key is re-queued after `retry_delay` while its
//! retry count is below `max_retries`; beyond that it is forgotten, a
//! warning event is recorded, and it is only seen again on its next change
//! or the next resync.

pub mod events;
pub mod queue;

pub use events::{EventRecorder, EVENT_WARNING};
pub use queue::WorkQueue;

use crate::api::{Kind, ObjectKey};
use crate::config::ControllerConfig;
use crate::store::{ClusterApi, Selector, WatchEvent};
use crate::util::time::format_duration;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to do with a key after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Error: fmt::Display + Send + Sync + 'static;

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Self::Error>;
}

/// Timing and concurrency of one controller
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub workers: usize,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub resync: Option<Duration>,
    /// Delay between a watch notification and the enqueue
    pub event_delay: Duration,
}

impl ControllerSettings {
    /// Settings of the cluster-wide resource controllers
    pub fn operator(config: &ControllerConfig) -> Self {
        Self {
            workers: config.workers,
            retry_delay: config.retry_delay(),
            max_retries: config.max_retries,
            resync: config.resync(),
            event_delay: Duration::ZERO,
        }
    }

    /// Settings of a node agent: one worker, coalesced events
    pub fn agent(config: &ControllerConfig) -> Self {
        Self {
            workers: 1,
            event_delay: config.agent_event_delay(),
            ..Self::operator(config)
        }
    }
}

pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    client: Arc<dyn ClusterApi>,
    kind: Kind,
    selector: Selector,
    owned: Vec<Kind>,
    settings: ControllerSettings,
    recorder: Option<EventRecorder>,
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        reconciler: R,
        client: Arc<dyn ClusterApi>,
        kind: Kind,
        selector: Selector,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            client,
            kind,
            selector,
            owned: Vec::new(),
            settings,
            recorder: None,
            queue: WorkQueue::new(),
        }
    }

    /// Also trigger on changes to children of `kind`, keyed by their owner
    pub fn owns(mut self, kind: Kind) -> Self {
        self.owned.push(kind);
        self
    }

    /// Record a warning event when a key is dropped
    pub fn with_recorder(mut self, recorder: EventRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        Arc::clone(&self.queue)
    }

    /// Run until `shutdown` fires, then let in-flight passes finish
    pub async fn run(self, shutdown: CancellationToken) {
        let kind = self.kind;
        info!(
            "Starting {} controller with {} worker(s)",
            kind, self.settings.workers
        );

        let mut feeders = vec![self.spawn_primary_watch(), self.spawn_resync()];
        for owned in &self.owned {
            feeders.push(self.spawn_owned_watch(*owned));
        }

        let worker = Arc::new(Worker {
            reconciler: Arc::clone(&self.reconciler),
            queue: Arc::clone(&self.queue),
            kind,
            settings: self.settings.clone(),
            recorder: self.recorder.clone(),
        });
        let workers: Vec<JoinHandle<()>> = (0..self.settings.workers.max(1))
            .map(|_| {
                let worker = Arc::clone(&worker);
                tokio::spawn(async move { worker.run().await })
            })
            .collect();

        shutdown.cancelled().await;
        info!("Stopping {} controller", kind);
        for feeder in &feeders {
            feeder.abort();
        }
        self.queue.shutdown();
        for handle in workers {
            if let Err(e) = handle.await {
                error!("{} worker panicked: {}", kind, e);
            }
        }
        debug!("{} controller stopped", kind);
    }

    fn spawn_primary_watch(&self) -> JoinHandle<()> {
        let mut watcher = self.client.watch(self.kind, self.selector.clone());
        let queue = Arc::clone(&self.queue);
        let delay = self.settings.event_delay;
        tokio::spawn(async move {
            while let Some(event) = watcher.next().await {
                let key = event.object().key();
                debug!("watch: {} {}", event_name(&event), key);
                queue.add_after(key, delay);
            }
        })
    }

    fn spawn_owned_watch(&self, owned: Kind) -> JoinHandle<()> {
        let selector = Selector {
            namespace: self.selector.namespace.clone(),
            ..Default::default()
        };
        let mut watcher = self.client.watch(owned, selector);
        let queue = Arc::clone(&self.queue);
        let delay = self.settings.event_delay;
        let primary = self.kind;
        let filter = self.selector.clone();
        tokio::spawn(async move {
            while let Some(event) = watcher.next().await {
                let Some((kind, key)) = event.object().meta().owner_of() else {
                    continue;
                };
                let in_scope = filter.name.as_ref().map_or(true, |n| *n == key.name);
                if kind == primary && in_scope {
                    debug!("watch: {} {} -> {}", owned, event.object().key(), key);
                    queue.add_after(key, delay);
                }
            }
        })
    }

    /// Initial listing, then one full pass every resync period
    fn spawn_resync(&self) -> JoinHandle<()> {
        let client = Arc::clone(&self.client);
        let queue = Arc::clone(&self.queue);
        let kind = self.kind;
        let selector = self.selector.clone();
        let period = self.settings.resync;
        tokio::spawn(async move {
            loop {
                match client.list(kind, &selector).await {
                    Ok(objects) => {
                        debug!("resync: {} {} object(s)", objects.len(), kind);
                        for obj in objects {
                            queue.add(obj.key());
                        }
                    },
                    Err(e) => warn!("Failed to list {} objects: {}", kind, e),
                }
                match period {
                    Some(period) => tokio::time::sleep(period).await,
                    None => break,
                }
            }
        })
    }
}

fn event_name(event: &WatchEvent) -> &'static str {
    match event {
        WatchEvent::Added(_) => "added",
        WatchEvent::Modified(_) => "modified",
        WatchEvent::Deleted(_) => "deleted",
    }
}

struct Worker<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue<ObjectKey>>,
    kind: Kind,
    settings: ControllerSettings,
    recorder: Option<EventRecorder>,
}

impl<R: Reconciler> Worker<R> {
    async fn run(&self) {
        while let Some(key) = self.queue.get().await {
            let result = self.reconciler.reconcile(&key).await;
            self.handle(&key, result).await;
            self.queue.done(&key);
        }
    }

    async fn handle(&self, key: &ObjectKey, result: Result<Action, R::Error>) {
        match result {
            Ok(Action::Done) => {
                self.queue.forget(key);
            },
            Ok(Action::RequeueAfter(delay)) => {
                self.queue.forget(key);
                debug!(
                    "Re-evaluating {} {} in {}",
                    self.kind,
                    key,
                    format_duration(delay)
                );
                self.queue.add_after(key.clone(), delay);
            },
            Err(e) => {
                let retries = self.queue.num_requeues(key);
                if retries < self.settings.max_retries {
                    error!(
                        "Error reconciling {} {} (retry {}/{}): {}",
                        self.kind,
                        key,
                        retries + 1,
                        self.settings.max_retries,
                        e
                    );
                    self.queue
                        .add_rate_limited(key.clone(), self.settings.retry_delay);
                    return;
                }

                self.queue.forget(key);
                warn!(
                    "Dropping {} {} out of the queue after {} retries: {}",
                    self.kind, key, retries, e
                );
                if let Some(recorder) = &self.recorder {
                    recorder
                        .record(
                            self.kind,
                            key,
                            EVENT_WARNING,
                            "ReconcileFailed",
                            &e.to_string(),
                        )
                        .await;
                }
            },
        }
    }
}
