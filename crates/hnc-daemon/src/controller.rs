//! Controller: watch loop, worker pool and drain driver.
//!
//! The controller turns store notifications into queue entries and hands
//! queue entries to the [`HierarchyReconciler`]. Successful passes clear the
//! namespace's failure count and schedule the returned fan-out; failed passes
//! are re-queued with backoff.
//!
//! Two drivers share that logic:
//!
//! - [`Controller::run`] spawns `workers` tasks plus a watcher and runs until
//!   the shutdown future resolves.
//! - [`Controller::run_until_idle`] processes on the calling task until the
//!   queue has nothing ready, in flight or delayed. Used by the one-shot
//!   binary mode and the tests.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use hnc_core::{BackoffConfig, ExclusionPolicy, ExclusionSet, HncConfig};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::queue::WorkQueue;
use crate::reconciler::HierarchyReconciler;
use crate::store::{ObjectStore, StoreError, WatchEvent};

/// Upper bound on reconciliations in one [`Controller::run_until_idle`] call.
pub const DRAIN_PASS_LIMIT: usize = 10_000;

/// Controller errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControllerError {
    /// Listing namespaces for a resync failed.
    #[error("resync failed: {0}")]
    Resync(#[from] StoreError),

    /// The queue kept producing work past the drain limit.
    #[error("queue did not drain within {limit} reconciliations")]
    DrainLimitExceeded {
        /// Limit that was hit.
        limit: usize,
    },
}

/// Controller settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Number of worker tasks used by [`Controller::run`].
    pub workers: usize,
    /// Retry backoff for failed passes.
    pub backoff: BackoffConfig,
    /// Whether [`Controller::run`] starts with a full resync.
    pub resync_on_start: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::from_config(&HncConfig::default())
    }
}

impl ControllerConfig {
    /// Extracts controller settings from the configuration file.
    #[must_use]
    pub fn from_config(config: &HncConfig) -> Self {
        Self {
            workers: config.controller.workers.max(1),
            backoff: config.retry.clone(),
            resync_on_start: config.controller.resync_on_start,
        }
    }
}

/// Drives the reconciler from store notifications.
pub struct Controller {
    store: Arc<dyn ObjectStore>,
    reconciler: HierarchyReconciler,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("reconciler", &self.reconciler)
            .field("queue", &self.queue)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller over `store` with the given exclusion policy.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        policy: ExclusionPolicy,
        config: ControllerConfig,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(config.backoff.clone()));
        let reconciler = HierarchyReconciler::new(Arc::clone(&store), policy);
        Self {
            store,
            reconciler,
            queue,
            config,
        }
    }

    /// The work queue.
    #[must_use]
    pub const fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// The reconciler.
    #[must_use]
    pub const fn reconciler(&self) -> &HierarchyReconciler {
        &self.reconciler
    }

    /// Subscribes to the store's notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.store.subscribe()
    }

    /// Schedules one namespace.
    pub fn enqueue(&self, name: &str) {
        self.queue.add(name);
    }

    /// Schedules every namespace in the store and in the forest. Returns how
    /// many names were scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Resync`] if listing fails.
    pub async fn resync(&self) -> Result<usize, ControllerError> {
        let mut names = self.store.list_namespaces().await?;
        names.extend(self.reconciler.known_namespaces());
        names.sort_unstable();
        names.dedup();
        for name in &names {
            self.queue.add(name);
        }
        info!(count = names.len(), "Resync scheduled namespaces");
        Ok(names.len())
    }

    /// Replaces the exclusion set and resyncs so every namespace is judged
    /// against it.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Resync`] if listing fails. The new set is
    /// in effect either way.
    pub async fn set_exclusions(&self, set: ExclusionSet) -> Result<usize, ControllerError> {
        let previous = self.reconciler.policy().replace(set);
        for name in previous.excluded_names() {
            self.queue.add(name);
        }
        info!("Exclusion set replaced");
        self.resync().await
    }

    /// Waits for the next queued namespace and reconciles it. Returns `false`
    /// once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        match self.queue.get().await {
            Some(name) => {
                self.handle(&name).await;
                true
            },
            None => false,
        }
    }

    async fn handle(&self, name: &str) {
        match self.reconciler.reconcile(name).await {
            Ok(outcome) => {
                self.queue.forget(name);
                if !outcome.enqueue.is_empty() {
                    debug!(
                        namespace = %name,
                        fan_out = ?outcome.enqueue,
                        "Scheduling affected namespaces"
                    );
                }
                for other in &outcome.enqueue {
                    self.queue.add(other);
                }
            },
            Err(e) => {
                let delay = self.queue.add_rate_limited(name);
                warn!(
                    namespace = %name,
                    error = %e,
                    retry_in = ?delay,
                    attempt = self.queue.failures(name),
                    "Reconcile failed; will retry"
                );
            },
        }
        self.queue.done(name);
    }

    /// Moves every buffered notification into the queue. A lagged receiver
    /// triggers a resync.
    async fn pump(
        &self,
        events: &mut broadcast::Receiver<WatchEvent>,
    ) -> Result<(), ControllerError> {
        loop {
            match events.try_recv() {
                Ok(event) => self.queue.add(&event.name),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Watch lagged; resyncing");
                    self.resync().await?;
                },
                Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Processes on the calling task until the queue is idle. Returns the
    /// number of reconciliations performed.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Resync`] if a lag-triggered resync fails, or
    /// [`ControllerError::DrainLimitExceeded`] if the queue never settles.
    pub async fn run_until_idle(
        &self,
        events: &mut broadcast::Receiver<WatchEvent>,
    ) -> Result<usize, ControllerError> {
        let mut passes = 0;
        loop {
            self.pump(events).await?;
            let name = match self.queue.try_get() {
                Some(name) => name,
                None if self.queue.is_idle() => return Ok(passes),
                None => match self.queue.get().await {
                    Some(name) => name,
                    None => return Ok(passes),
                },
            };
            passes += 1;
            if passes > DRAIN_PASS_LIMIT {
                self.queue.done(&name);
                return Err(ControllerError::DrainLimitExceeded {
                    limit: DRAIN_PASS_LIMIT,
                });
            }
            self.handle(&name).await;
        }
    }

    /// Runs the watcher and the worker pool until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Resync`] if the startup resync fails.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()> + Send,
    {
        let mut events = self.subscribe();
        if self.config.resync_on_start {
            self.resync().await?;
        }

        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers {
            let controller = Arc::clone(&self);
            workers.spawn(async move {
                debug!(worker, "Worker started");
                while controller.process_next().await {}
                debug!(worker, "Worker stopped");
            });
        }
        info!(workers = self.config.workers, "Controller running");

        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                received = events.recv() => match received {
                    Ok(event) => self.queue.add(&event.name),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch lagged; resyncing");
                        if let Err(e) = self.resync().await {
                            warn!(error = %e, "Resync after lag failed");
                        }
                    },
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("Controller shutting down");
        self.queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Worker task failed");
            }
        }
        Ok(())
    }
}
