//! Work queue driving reconciliation passes.
//!
//! Keys enter the queue from three sources: store change events, the resync
//! ticker (every key, plus a manifest sync) and requeue timers. Passes for
//! different keys run concurrently. A key that is triggered while its pass is
//! running is marked dirty and runs again once that pass finished, so two
//! passes never overlap for the same resource. Each key holds at most one
//! pending requeue timer, and any other trigger for the key cancels it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;
use crate::manifest::ManifestSync;
use crate::reconciler::{Action, Reconciler};
use crate::resource::GroupKey;
use crate::store::MemoryStore;

/// Runs reconciliation passes until shutdown.
pub struct Controller {
    store: Arc<MemoryStore>,
    reconciler: Arc<Reconciler>,
    manifests: Option<ManifestSync>,
}

/// Queue bookkeeping owned by the run loop.
#[derive(Default)]
struct Queue {
    passes: JoinSet<Result<Action, ReconcileError>>,
    running: HashMap<Id, GroupKey>,
    in_flight: HashSet<GroupKey>,
    dirty: HashSet<GroupKey>,
    timers: JoinSet<GroupKey>,
    scheduled: HashMap<GroupKey, AbortHandle>,
}

impl Controller {
    pub fn new(store: Arc<MemoryStore>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            store,
            reconciler,
            manifests: None,
        }
    }

    /// Sync a manifest directory into the store on every resync.
    pub fn with_manifests(mut self, manifests: ManifestSync) -> Self {
        self.manifests = Some(manifests);
        self
    }

    /// Run until `shutdown` flips to true, then wait for running passes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let config = self.reconciler.config().clone();
        info!(
            resync_interval_secs = config.resync_interval.as_secs(),
            requeue_after_secs = config.requeue_after.as_secs(),
            concurrency = config.concurrency,
            "Starting controller"
        );

        let mut changes = self.store.subscribe();
        let mut resync = tokio::time::interval(config.resync_interval);
        let mut queue = Queue::default();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = resync.tick() => {
                    self.sync_manifests().await;
                    let keys = self.store.keys().await;
                    debug!(count = keys.len(), "Resync");
                    for key in keys {
                        self.enqueue(&mut queue, key);
                    }
                }
                event = changes.recv() => match event {
                    Ok(key) => self.enqueue(&mut queue, key),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Change events dropped, requeueing everything");
                        for key in self.store.keys().await {
                            self.enqueue(&mut queue, key);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Change feed closed");
                        break;
                    }
                },
                Some(fired) = queue.timers.join_next_with_id(), if !queue.timers.is_empty() => {
                    // Aborted timers and timers superseded after firing are ignored.
                    if let Ok((id, key)) = fired {
                        if queue.scheduled.get(&key).is_some_and(|timer| timer.id() == id) {
                            self.enqueue(&mut queue, key);
                        }
                    }
                }
                Some(joined) = queue.passes.join_next_with_id(), if !queue.passes.is_empty() => {
                    let id = match &joined {
                        Ok((id, _)) => *id,
                        Err(e) => e.id(),
                    };
                    let outcome = joined.map(|(_, result)| result);
                    self.finish(&mut queue, id, outcome, config.requeue_after);
                }
            }
        }

        info!(running = queue.passes.len(), "Stopping controller");
        queue.timers.abort_all();
        while queue.passes.join_next().await.is_some() {}
        info!("Controller stopped");
    }

    async fn sync_manifests(&mut self) {
        let Some(manifests) = self.manifests.as_mut() else {
            return;
        };
        match manifests.sync(&self.store).await {
            Ok(report) => debug!(
                applied = report.applied,
                deleted = report.deleted,
                skipped = report.skipped,
                "Manifests synced"
            ),
            Err(e) => warn!(error = %e, "Manifest sync failed"),
        }
    }

    fn enqueue(&self, queue: &mut Queue, key: GroupKey) {
        if let Some(timer) = queue.scheduled.remove(&key) {
            timer.abort();
        }
        if queue.in_flight.contains(&key) {
            queue.dirty.insert(key);
            return;
        }

        let reconciler = Arc::clone(&self.reconciler);
        let pass_key = key.clone();
        let handle = queue
            .passes
            .spawn(async move { reconciler.reconcile(&pass_key).await });
        queue.running.insert(handle.id(), key.clone());
        queue.in_flight.insert(key);
    }

    fn finish(
        &self,
        queue: &mut Queue,
        id: Id,
        outcome: Result<Result<Action, ReconcileError>, JoinError>,
        default_delay: Duration,
    ) {
        let Some(key) = queue.running.remove(&id) else {
            return;
        };
        queue.in_flight.remove(&key);

        let retry = match outcome {
            Ok(Ok(action)) => action.requeue_after,
            Ok(Err(e)) => {
                error!(group = %key, error = %e, "Reconciliation failed");
                Some(default_delay)
            }
            Err(e) => {
                error!(
                    group = %key,
                    outcome = task_outcome(&e),
                    "Reconciliation task did not finish"
                );
                Some(default_delay)
            }
        };

        if queue.dirty.remove(&key) {
            self.enqueue(queue, key);
        } else if let Some(delay) = retry {
            Self::schedule(queue, key, delay);
        }
    }

    /// Arm the requeue timer for `key` unless one is already pending.
    fn schedule(queue: &mut Queue, key: GroupKey, delay: Duration) {
        if queue.scheduled.contains_key(&key) {
            return;
        }
        debug!(group = %key, delay_secs = delay.as_secs(), "Requeue scheduled");
        let timer_key = key.clone();
        let timer = queue.timers.spawn(async move {
            tokio::time::sleep(delay).await;
            timer_key
        });
        queue.scheduled.insert(key, timer);
    }
}

fn task_outcome(e: &JoinError) -> &'static str {
    if e.is_panic() {
        "panicked"
    } else {
        "cancelled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_outcome_tells_panic_from_cancel() {
        let mut tasks: JoinSet<()> = JoinSet::new();
        tasks.spawn(async { panic!("pass blew up") });
        let Some(Err(panicked)) = tasks.join_next().await else {
            panic!("expected a join error");
        };
        assert_eq!(task_outcome(&panicked), "panicked");

        let pending = tasks.spawn(std::future::pending::<()>());
        pending.abort();
        let Some(Err(cancelled)) = tasks.join_next().await else {
            panic!("expected a join error");
        };
        assert_eq!(task_outcome(&cancelled), "cancelled");
    }
}
