//! Sync scheduling - manual and periodic modes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use fieldsync_common::{Error, Result};

use crate::coordinator::{SyncCoordinator, SyncOutcome};

const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Sync only on reconnect or explicit request.
    Manual,
    /// Also sync at regular intervals.
    Periodic { interval: Duration },
}

enum SchedulerRequest {
    Sync(oneshot::Sender<Result<SyncOutcome>>),
    Shutdown,
}

/// Client side of the scheduler task.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: SyncMode,
    request_tx: mpsc::Sender<SchedulerRequest>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs it.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Configured mode.
    pub fn mode(&self) -> &SyncMode {
        &self.mode
    }

    /// Ask the scheduler task to trigger a sync and wait for the outcome.
    ///
    /// # Errors
    /// - The scheduler task is not running
    /// - The triggered pass failed
    pub async fn request_sync(&self) -> Result<SyncOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(SchedulerRequest::Sync(response_tx))
            .await
            .map_err(|_| Error::Sync("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Sync("Failed to receive sync outcome".to_string()))?
    }

    /// Stop the scheduler task.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: SyncMode,
    request_rx: mpsc::Receiver<SchedulerRequest>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler until shutdown or until every `SyncScheduler` is
    /// dropped. Spawn this on the runtime.
    ///
    /// Timer ticks and requests both go through
    /// `SyncCoordinator::trigger_sync`.
    pub async fn run(mut self, coordinator: Arc<SyncCoordinator>) {
        let mut ticker = match &self.mode {
            SyncMode::Periodic { interval } => {
                let mut ticker = interval_at(Instant::now() + *interval, *interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Some(ticker)
            }
            SyncMode::Manual => None,
        };

        info!("Sync scheduler started ({:?})", self.mode);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some(SchedulerRequest::Sync(response_tx)) => {
                            debug!("Processing sync request");
                            let _ = response_tx.send(coordinator.trigger_sync().await);
                        }
                        Some(SchedulerRequest::Shutdown) => {
                            info!("Received shutdown request");
                            break;
                        }
                        None => {
                            debug!("All scheduler clients dropped");
                            break;
                        }
                    }
                }

                _ = Self::wait_for_tick(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    match coordinator.trigger_sync().await {
                        Ok(SyncOutcome::Completed(report)) => {
                            info!(
                                "Periodic sync completed: {} succeeded, {} retried, {} dropped",
                                report.succeeded,
                                report.retried,
                                report.dropped.len()
                            );
                        }
                        Ok(outcome) => debug!("Periodic sync skipped: {:?}", outcome),
                        Err(e) => error!("Periodic sync failed: {}", e),
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    async fn wait_for_tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::coordinator::PassEvent;
    use crate::network::{NetworkMonitor, NetworkState};
    use crate::queue::{ActionKind, PendingAction, PendingActionQueue, Payload};
    use crate::remote::RemoteEntityService;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use fieldsync_storage::{KeyValueStore, MemoryStore};

    struct AlwaysOk;

    #[async_trait]
    impl RemoteEntityService for AlwaysOk {
        async fn execute_action(&self, _action: &PendingAction) -> Result<()> {
            Ok(())
        }
    }

    fn coordinator() -> (Arc<SyncCoordinator>, Arc<PendingActionQueue>) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let queue = Arc::new(PendingActionQueue::new(store.clone()).unwrap());
        let coordinator = SyncCoordinator::new(
            queue.clone(),
            Arc::new(CacheStore::new(store)),
            Arc::new(NetworkMonitor::new(NetworkState::online(None))),
            Arc::new(AlwaysOk),
            RetryPolicy::default(),
        );
        (Arc::new(coordinator), queue)
    }

    #[tokio::test]
    async fn test_request_sync_runs_a_pass() {
        let (coordinator, queue) = coordinator();
        queue.enqueue(ActionKind::CreateEntity, Payload::new()).await.unwrap();

        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let task = tokio::spawn(handle.run(coordinator));

        let outcome = scheduler.request_sync().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(ref r) if r.succeeded == 1));
        assert!(queue.is_empty().await.unwrap());

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_after_shutdown_fails() {
        let (coordinator, _queue) = coordinator();
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let task = tokio::spawn(handle.run(coordinator));

        scheduler.shutdown().await;
        task.await.unwrap();

        assert!(matches!(scheduler.request_sync().await, Err(Error::Sync(_))));
    }

    #[tokio::test]
    async fn test_periodic_mode_triggers_passes() {
        let (coordinator, _queue) = coordinator();
        let mut passes = coordinator.subscribe_passes();

        let (scheduler, handle) = SyncScheduler::new(SyncMode::Periodic {
            interval: Duration::from_millis(20),
        });
        let task = tokio::spawn(handle.run(coordinator));

        let event = tokio::time::timeout(Duration::from_secs(5), passes.recv())
            .await
            .expect("periodic pass")
            .unwrap();
        assert!(matches!(event, PassEvent::Completed(_)));

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_clients_stops_the_task() {
        let (coordinator, _queue) = coordinator();
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let task = tokio::spawn(handle.run(coordinator));

        drop(scheduler);
        task.await.unwrap();
    }
}
