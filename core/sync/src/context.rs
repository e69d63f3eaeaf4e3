//! Application-facing handle that wires the sync core together.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use fieldsync_common::{Error, Result};
use fieldsync_storage::KeyValueStore;

use crate::cache::CacheStore;
use crate::coordinator::{PassEvent, SyncConfig, SyncCoordinator, SyncOutcome};
use crate::network::{NetworkMonitor, ReconnectHook};
use crate::observer::Subscription;
use crate::queue::{ActionKind, Payload, PendingAction, PendingActionQueue};
use crate::remote::RemoteEntityService;
use crate::scheduler::{SyncMode, SyncScheduler};
use crate::status::{Status, StatusPublisher, StatusTask};

/// The sync core, constructed once at startup and shared with consumers.
///
/// Holds no global state; every collaborator is injected.
pub struct SyncContext {
    network: Arc<NetworkMonitor>,
    cache: Arc<CacheStore>,
    queue: Arc<PendingActionQueue>,
    coordinator: Arc<SyncCoordinator>,
    status: Arc<StatusPublisher>,
    status_task: Mutex<Option<StatusTask>>,
    scheduler: Option<SyncScheduler>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    config: SyncConfig,
}

impl SyncContext {
    /// Build the sync core.
    ///
    /// Must be called from within a tokio runtime; reconnect syncs, periodic
    /// syncs and status updates run as tasks on it.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - No tokio runtime is running
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteEntityService>,
        network: Arc<NetworkMonitor>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::Sync(format!("No tokio runtime: {}", e)))?;

        let cache = Arc::new(CacheStore::new(store.clone()));
        let queue = Arc::new(PendingActionQueue::new(store)?);
        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            cache.clone(),
            network.clone(),
            remote,
            config.retry_policy()?,
        ));

        network.set_reconnect_hook(reconnect_hook(
            Arc::downgrade(&coordinator),
            runtime.clone(),
        ));

        let status = Arc::new(StatusPublisher::new(
            network.clone(),
            coordinator.clone(),
            cache.clone(),
            queue.clone(),
        ));
        let status_task = config.status_refresh.then(|| status.start(&runtime));

        let (scheduler, scheduler_task) = match config.sync_mode {
            SyncMode::Periodic { .. } => {
                let (scheduler, handle) = SyncScheduler::new(config.sync_mode.clone());
                let task = runtime.spawn(handle.run(coordinator.clone()));
                (Some(scheduler), Some(task))
            }
            SyncMode::Manual => (None, None),
        };

        info!("Sync core started ({:?})", config.sync_mode);

        Ok(Self {
            network,
            cache,
            queue,
            coordinator,
            status,
            status_task: Mutex::new(status_task),
            scheduler,
            scheduler_task: Mutex::new(scheduler_task),
            config,
        })
    }

    /// Subscribe to online/offline transitions.
    pub fn subscribe_to_network_status<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.network.subscribe(listener)
    }

    /// Subscribe to syncing transitions.
    pub fn subscribe_to_sync<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.coordinator.subscribe(listener)
    }

    /// Subscribe to pushed status updates.
    pub fn subscribe_to_status<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Status) + Send + Sync + 'static,
    {
        self.status.subscribe(listener)
    }

    /// Receive the report of every pass, including automatic ones.
    pub fn subscribe_to_passes(&self) -> broadcast::Receiver<PassEvent> {
        self.coordinator.subscribe_passes()
    }

    /// Run a sync pass now.
    pub async fn trigger_sync(&self) -> Result<SyncOutcome> {
        self.coordinator.trigger_sync().await
    }

    /// Queue a mutation for remote execution.
    pub async fn enqueue_action(
        &self,
        kind: ActionKind,
        payload: Payload,
    ) -> Result<PendingAction> {
        self.queue.enqueue(kind, payload).await
    }

    /// Pending actions in FIFO order.
    pub async fn get_pending_actions(&self) -> Result<Vec<PendingAction>> {
        self.queue.list().await
    }

    /// Remove a pending action. Returns whether it was present.
    pub async fn remove_pending_action(&self, id: &str) -> Result<bool> {
        self.queue.remove_by_id(id).await
    }

    /// Remove every pending action.
    pub async fn clear_pending_actions(&self) -> Result<usize> {
        self.queue.clear().await
    }

    /// Replace the cached collection for `kind`.
    pub async fn cache_entities<T: Serialize>(
        &self,
        kind: &str,
        items: &[T],
    ) -> Result<DateTime<Utc>> {
        self.cache.cache_entities(kind, items).await
    }

    /// Cached collection for `kind`.
    pub async fn get_cached_entities<T: DeserializeOwned>(&self, kind: &str) -> Vec<T> {
        self.cache.get_cached_entities(kind).await
    }

    /// When the last pass finished.
    pub async fn get_last_sync(&self) -> Option<DateTime<Utc>> {
        self.cache.last_sync().await
    }

    /// Current status, freshly computed.
    pub async fn get_status(&self) -> Result<Status> {
        self.status.get_status().await
    }

    /// Network monitor.
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// Cache.
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Pending-action queue.
    pub fn queue(&self) -> &Arc<PendingActionQueue> {
        &self.queue
    }

    /// Coordinator.
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Periodic scheduler, if running in periodic mode.
    pub fn scheduler(&self) -> Option<&SyncScheduler> {
        self.scheduler.as_ref()
    }

    /// Active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Stop background tasks. A pass already running finishes on its own.
    pub async fn shutdown(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown().await;
        }
        let scheduler_task = self
            .scheduler_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = scheduler_task {
            if let Err(e) = task.await {
                error!("Scheduler task ended abnormally: {}", e);
            }
        }

        self.status_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("Sync core stopped");
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        if let Some(task) = self
            .scheduler_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Reconnect hook that runs `trigger_sync` as a background task.
///
/// Holds the coordinator weakly so the monitor does not keep it alive.
fn reconnect_hook(coordinator: Weak<SyncCoordinator>, runtime: Handle) -> ReconnectHook {
    Arc::new(move || {
        let Some(coordinator) = coordinator.upgrade() else {
            return;
        };
        debug!("Network reconnected, triggering sync");
        runtime.spawn(async move {
            match coordinator.trigger_sync().await {
                Ok(SyncOutcome::Completed(report)) => {
                    info!(
                        "Reconnect sync completed: {} succeeded, {} retried, {} dropped",
                        report.succeeded,
                        report.retried,
                        report.dropped.len()
                    );
                }
                Ok(outcome) => debug!("Reconnect sync skipped: {:?}", outcome),
                Err(e) => error!("Reconnect sync failed: {}", e),
            }
        });
    })
}
