//! Unified status derived from the network monitor, coordinator, cache and
//! queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fieldsync_common::Result;

use crate::cache::CacheStore;
use crate::coordinator::SyncCoordinator;
use crate::network::NetworkMonitor;
use crate::observer::{ObserverRegistry, Subscription};
use crate::queue::PendingActionQueue;

/// Snapshot of the sync core as seen by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Network is connected and reachable.
    pub is_online: bool,
    /// A sync pass is running.
    pub is_syncing: bool,
    /// When the last pass finished.
    pub last_sync: Option<DateTime<Utc>>,
    /// Actions waiting in the queue.
    pub pending_count: usize,
}

/// What prompted a recompute. Network and sync flips carry the transition
/// they report; queue changes are re-read from the store.
#[derive(Debug, Clone, Copy)]
enum Change {
    Network(bool),
    Syncing(bool),
    Queue,
}

impl Change {
    fn apply(self, status: &mut Status) {
        match self {
            Change::Network(online) => status.is_online = online,
            Change::Syncing(syncing) => status.is_syncing = syncing,
            Change::Queue => {}
        }
    }
}

/// Derives `Status` on demand and pushes it to subscribers after every
/// change.
pub struct StatusPublisher {
    network: Arc<NetworkMonitor>,
    coordinator: Arc<SyncCoordinator>,
    cache: Arc<CacheStore>,
    queue: Arc<PendingActionQueue>,
    listeners: ObserverRegistry<Status>,
}

impl StatusPublisher {
    /// Create a publisher over the core components.
    pub fn new(
        network: Arc<NetworkMonitor>,
        coordinator: Arc<SyncCoordinator>,
        cache: Arc<CacheStore>,
        queue: Arc<PendingActionQueue>,
    ) -> Self {
        Self {
            network,
            coordinator,
            cache,
            queue,
            listeners: ObserverRegistry::new("status"),
        }
    }

    /// Recompute the status.
    ///
    /// # Errors
    /// - The queue cannot be read
    pub async fn get_status(&self) -> Result<Status> {
        Ok(Status {
            is_online: self.network.is_online(),
            is_syncing: self.coordinator.is_syncing(),
            last_sync: self.cache.last_sync().await,
            pending_count: self.queue.len().await?,
        })
    }

    /// Subscribe to pushed status updates.
    ///
    /// Updates only flow while a `StatusTask` from `start` is alive.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Status) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Start pushing updates on network, sync and queue changes.
    ///
    /// Updates stop when the returned task is dropped.
    pub fn start(self: &Arc<Self>, runtime: &Handle) -> StatusTask {
        let (tx, rx) = mpsc::unbounded_channel();

        let network_tx = tx.clone();
        let sync_tx = tx.clone();
        let queue_tx = tx;

        let subscriptions = vec![
            self.network.subscribe(move |online| {
                let _ = network_tx.send(Change::Network(*online));
            }),
            self.coordinator.subscribe(move |syncing| {
                let _ = sync_tx.send(Change::Syncing(*syncing));
            }),
            self.queue.subscribe(move |_| {
                let _ = queue_tx.send(Change::Queue);
            }),
        ];

        let task = runtime.spawn(Self::publish_loop(Arc::downgrade(self), rx));

        StatusTask {
            _subscriptions: subscriptions,
            task,
        }
    }

    async fn publish_loop(publisher: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Change>) {
        while let Some(change) = rx.recv().await {
            let Some(publisher) = publisher.upgrade() else {
                break;
            };

            match publisher.get_status().await {
                Ok(mut status) => {
                    // Transitions are delivered in order, so the last one matches the source
                    change.apply(&mut status);
                    debug!("Publishing status after {:?}", change);
                    publisher.listeners.notify(&status);
                }
                Err(e) => warn!("Failed to recompute status after {:?}: {}", change, e),
            }
        }
    }
}

/// Background status publishing. Stops when dropped.
pub struct StatusTask {
    _subscriptions: Vec<Subscription>,
    task: JoinHandle<()>,
}

impl Drop for StatusTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}
