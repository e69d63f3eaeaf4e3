//! Sync coordinator: drains the pending-action queue against the remote
//! service with single-flight execution.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use fieldsync_common::{Error, Result};

use crate::cache::CacheStore;
use crate::network::NetworkMonitor;
use crate::observer::{ObserverRegistry, Subscription};
use crate::queue::{PendingAction, PendingActionQueue};
use crate::remote::RemoteEntityService;
use crate::retry::{RetryDecision, RetryPolicy, DEFAULT_MAX_RETRIES};
use crate::scheduler::SyncMode;

const PASS_CHANNEL_CAPACITY: usize = 16;

/// Configuration for the sync core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Failed attempts before an action is dropped.
    pub max_retries: u32,
    /// Sync mode.
    pub sync_mode: SyncMode,
    /// Whether status subscribers get pushed updates.
    pub status_refresh: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            sync_mode: SyncMode::Manual,
            status_refresh: true,
        }
    }
}

impl SyncConfig {
    /// Check the configuration.
    ///
    /// # Errors
    /// - `max_retries` is zero
    /// - Periodic mode with a zero interval
    pub fn validate(&self) -> Result<()> {
        self.retry_policy()?;
        if let SyncMode::Periodic { interval } = self.sync_mode {
            if interval.is_zero() {
                return Err(Error::InvalidInput(
                    "Periodic sync interval must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Retry policy derived from `max_retries`.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(self.max_retries)
    }
}

/// Coordinator state. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No pass running.
    Idle,
    /// A pass is running.
    Syncing,
}

/// An action removed after exhausting its retry budget.
#[derive(Debug, Clone, Serialize)]
pub struct DroppedAction {
    /// The action as it was before the final attempt.
    pub action: PendingAction,
    /// Failed attempts, including the final one.
    pub attempts: u32,
    /// Error from the final attempt.
    pub last_error: String,
}

/// Result of one completed sync pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Actions attempted.
    pub attempted: usize,
    /// Actions confirmed by the remote and removed.
    pub succeeded: usize,
    /// Actions kept for the next pass.
    pub retried: usize,
    /// Actions permanently dropped.
    pub dropped: Vec<DroppedAction>,
    /// Queue writes that failed during the pass.
    pub persistence_errors: usize,
    /// Wall time of the pass.
    pub duration: Duration,
    /// When the pass finished. Also written as the last sync time.
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    /// Whether every attempted action succeeded.
    pub fn is_clean(&self) -> bool {
        self.succeeded == self.attempted && self.persistence_errors == 0
    }
}

/// What a `trigger_sync` call did.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// A pass ran to completion.
    Completed(SyncReport),
    /// Another pass was already running; nothing was done.
    AlreadySyncing,
    /// The device is offline; nothing was done.
    Offline,
}

/// Published after every pass.
#[derive(Debug, Clone)]
pub enum PassEvent {
    /// The pass completed.
    Completed(SyncReport),
    /// The pass stopped on a persistence failure.
    Failed {
        /// Error description.
        error: String,
    },
}

/// Drains the pending-action queue.
///
/// At most one pass runs at a time: the syncing flag is claimed atomically
/// before the first suspension point, and every automatic trigger goes
/// through `trigger_sync`.
pub struct SyncCoordinator {
    queue: Arc<PendingActionQueue>,
    cache: Arc<CacheStore>,
    network: Arc<NetworkMonitor>,
    remote: Arc<dyn RemoteEntityService>,
    policy: RetryPolicy,
    syncing: AtomicBool,
    transitions: Mutex<()>,
    listeners: ObserverRegistry<bool>,
    passes: broadcast::Sender<PassEvent>,
}

/// Returns the coordinator to Idle when the pass ends, however it ends.
struct SyncingGuard<'a> {
    coordinator: &'a SyncCoordinator,
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        let _transition = self.coordinator.lock_transitions();
        self.coordinator.syncing.store(false, Ordering::Release);
        self.coordinator.listeners.notify(&false);
    }
}

impl SyncCoordinator {
    /// Create a coordinator.
    pub fn new(
        queue: Arc<PendingActionQueue>,
        cache: Arc<CacheStore>,
        network: Arc<NetworkMonitor>,
        remote: Arc<dyn RemoteEntityService>,
        policy: RetryPolicy,
    ) -> Self {
        let (passes, _) = broadcast::channel(PASS_CHANNEL_CAPACITY);
        Self {
            queue,
            cache,
            network,
            remote,
            policy,
            syncing: AtomicBool::new(false),
            transitions: Mutex::new(()),
            listeners: ObserverRegistry::new("sync"),
            passes,
        }
    }

    /// Subscribe to syncing transitions. The listener receives the new flag.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Receive an event after every pass.
    pub fn subscribe_passes(&self) -> broadcast::Receiver<PassEvent> {
        self.passes.subscribe()
    }

    /// Whether a pass is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Current phase.
    pub fn phase(&self) -> SyncPhase {
        if self.is_syncing() {
            SyncPhase::Syncing
        } else {
            SyncPhase::Idle
        }
    }

    /// Retry policy in use.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run one sync pass unless one is running or the device is offline.
    ///
    /// Remote failures never surface here; they go through the retry policy
    /// and appear in the report.
    ///
    /// # Errors
    /// - The queue cannot be read
    /// - The last sync time cannot be written
    pub async fn trigger_sync(&self) -> Result<SyncOutcome> {
        if self.is_syncing() {
            debug!("Sync already in progress");
            return Ok(SyncOutcome::AlreadySyncing);
        }
        if self.network.is_offline() {
            debug!("Sync skipped while offline");
            return Ok(SyncOutcome::Offline);
        }
        let guard = {
            // Flag flips are delivered under the same lock, in order
            let _transition = self.lock_transitions();
            if self
                .syncing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                debug!("Sync already in progress");
                return Ok(SyncOutcome::AlreadySyncing);
            }
            self.listeners.notify(&true);
            SyncingGuard { coordinator: self }
        };

        let result = self.run_pass().await;
        drop(guard);

        match &result {
            Ok(report) => {
                let _ = self.passes.send(PassEvent::Completed(report.clone()));
            }
            Err(e) => {
                error!("Sync pass failed: {}", e);
                let _ = self.passes.send(PassEvent::Failed {
                    error: e.to_string(),
                });
            }
        }

        result.map(SyncOutcome::Completed)
    }

    fn lock_transitions(&self) -> std::sync::MutexGuard<'_, ()> {
        self.transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_pass(&self) -> Result<SyncReport> {
        let start = Instant::now();
        let actions = self.queue.list().await?;

        info!("Starting sync pass with {} pending actions", actions.len());

        let mut report = SyncReport {
            attempted: 0,
            succeeded: 0,
            retried: 0,
            dropped: Vec::new(),
            persistence_errors: 0,
            duration: Duration::ZERO,
            finished_at: Utc::now(),
        };

        for action in actions {
            report.attempted += 1;

            match self.execute(&action).await {
                Ok(()) => {
                    report.succeeded += 1;
                    match self.queue.remove_by_id(&action.id).await {
                        Ok(_) => debug!("Action {} synced", action.id),
                        Err(e) => {
                            // Stays queued and will be delivered again
                            error!("Failed to remove synced action {}: {}", action.id, e);
                            report.persistence_errors += 1;
                        }
                    }
                }
                Err(reason) => self.handle_failure(action, reason, &mut report).await,
            }
        }

        let finished_at = Utc::now();
        self.cache.set_last_sync(finished_at).await?;

        report.duration = start.elapsed();
        report.finished_at = finished_at;

        info!(
            "Sync pass completed in {:?}: {} succeeded, {} retried, {} dropped",
            report.duration,
            report.succeeded,
            report.retried,
            report.dropped.len()
        );

        Ok(report)
    }

    /// Execute one action, treating a panic like an error.
    async fn execute(&self, action: &PendingAction) -> std::result::Result<(), String> {
        match AssertUnwindSafe(self.remote.execute_action(action))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("remote executor panicked".to_string()),
        }
    }

    async fn handle_failure(
        &self,
        action: PendingAction,
        reason: String,
        report: &mut SyncReport,
    ) {
        match self.policy.on_failure(action.retry_count) {
            RetryDecision::Retry { retry_count } => {
                warn!(
                    "Action {} ({}) failed, attempt {} of {}: {}",
                    action.id, action.kind, retry_count, self.policy.max_retries, reason
                );
                match self.queue.update_retry_count(&action.id, retry_count).await {
                    Ok(()) => report.retried += 1,
                    Err(Error::NotFound(_)) => {
                        debug!("Action {} was removed during the pass", action.id);
                    }
                    Err(e) => {
                        error!("Failed to persist retry count for {}: {}", action.id, e);
                        report.persistence_errors += 1;
                    }
                }
            }
            RetryDecision::Drop { attempts } => {
                // Still queued with its last retry count, so the next failure
                // drops it again and a success delivers it normally
                if let Err(e) = self.queue.remove_by_id(&action.id).await {
                    error!(
                        "Failed to remove action {} after {} failed attempts: {}",
                        action.id, attempts, e
                    );
                    report.persistence_errors += 1;
                    return;
                }

                error!(
                    "Dropped action {} ({}) after {} failed attempts: {}; payload: {}",
                    action.id,
                    action.kind,
                    attempts,
                    reason,
                    serde_json::Value::Object(action.payload.clone())
                );
                report.dropped.push(DroppedAction {
                    action,
                    attempts,
                    last_error: reason,
                });
            }
        }
    }
}
