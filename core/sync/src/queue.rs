//! Durable FIFO queue of mutations awaiting remote execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use fieldsync_common::{Error, Result, StoreKey};
use fieldsync_storage::{get_json, set_json, KeyValueStore};

use crate::observer::{ObserverRegistry, Subscription};

/// Store key holding the queue snapshot.
pub const QUEUE_KEY: &str = "pending_actions";

/// Kind of mutation carried by a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Create a new remote entity.
    CreateEntity,
    /// Update an existing remote entity.
    UpdateEntity,
    /// Delete a remote entity.
    DeleteEntity,
    /// Start a server-side operation.
    InitiateRemoteOp,
}

impl ActionKind {
    /// Every kind, in declaration order.
    pub const ALL: [ActionKind; 4] = [
        ActionKind::CreateEntity,
        ActionKind::UpdateEntity,
        ActionKind::DeleteEntity,
        ActionKind::InitiateRemoteOp,
    ];

    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateEntity => "CreateEntity",
            ActionKind::UpdateEntity => "UpdateEntity",
            ActionKind::DeleteEntity => "DeleteEntity",
            ActionKind::InitiateRemoteOp => "InitiateRemoteOp",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    /// Accepts the canonical name as well as kebab or snake case
    /// (`update-entity`, `update_entity`).
    fn from_str(s: &str) -> Result<Self> {
        let folded: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();

        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().to_ascii_lowercase() == folded)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown action kind: {}", s)))
    }
}

/// Opaque action payload.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A locally originated mutation not yet confirmed by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Unique within the queue.
    pub id: String,
    /// What the action does.
    pub kind: ActionKind,
    /// Data the remote executor needs.
    pub payload: Payload,
    /// When the action was enqueued.
    pub created_at: DateTime<Utc>,
    /// Failed remote attempts so far.
    pub retry_count: u32,
}

/// Durable, ordered log of pending actions.
///
/// The whole queue is stored as one record. Every mutation loads the record,
/// modifies it and writes it back while holding the writer lock, so
/// overlapping mutations cannot lose each other's updates.
pub struct PendingActionQueue {
    store: Arc<dyn KeyValueStore>,
    key: StoreKey,
    write_lock: Mutex<()>,
    changes: ObserverRegistry<usize>,
}

impl PendingActionQueue {
    /// Create a queue over a key/value store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        Ok(Self {
            store,
            key: StoreKey::new(QUEUE_KEY)?,
            write_lock: Mutex::new(()),
            changes: ObserverRegistry::new("queue"),
        })
    }

    /// Subscribe to queue changes. The listener receives the new pending count.
    ///
    /// Counts are delivered in write order. The listener runs while the queue
    /// is locked for writing, so it must not wait on queue operations.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&usize) + Send + Sync + 'static,
    {
        self.changes.subscribe(listener)
    }

    /// Append a new action.
    ///
    /// # Errors
    /// - The queue record cannot be read or written
    pub async fn enqueue(&self, kind: ActionKind, payload: Payload) -> Result<PendingAction> {
        let action = PendingAction {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
        };

        let stored = action.clone();
        self.mutate(move |actions| {
            actions.push(stored);
            Ok(())
        })
        .await?;

        info!("Enqueued {} action {}", action.kind, action.id);
        Ok(action)
    }

    /// All pending actions in insertion order.
    ///
    /// # Errors
    /// - The queue record cannot be read or does not decode
    pub async fn list(&self) -> Result<Vec<PendingAction>> {
        self.load().await
    }

    /// Look up one action.
    pub async fn get(&self, id: &str) -> Result<Option<PendingAction>> {
        Ok(self.load().await?.into_iter().find(|a| a.id == id))
    }

    /// Number of pending actions.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.load().await?.len())
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove an action. Returns whether it was present.
    pub async fn remove_by_id(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let removed = self
            .mutate(move |actions| {
                let before = actions.len();
                actions.retain(|a| a.id != id);
                Ok(actions.len() != before)
            })
            .await?;
        Ok(removed)
    }

    /// Persist a new retry count for an action.
    ///
    /// # Errors
    /// - `NotFound` if no action has this id
    /// - `InvalidInput` if the count would decrease
    pub async fn update_retry_count(&self, id: &str, retry_count: u32) -> Result<()> {
        let id = id.to_string();
        self.mutate(move |actions| {
            let action = actions
                .iter_mut()
                .find(|a| a.id == id)
                .ok_or_else(|| Error::NotFound(format!("Pending action not found: {}", id)))?;

            if retry_count < action.retry_count {
                return Err(Error::InvalidInput(format!(
                    "Retry count of {} cannot go from {} to {}",
                    id, action.retry_count, retry_count
                )));
            }
            action.retry_count = retry_count;
            Ok(())
        })
        .await
    }

    /// Remove every action. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let cleared = self
            .mutate(|actions| {
                let n = actions.len();
                actions.clear();
                Ok(n)
            })
            .await?;

        if cleared > 0 {
            info!("Cleared {} pending actions", cleared);
        }
        Ok(cleared)
    }

    async fn load(&self) -> Result<Vec<PendingAction>> {
        Ok(get_json(self.store.as_ref(), &self.key)
            .await?
            .unwrap_or_default())
    }

    async fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Vec<PendingAction>) -> Result<R>,
    {
        let guard = self.write_lock.lock().await;

        let mut actions = self.load().await?;
        let result = f(&mut actions)?;
        set_json(self.store.as_ref(), &self.key, &actions).await?;

        let pending = actions.len();
        debug!("Queue persisted, {} pending", pending);

        // Delivered under the writer lock so counts arrive in write order
        self.changes.notify(&pending);
        drop(guard);
        Ok(result)
    }
}
