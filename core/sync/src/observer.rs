//! Typed observer registry with capability-style unsubscription.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::error;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Opaque handle identifying one subscription within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: SubscriptionId);
}

struct Inner<T> {
    name: &'static str,
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<SubscriptionId, Listener<T>>>,
}

impl<T: 'static> Detach for Inner<T> {
    fn detach(&self, id: SubscriptionId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Registry of listeners for values of type `T`.
///
/// Listeners are called synchronously, in subscription order, on the thread
/// that publishes. A panicking listener is logged and skipped; it stays
/// subscribed and the remaining listeners still receive the value.
pub struct ObserverRegistry<T> {
    inner: Arc<Inner<T>>,
}

impl<T: 'static> ObserverRegistry<T> {
    /// Create an empty registry. `name` only appears in logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Add a listener.
    ///
    /// The returned `Subscription` is the only way to remove it: call
    /// `unsubscribe` or drop the handle.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            registry: Some(weak as Weak<dyn Detach>),
        }
    }

    /// Deliver `value` to every listener.
    ///
    /// Returns the number of listeners that panicked.
    pub fn notify(&self, value: &T) -> usize {
        // Snapshot so listeners may subscribe or unsubscribe while being called
        let listeners: Vec<(SubscriptionId, Listener<T>)> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();

        let mut failures = 0;
        for (id, listener) in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                failures += 1;
                error!(
                    "{} listener {} panicked; continuing delivery",
                    self.inner.name, id
                );
            }
        }
        failures
    }

    /// Number of active listeners.
    pub fn len(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no listener is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unsubscribe capability returned by `ObserverRegistry::subscribe`.
///
/// Dropping the handle removes the listener.
#[must_use = "dropping a Subscription removes the listener"]
pub struct Subscription {
    id: SubscriptionId,
    registry: Option<Weak<dyn Detach>>,
}

impl Subscription {
    /// Identifier of this subscription.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|w| w.upgrade()) {
            registry.detach(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
