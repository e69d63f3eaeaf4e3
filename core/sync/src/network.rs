//! Connectivity tracking.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use fieldsync_common::Result;

use crate::observer::{ObserverRegistry, Subscription};

/// Raw connectivity signals reported by the platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    /// A network interface is up.
    pub is_connected: bool,
    /// The remote service is reachable over it.
    pub is_reachable: bool,
    /// Transport in use (e.g. "wifi", "cellular").
    pub transport_type: Option<String>,
    /// Platform-specific details, passed through untouched.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl NetworkState {
    /// Connected and reachable over the given transport.
    pub fn online(transport_type: Option<&str>) -> Self {
        Self {
            is_connected: true,
            is_reachable: true,
            transport_type: transport_type.map(String::from),
            details: serde_json::Value::Null,
        }
    }

    /// No connectivity.
    pub fn offline() -> Self {
        Self::default()
    }

    /// Online means connected and reachable.
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_reachable
    }
}

/// Platform connectivity API.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Read the current connectivity state.
    async fn probe(&self) -> Result<NetworkState>;
}

/// Probe returning whatever state it was last given.
#[derive(Default)]
pub struct StaticProbe {
    state: Mutex<NetworkState>,
}

impl StaticProbe {
    /// Create a probe reporting `state`.
    pub fn new(state: NetworkState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Change the reported state.
    pub fn set(&self, state: NetworkState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn probe(&self) -> Result<NetworkState> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Callback run on every offline to online transition.
pub type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Tracks online/offline state and notifies listeners on transitions.
///
/// Transitions are delivered in the order they were applied. Listeners may
/// read the monitor but must not call `update` from inside the callback.
pub struct NetworkMonitor {
    state: Mutex<NetworkState>,
    transitions: Mutex<()>,
    listeners: ObserverRegistry<bool>,
    reconnect_hook: Mutex<Option<ReconnectHook>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
}

impl NetworkMonitor {
    /// Create a monitor starting from `initial`.
    pub fn new(initial: NetworkState) -> Self {
        Self {
            state: Mutex::new(initial),
            transitions: Mutex::new(()),
            listeners: ObserverRegistry::new("network"),
            reconnect_hook: Mutex::new(None),
            probe: None,
        }
    }

    /// Create a monitor backed by a platform probe.
    ///
    /// The monitor starts offline until the first `refresh`.
    pub fn with_probe(probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self {
            probe: Some(probe),
            ..Self::new(NetworkState::offline())
        }
    }

    /// Subscribe to transitions. The listener receives the new online flag.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Install the callback run on offline to online transitions.
    pub fn set_reconnect_hook(&self, hook: ReconnectHook) {
        *self
            .reconnect_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Last observed state.
    pub fn state(&self) -> NetworkState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the last observed state is online.
    pub fn is_online(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_online()
    }

    /// Whether the last observed state is offline.
    pub fn is_offline(&self) -> bool {
        !self.is_online()
    }

    /// Apply a newly observed state.
    ///
    /// Listeners are notified only when the online flag changes. Returns
    /// whether a transition happened.
    pub fn update(&self, next: NetworkState) -> bool {
        // Held until delivery ends so concurrent updates cannot reorder
        let _transition = self
            .transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let (was_online, now_online) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let was = state.is_online();
            let now = next.is_online();
            *state = next;
            (was, now)
        };

        if was_online == now_online {
            debug!("Network state refreshed, online={}", now_online);
            return false;
        }

        if now_online {
            info!("Network: online");
        } else {
            warn!("Network: offline");
        }

        self.listeners.notify(&now_online);

        if !was_online && now_online {
            self.fire_reconnect();
        }
        true
    }

    /// Poll the probe and apply its state.
    ///
    /// # Errors
    /// - Probe failure; the last observed state is kept
    pub async fn refresh(&self) -> Result<bool> {
        let Some(probe) = self.probe.as_ref() else {
            return Ok(false);
        };
        let state = probe.probe().await?;
        Ok(self.update(state))
    }

    fn fire_reconnect(&self) {
        let hook = self
            .reconnect_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(hook) = hook {
            if panic::catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                error!("Reconnect hook panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_online_requires_connected_and_reachable() {
        let mut state = NetworkState::online(Some("wifi"));
        assert!(state.is_online());

        state.is_reachable = false;
        assert!(!state.is_online());
        assert!(!NetworkState::offline().is_online());
    }

    #[test]
    fn test_listeners_get_transitions_only() {
        let monitor = NetworkMonitor::new(NetworkState::offline());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        let _sub = monitor.subscribe(move |online| s.lock().unwrap().push(*online));

        assert!(monitor.update(NetworkState::online(Some("wifi"))));
        assert!(!monitor.update(NetworkState::online(Some("cellular"))));
        assert!(monitor.update(NetworkState::offline()));

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
        assert!(monitor.is_offline());
    }

    #[test]
    fn test_reconnect_hook_fires_on_false_to_true() {
        let monitor = NetworkMonitor::new(NetworkState::online(None));
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        monitor.set_reconnect_hook(Arc::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        monitor.update(NetworkState::offline());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        monitor.update(NetworkState::online(None));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let monitor = NetworkMonitor::new(NetworkState::offline());
        let delivered = Arc::new(AtomicUsize::new(0));

        let _bad = monitor.subscribe(|_| panic!("ui crashed"));
        let d = delivered.clone();
        let _good = monitor.subscribe(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });

        monitor.update(NetworkState::online(None));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(monitor.is_online());
    }

    #[test]
    fn test_last_delivered_matches_final_state_under_contention() {
        for _ in 0..50 {
            let monitor = Arc::new(NetworkMonitor::new(NetworkState::offline()));
            let last = Arc::new(Mutex::new(None));

            let l = last.clone();
            let _sub = monitor.subscribe(move |online| *l.lock().unwrap() = Some(*online));

            let threads: Vec<_> = (0..8)
                .map(|i| {
                    let monitor = monitor.clone();
                    std::thread::spawn(move || {
                        for j in 0..20 {
                            if (i + j) % 2 == 0 {
                                monitor.update(NetworkState::online(None));
                            } else {
                                monitor.update(NetworkState::offline());
                            }
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }

            let delivered = *last.lock().unwrap();
            if let Some(online) = delivered {
                assert_eq!(online, monitor.is_online());
            }
        }
    }

    #[test]
    fn test_listener_may_read_state() {
        let monitor = Arc::new(NetworkMonitor::new(NetworkState::offline()));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let m = Arc::downgrade(&monitor);
        let s = seen.clone();
        let _sub = monitor.subscribe(move |_| {
            if let Some(m) = m.upgrade() {
                s.lock().unwrap().push(m.is_online());
            }
        });

        monitor.update(NetworkState::online(None));
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_refresh_from_probe() {
        let probe = Arc::new(StaticProbe::new(NetworkState::offline()));
        let monitor = NetworkMonitor::with_probe(probe.clone());

        assert!(!monitor.refresh().await.unwrap());
        probe.set(NetworkState::online(Some("wifi")));
        assert!(monitor.refresh().await.unwrap());
        assert_eq!(monitor.state().transport_type.as_deref(), Some("wifi"));
    }
}
