//! FieldSync sync core
//!
//! Offline-first synchronization for field clients:
//! - Network monitoring with automatic sync on reconnect
//! - Read-through cache of entity collections
//! - Durable queue of pending mutations
//! - Single-flight sync coordinator with a bounded retry budget
//! - Derived status for the UI layer

pub mod cache;
pub mod context;
pub mod coordinator;
pub mod network;
pub mod observer;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod status;

// Re-export main types
pub use cache::{CacheStore, CachedSnapshot};
pub use context::SyncContext;
pub use coordinator::{
    DroppedAction, PassEvent, SyncConfig, SyncCoordinator, SyncOutcome, SyncPhase, SyncReport,
};
pub use network::{ConnectivityProbe, NetworkMonitor, NetworkState, StaticProbe};
pub use observer::{ObserverRegistry, Subscription, SubscriptionId};
pub use queue::{ActionKind, Payload, PendingAction, PendingActionQueue};
pub use remote::{HttpActionExecutor, RemoteConfig, RemoteDispatcher, RemoteEntityService};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{SyncMode, SyncScheduler, SyncSchedulerHandle};
pub use status::{Status, StatusPublisher, StatusTask};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let config = SyncConfig::default();
        assert_eq!(config.retry_policy().unwrap(), RetryPolicy::default());
        assert!(!NetworkState::offline().is_online());
    }
}
