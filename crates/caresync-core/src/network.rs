//! Network Monitor: single source of truth for connectivity.
//!
//! Decoupled from any platform signal — a concrete adapter (browser
//! events, OS reachability, a heartbeat prober) feeds transitions in via
//! `set_online`, and repeated reports of the same state are collapsed so
//! subscribers see each transition exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type Callback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct MonitorState {
    online: bool,
    subscribers: HashMap<u64, Callback>,
    next_id: u64,
}

/// Observes connectivity transitions and fans them out to subscribers.
#[derive(Clone, Default)]
pub struct NetworkMonitor {
    state: Arc<Mutex<MonitorState>>,
}

/// Handle returned by `subscribe`; dropping it (or calling `unsubscribe`)
/// removes the callback.
pub struct Subscription {
    id: u64,
    state: Arc<Mutex<MonitorState>>,
}

impl Subscription {
    /// Explicitly remove the subscription.
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.subscribers.remove(&self.id);
        }
    }
}

impl NetworkMonitor {
    /// Monitor starting in the offline state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Monitor starting in the given state.
    #[must_use]
    pub fn with_initial(online: bool) -> Self {
        let monitor = Self::new();
        monitor.lock().online = online;
        monitor
    }

    /// Register a callback invoked once per connectivity transition with
    /// the new state.
    pub fn subscribe(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, Arc::new(callback));
        Subscription {
            id,
            state: Arc::clone(&self.state),
        }
    }

    /// Current connectivity.
    pub fn check_network(&self) -> bool {
        self.lock().online
    }

    /// Report connectivity from the platform adapter. Repeated reports of
    /// the unchanged state are ignored; a real transition notifies every
    /// subscriber exactly once.
    pub fn set_online(&self, online: bool) {
        let callbacks: Vec<Callback> = {
            let mut state = self.lock();
            if state.online == online {
                return;
            }
            state.online = online;
            state.subscribers.values().cloned().collect()
        };

        if online {
            tracing::info!("network online");
        } else {
            tracing::warn!("network offline");
        }
        // Invoked outside the lock so a callback may subscribe/unsubscribe
        for callback in callbacks {
            callback(online);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
