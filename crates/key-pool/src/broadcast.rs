//! Status change notification for pool observers
//!
//! Every pool mutation pushes one full `StatusSnapshot` to every subscriber,
//! synchronously and in subscription order. There is no buffering or
//! coalescing: two state changes yield two notifications.
//!
//! Subscriptions are keyed by a monotonically increasing handle id, so
//! unsubscribing removes exactly one registration even when several
//! subscribers registered the same callback.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use crate::pool::StatusSnapshot;

type Callback = Arc<dyn Fn(&StatusSnapshot) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out of pool snapshots to registered callbacks.
///
/// Cloning yields another handle to the same subscriber registry.
#[derive(Clone, Default)]
pub struct StatusBroadcaster {
    registry: Arc<Mutex<Registry>>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every subsequent snapshot.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StatusSnapshot) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.callbacks.insert(id, Arc::new(callback));
        debug!(subscription = id, "status subscriber added");
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `snapshot` to all current subscribers.
    ///
    /// The registry lock is released before callbacks run, so a callback may
    /// subscribe, unsubscribe, or read the pool.
    pub fn broadcast(&self, snapshot: &StatusSnapshot) {
        let callbacks: Vec<Callback> = lock(&self.registry).callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(snapshot);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).callbacks.len()
    }
}

/// Handle for one registration. Dropping it leaves the callback registered.
#[must_use = "call unsubscribe() to remove the callback"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove this registration. Returns false if it was already gone or the
    /// broadcaster no longer exists.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = lock(&registry).callbacks.remove(&self.id).is_some();
        if removed {
            debug!(subscription = self.id, "status subscriber removed");
        }
        removed
    }
}
