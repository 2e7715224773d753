//! In-process fan-out of update events to local listeners.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::types::UpdateEvent;

type Callback = Arc<dyn Fn(&UpdateEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    // kept in subscription order
    listeners: Vec<(u64, Callback)>,
}

/// Callback registry scoped to one context. Never crosses context boundaries.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(callback)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Delivers `event` to every current listener on the calling thread.
    pub fn publish(&self, event: &UpdateEvent) {
        // snapshot so callbacks may subscribe or unsubscribe while running
        let listeners: Vec<Callback> = self
            .registry
            .lock()
            .listeners
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in listeners {
            callback(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().listeners.len()
    }
}

/// Handle for one registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
