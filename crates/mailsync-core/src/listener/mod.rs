//! Listener registration and event fan-out.
//!
//! Listeners are registered in a [`ListenerSet`]. Every emitted event goes
//! to each registered listener, then to the optional per-call listener, then
//! to broadcast subscribers. Listeners may be added or removed while events
//! are being delivered; delivery iterates over a snapshot.

mod memory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::event::Event;

pub use memory::MemorizingListener;

/// Receives controller events.
pub trait Listener: Send + Sync {
    /// Handles one event.
    fn on_event(&self, event: &Event);
}

impl<F> Listener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event);
    }
}

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Thread-safe set of listeners plus a broadcast channel.
pub struct ListenerSet {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn Listener>)>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<Event>,
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .field("subscribers", &self.channel.receiver_count())
            .finish()
    }
}

impl ListenerSet {
    /// Creates an empty set whose broadcast channel buffers `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (channel, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            channel,
        }
    }

    /// Registers a listener.
    pub fn add(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Subscribes to every future event.
    ///
    /// Slow receivers lag and skip events rather than blocking the worker.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.channel.subscribe()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no listeners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn Listener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    /// Delivers an event to every listener, then to `extra`, then to
    /// subscribers.
    pub fn emit(&self, extra: Option<&dyn Listener>, event: Event) {
        for listener in self.snapshot() {
            listener.on_event(&event);
        }
        if let Some(extra) = extra {
            extra.on_event(&event);
        }
        // No subscribers is not an error.
        let _ = self.channel.send(event);
    }
}
