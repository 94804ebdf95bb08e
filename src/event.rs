//! Scoped event subscriptions.
//!
//! An [`EventEmitter`] fans events out to any number of [`Subscription`]s.
//! A subscription unregisters itself when dropped, so a listener can never
//! outlive the wait that created it; [`EventEmitter::listener_count`] makes
//! that checkable from tests.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

struct Listeners<T> {
    next_id: u64,
    senders: HashMap<u64, async_channel::Sender<T>>,
}

/// Multi-listener event source.
pub struct EventEmitter<T> {
    listeners: Arc<Mutex<Listeners<T>>>,
}

impl<T> EventEmitter<T> {
    /// Create an emitter with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                senders: HashMap::new(),
            })),
        }
    }

    /// Register a listener. It stays registered until the handle is dropped.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = async_channel::unbounded();
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.senders.insert(id, tx);
        Subscription {
            id,
            rx,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of live subscriptions.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().senders.len()
    }
}

impl<T: Clone> EventEmitter<T> {
    /// Deliver `event` to every listener. Returns how many received it.
    pub fn emit(&self, event: T) -> usize {
        let listeners = self.listeners.lock();
        listeners
            .senders
            .values()
            .filter(|tx| tx.try_send(event.clone()).is_ok())
            .count()
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventEmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Listener handle returned by [`EventEmitter::subscribe`].
///
/// Dropping the handle removes the listener from its emitter.
pub struct Subscription<T> {
    id: u64,
    rx: async_channel::Receiver<T>,
    listeners: Weak<Mutex<Listeners<T>>>,
}

impl<T> Subscription<T> {
    /// Wait for the next event. `None` once the emitter is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await.ok()
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    fn release(&self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().senders.remove(&self.id);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("buffered", &self.rx.len())
            .finish()
    }
}
