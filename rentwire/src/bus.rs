//! Typed publish/subscribe hub decoupling transport events from consumers.
//!
//! The bus has two kinds of listeners:
//!
//! - **Handlers** ([`EventHandler`]) are the engine's own components. They run
//!   synchronously inside [`EventBus::publish`], in registration order, so
//!   component state is already updated when anyone else sees the event.
//! - **Subscribers** ([`Subscription`]) are application consumers. They
//!   receive clones over a `tokio::sync::broadcast` channel and may lag; a
//!   lagging subscriber skips ahead rather than blocking publishers.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::event::SyncEvent;

/// Default broadcast capacity for subscribers.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// A component reacting to bus events inline.
///
/// Implementations must not block and must release their own locks before
/// publishing follow-up events through `bus`.
pub trait EventHandler: Send + Sync {
    /// Handle one event. `bus` may be used to publish derived events.
    fn handle(&self, event: &SyncEvent, bus: &EventBus);
}

/// Shared event hub. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Creates a bus whose subscribers buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(Vec::new()),
                tx,
            }),
        }
    }

    /// Registers a component handler.
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        self.inner.handlers.write().push(handler);
    }

    /// Publishes an event to all handlers, then to all subscribers.
    pub fn publish(&self, event: SyncEvent) {
        // Snapshot so handlers may publish (or register) without deadlocking.
        let handlers = self.inner.handlers.read().clone();
        for handler in &handlers {
            handler.handle(&event, self);
        }
        // No subscribers is not an error.
        let _ = self.inner.tx.send(event);
    }

    /// Opens a new subscription that sees events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

/// A consumer's view of the bus.
pub struct Subscription {
    rx: broadcast::Receiver<SyncEvent>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the bus is gone.
    ///
    /// If this subscriber fell behind, the skipped events are logged and
    /// dropped and the next available event is returned.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "bus subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "bus subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Narrows this subscription to the events `select` maps to `Some`.
    #[must_use]
    pub fn filter_map<T>(self, select: fn(SyncEvent) -> Option<T>) -> Filtered<T> {
        Filtered {
            inner: self,
            select,
        }
    }
}

/// A subscription narrowed to one kind of event.
pub struct Filtered<T> {
    inner: Subscription,
    select: fn(SyncEvent) -> Option<T>,
}

impl<T> Filtered<T> {
    /// Waits for the next matching event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        while let Some(event) = self.inner.recv().await {
            if let Some(selected) = (self.select)(event) {
                return Some(selected);
            }
        }
        None
    }

    /// Returns the next buffered matching event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        while let Some(event) = self.inner.try_recv() {
            if let Some(selected) = (self.select)(event) {
                return Some(selected);
            }
        }
        None
    }
}
