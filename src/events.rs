//! In-process event bus.
//!
//! Every query store of a client listens here for focus/reconnect notifications, manual
//! invalidation and cache writes made by other stores. Delivery is synchronous: `emit` calls
//! every matching handler, in subscription order, before it returns.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use crate::atom::Unsubscribe;
use crate::cache::KeySelector;
use crate::error::FetchError;
use crate::lock::mutex_lock;
use crate::query::QueryValue;

const SOURCE: &str = "events";

/// Channel an event travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Focus,
    Reconnect,
    InvalidateKeys,
    RevalidateKeys,
    SetCache,
}

/// How a `SetCache` event changes the value of stores watching the key.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheUpdate {
    /// A completed fetch: replace the whole value.
    Replace(QueryValue),
    /// A manual cache write: swap the payload, clear error and pending flags.
    Merge(Option<Value>),
    /// A failed fetch: record the error and settle, keeping whatever data each store shows.
    Failed(FetchError),
}

/// An event on the bus.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// The application became visible.
    Focus,
    /// The network came back.
    Reconnect,
    /// Entries were deleted.
    InvalidateKeys(KeySelector),
    /// Entries were marked stale.
    RevalidateKeys(KeySelector),
    /// Entries were written.
    SetCache {
        selector: KeySelector,
        update: CacheUpdate,
    },
}

impl CacheEvent {
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Focus => EventKind::Focus,
            Self::Reconnect => EventKind::Reconnect,
            Self::InvalidateKeys(_) => EventKind::InvalidateKeys,
            Self::RevalidateKeys(_) => EventKind::RevalidateKeys,
            Self::SetCache { .. } => EventKind::SetCache,
        }
    }

    /// The selector carried by key-scoped events.
    pub const fn selector(&self) -> Option<&KeySelector> {
        match self {
            Self::Focus | Self::Reconnect => None,
            Self::InvalidateKeys(selector)
            | Self::RevalidateKeys(selector)
            | Self::SetCache { selector, .. } => Some(selector),
        }
    }
}

type Handler = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Publish/subscribe channel scoped to one client.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    handlers: Mutex<Vec<(u64, EventKind, Handler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind`.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&CacheEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        mutex_lock(&self.inner.handlers, SOURCE, "on").push((id, kind, Arc::new(handler)));

        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                mutex_lock(&inner.handlers, SOURCE, "off").retain(|(handler_id, _, _)| *handler_id != id);
            }
        })
    }

    /// Delivers `event` to every handler registered for its kind.
    pub fn emit(&self, event: CacheEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = mutex_lock(&self.inner.handlers, SOURCE, "emit")
            .iter()
            .filter(|(_, handler_kind, _)| *handler_kind == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();

        debug!(event = ?kind, listeners = handlers.len(), "emitting cache event");
        for handler in handlers {
            handler(&event);
        }
    }

    /// Number of handlers registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        mutex_lock(&self.inner.handlers, SOURCE, "listener_count")
            .iter()
            .filter(|(_, handler_kind, _)| *handler_kind == kind)
            .count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = mutex_lock(&self.inner.handlers, SOURCE, "debug").len();
        f.debug_struct("EventBus").field("handlers", &handlers).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_matching_kind_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let first = bus.on(EventKind::Focus, move |_| sink.lock().unwrap().push("first"));
        let sink = Arc::clone(&seen);
        let second = bus.on(EventKind::Focus, move |_| sink.lock().unwrap().push("second"));
        let sink = Arc::clone(&seen);
        let other = bus.on(EventKind::Reconnect, move |_| sink.lock().unwrap().push("reconnect"));

        bus.emit(CacheEvent::Focus);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);

        first.unsubscribe();
        second.unsubscribe();
        other.unsubscribe();
        assert_eq!(bus.listener_count(EventKind::Focus), 0);
    }

    #[test]
    fn test_unsubscribed_handler_is_not_called() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));

        let sink = Arc::clone(&seen);
        let handle = bus.on(EventKind::InvalidateKeys, move |_| *sink.lock().unwrap() += 1);
        bus.emit(CacheEvent::InvalidateKeys("a".into()));
        handle.unsubscribe();
        bus.emit(CacheEvent::InvalidateKeys("a".into()));

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_event_selector() {
        assert!(CacheEvent::Focus.selector().is_none());
        let event = CacheEvent::SetCache {
            selector: "k".into(),
            update: CacheUpdate::Merge(None),
        };
        assert_eq!(event.kind(), EventKind::SetCache);
        assert!(event.selector().is_some_and(|s| s.matches("k")));
    }
}
