//! Observable value cells.
//!
//! An [`Atom`] holds a single value and a list of listeners. Every observable surface in this
//! crate (query values, mutation values, resolved keys) is an atom.
//!
//! # Lifecycle
//!
//! Atoms count their listeners. When the first listener attaches, the `on_start` hook runs
//! *before* the listener is registered; when the last listener detaches, the `on_stop` hook
//! runs. Query stores use these hooks to mount and unmount themselves.
//!
//! ```
//! use querykit::atom::Atom;
//!
//! let count = Atom::new(0);
//! let unsubscribe = count.listen(|value| println!("count is now {value}"));
//!
//! count.set(1); // prints "count is now 1"
//! count.set(1); // identical value, no notification
//!
//! unsubscribe.unsubscribe();
//! assert_eq!(count.listener_count(), 0);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::lock::mutex_lock;

const SOURCE: &str = "atom";

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Hook = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by every `listen`/`on` style registration.
///
/// Calling [`unsubscribe`](Self::unsubscribe) detaches the listener. Dropping the handle
/// without calling it leaves the listener attached.
#[must_use = "the listener stays attached until `unsubscribe` is called"]
pub struct Unsubscribe {
    f: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscribe {
    /// Wraps a detach action.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            f: Some(Box::new(f)),
        }
    }

    /// A handle that detaches nothing.
    pub fn noop() -> Self {
        Self { f: None }
    }

    /// Combines several handles into one that detaches all of them in order.
    pub fn all(handles: Vec<Self>) -> Self {
        Self::new(move || {
            for handle in handles {
                handle.unsubscribe();
            }
        })
    }

    /// Detaches the listener.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("pending", &self.f.is_some())
            .finish()
    }
}

/// An observable value.
///
/// Cloning an atom yields another handle to the same cell.
pub struct Atom<T> {
    inner: Arc<AtomInner<T>>,
}

struct AtomInner<T> {
    value: Mutex<T>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
    on_start: Mutex<Option<Hook>>,
    on_stop: Mutex<Option<Hook>>,
}

impl<T> Atom<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Creates an atom holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(AtomInner {
                value: Mutex::new(value),
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                on_start: Mutex::new(None),
                on_stop: Mutex::new(None),
            }),
        }
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> T {
        mutex_lock(&self.inner.value, SOURCE, "get").clone()
    }

    /// Replaces the value and notifies listeners.
    ///
    /// Setting a value equal to the current one is a no-op.
    pub fn set(&self, value: T) {
        {
            let mut current = mutex_lock(&self.inner.value, SOURCE, "set");
            if *current == value {
                return;
            }
            current.clone_from(&value);
        }
        self.notify(&value);
    }

    /// Applies `f` to a copy of the current value and stores the result.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut next = self.get();
        f(&mut next);
        self.set(next);
    }

    /// Attaches a listener that is called on every subsequent change.
    ///
    /// If this is the first listener, the `on_start` hook runs before it is attached.
    pub fn listen(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Unsubscribe {
        if self.listener_count() == 0 {
            let hook = mutex_lock(&self.inner.on_start, SOURCE, "listen").clone();
            if let Some(hook) = hook {
                hook();
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        mutex_lock(&self.inner.listeners, SOURCE, "listen").push((id, Arc::new(listener)));

        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.remove_listener(id);
            }
        })
    }

    /// Like [`listen`](Self::listen), but also calls `listener` with the current value
    /// once attached.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Unsubscribe {
        let listener: Listener<T> = Arc::new(listener);
        let attached = Arc::clone(&listener);
        let unsubscribe = self.listen(move |value| attached(value));
        listener(&self.get());
        unsubscribe
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        mutex_lock(&self.inner.listeners, SOURCE, "listener_count").len()
    }

    /// Sets the hook that runs when the first listener attaches.
    pub fn on_start(&self, hook: impl Fn() + Send + Sync + 'static) {
        *mutex_lock(&self.inner.on_start, SOURCE, "on_start") = Some(Arc::new(hook));
    }

    /// Sets the hook that runs when the last listener detaches.
    pub fn on_stop(&self, hook: impl Fn() + Send + Sync + 'static) {
        *mutex_lock(&self.inner.on_stop, SOURCE, "on_stop") = Some(Arc::new(hook));
    }

    fn notify(&self, value: &T) {
        let listeners: Vec<Listener<T>> = mutex_lock(&self.inner.listeners, SOURCE, "notify")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        trace!(listeners = listeners.len(), "notifying atom listeners");
        for listener in listeners {
            listener(value);
        }
    }

    fn remove_listener(&self, id: u64) {
        let emptied = {
            let mut listeners = mutex_lock(&self.inner.listeners, SOURCE, "remove_listener");
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            before != listeners.len() && listeners.is_empty()
        };

        if emptied {
            let hook = mutex_lock(&self.inner.on_stop, SOURCE, "remove_listener").clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Atom<T>
where
    T: Clone + PartialEq + Send + Default + 'static,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Atom<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = mutex_lock(&self.inner.value, SOURCE, "debug");
        let listeners = mutex_lock(&self.inner.listeners, SOURCE, "debug").len();
        f.debug_struct("Atom")
            .field("value", &*value)
            .field("listeners", &listeners)
            .finish()
    }
}
