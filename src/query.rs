//! Query stores.
//!
//! A [`QueryStore`] binds a key, a request path and fetch options into an observable
//! [`QueryValue`]. It has no state of its own beyond that value: data lives in the client's
//! cache and is shared by every store resolving to the same key.
//!
//! # Lifecycle
//!
//! A store is idle until its first listener attaches. It then resolves its key, fetches it
//! (subject to dedupe and freshness), and starts reacting to the client's event bus:
//!
//! - invalidation or revalidation of its key triggers a refetch,
//! - results fetched by other stores for its key are copied into its value,
//! - focus/reconnect events and the revalidate interval trigger refetches when enabled.
//!
//! When the last listener detaches, the store goes back to idle and drops all of this. The
//! cache entry for its key stays, so the next mount can reuse it.
//!
//! # Example
//!
//! ```rust,ignore
//! let todos = client.use_query("todos", "/todos", QueryOptions::default());
//!
//! let unsubscribe = todos.subscribe(|value| {
//!     if let Some(data) = &value.data {
//!         println!("{} todos", data.as_array().map_or(0, Vec::len));
//!     }
//! });
//!
//! // Later: force a refetch after an edit elsewhere.
//! todos.revalidate();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::atom::{Atom, Unsubscribe};
use crate::cache::KeySelector;
use crate::client::ClientInner;
use crate::config::QuerySettings;
use crate::error::FetchError;
use crate::events::{CacheEvent, CacheUpdate, EventKind};
use crate::fetcher::{ErrorCallback, FetchJob, SharedFetch};
use crate::key::{CompositeKey, KeyInput, resolve_key};
use crate::lock::mutex_lock;
use crate::timer::spawn_interval;
use crate::transport::{FetchRequest, FetchResponse, Method};

const SOURCE: &str = "query";

/// What a query store's listeners observe.
#[derive(Clone, Default)]
pub struct QueryValue {
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    /// A request for the current key is in flight.
    pub is_pending: bool,
    /// Pending, and not the first fetch of this key since the store mounted.
    pub is_refetching: bool,
    /// The in-flight request, while pending.
    pub promise: Option<SharedFetch>,
}

impl QueryValue {
    /// The value of a store with no key or no listeners.
    pub fn idle() -> Self {
        Self::default()
    }

    pub(crate) fn pending(data: Option<Value>, refetching: bool, promise: SharedFetch) -> Self {
        Self {
            data,
            error: None,
            is_pending: true,
            is_refetching: refetching,
            promise: Some(promise),
        }
    }

    pub(crate) fn settled(data: Option<Value>, error: Option<FetchError>) -> Self {
        Self {
            data,
            error,
            ..Self::default()
        }
    }

    /// Decodes `data` into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Decode`] if the payload does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, FetchError> {
        self.data
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(FetchError::from)
    }

    pub const fn is_success(&self) -> bool {
        !self.is_pending && self.data.is_some() && self.error.is_none()
    }

    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Not pending and holding data or an error.
    pub const fn is_settled(&self) -> bool {
        !self.is_pending && (self.data.is_some() || self.error.is_some())
    }
}

// The promise is a handle, not state: two values differing only by promise are the same value.
impl PartialEq for QueryValue {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
            && self.error == other.error
            && self.is_pending == other.is_pending
            && self.is_refetching == other.is_refetching
    }
}

impl fmt::Debug for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryValue")
            .field("data", &self.data)
            .field("error", &self.error)
            .field("is_pending", &self.is_pending)
            .field("is_refetching", &self.is_refetching)
            .field("promise", &self.promise.is_some())
            .finish()
    }
}

impl From<&QueryValue> for FetchResponse {
    fn from(value: &QueryValue) -> Self {
        Self {
            data: value.data.clone(),
            error: value.error.clone(),
        }
    }
}

/// Options for [`QueryClient::use_query`](crate::client::QueryClient::use_query).
#[derive(Clone, Default)]
pub struct QueryOptions {
    /// Request sent for every key.
    pub request: FetchRequest,
    /// Builds the request from the resolved key instead of using `request`.
    pub request_for_key: Option<Arc<dyn Fn(&CompositeKey) -> FetchRequest + Send + Sync>>,
    /// Overrides the client settings for this store.
    pub settings: QuerySettings,
    pub on_error: Option<ErrorCallback>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn request(mut self, request: FetchRequest) -> Self {
        self.request = request;
        self
    }

    /// Derives the request from the resolved key, e.g. to fill path parameters from key parts.
    #[must_use]
    pub fn request_for_key(
        mut self,
        f: impl Fn(&CompositeKey) -> FetchRequest + Send + Sync + 'static,
    ) -> Self {
        self.request_for_key = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn settings(mut self, settings: QuerySettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&FetchError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("request", &self.request)
            .field("request_for_key", &self.request_for_key.is_some())
            .field("settings", &self.settings)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// The part of a store the fetch orchestrator writes to.
pub(crate) struct QueryTarget {
    pub value: Atom<QueryValue>,
    pub key: Mutex<Option<CompositeKey>>,
}

impl QueryTarget {
    fn current_key(&self) -> Option<CompositeKey> {
        mutex_lock(&self.key, SOURCE, "current_key").clone()
    }

    fn set_key(&self, key: Option<CompositeKey>) {
        *mutex_lock(&self.key, SOURCE, "set_key") = key;
    }

    /// Sets `value` unless the store has moved off `key`.
    pub fn set_if_current(&self, key: &str, value: QueryValue) -> bool {
        let current = self.current_key().is_some_and(|current| current.key == key);
        if current {
            self.value.set(value);
        } else {
            trace!(key = %key, "ignoring write for a key the store no longer uses");
        }
        current
    }
}

/// An observable query bound to one client.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct QueryStore {
    inner: Arc<QueryInner>,
}

struct QueryInner {
    id: u64,
    client: Arc<ClientInner>,
    key_input: KeyInput,
    path: String,
    options: QueryOptions,
    target: Arc<QueryTarget>,
    session: Mutex<Option<Vec<Unsubscribe>>>,
}

impl QueryStore {
    pub(crate) fn new(
        client: Arc<ClientInner>,
        key_input: KeyInput,
        path: String,
        options: QueryOptions,
    ) -> Self {
        let inner = Arc::new(QueryInner {
            id: client.next_store_id(),
            client,
            key_input,
            path,
            options,
            target: Arc::new(QueryTarget {
                value: Atom::new(QueryValue::idle()),
                key: Mutex::new(None),
            }),
            session: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner.target.value.on_start(move || {
            if let Some(inner) = weak.upgrade() {
                inner.start();
            }
        });
        let weak = Arc::downgrade(&inner);
        inner.target.value.on_stop(move || {
            if let Some(inner) = weak.upgrade() {
                inner.stop();
            }
        });

        Self { inner }
    }

    /// Current value.
    pub fn get(&self) -> QueryValue {
        self.inner.target.value.get()
    }

    /// The key the store currently resolves to, if any.
    pub fn key(&self) -> Option<String> {
        self.inner.target.current_key().map(|key| key.key)
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn listener_count(&self) -> usize {
        self.inner.target.value.listener_count()
    }

    /// Attaches a listener called on every change.
    ///
    /// The first listener mounts the store. Later listeners trigger a fetch of the current key,
    /// which goes through the usual dedupe and freshness checks.
    pub fn listen(&self, listener: impl Fn(&QueryValue) + Send + Sync + 'static) -> Unsubscribe {
        let active = self.listener_count() > 0;
        let unsubscribe = self.inner.target.value.listen(listener);
        if active {
            self.inner.refetch();
        }
        unsubscribe
    }

    /// Like [`listen`](Self::listen), and calls `listener` with the current value right away.
    pub fn subscribe(&self, listener: impl Fn(&QueryValue) + Send + Sync + 'static) -> Unsubscribe {
        let listener = Arc::new(listener);
        let attached = Arc::clone(&listener);
        let unsubscribe = self.listen(move |value| attached(value));
        listener(&self.get());
        unsubscribe
    }

    /// Resolves with the first settled value: data or an error, not pending.
    ///
    /// Mounts the store for the duration of the call. When no request is running once the store
    /// is mounted (unset key, fresh cache entry, app in the background) it resolves right away
    /// with the current value, which is empty for an unset key.
    pub async fn fetch(&self) -> FetchResponse {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let unsubscribe = self.listen(move |value: &QueryValue| {
            if value.is_settled() {
                if let Some(tx) = mutex_lock(&tx, SOURCE, "fetch").take() {
                    let _ = tx.send(FetchResponse::from(value));
                }
            }
        });

        // Not pending after mounting means nothing is coming: the key is unset, the cache entry
        // was fresh, or the app is in the background.
        let current = self.get();
        let response = if current.is_pending {
            rx.await.unwrap_or_default()
        } else {
            FetchResponse::from(&current)
        };

        unsubscribe.unsubscribe();
        response
    }

    /// Deletes the cache entry for the current key; active stores on it refetch.
    pub fn invalidate(&self) {
        if let Some(key) = self.key() {
            self.inner.client.invalidate_keys(KeySelector::Key(key));
        }
    }

    /// Marks the cache entry for the current key as stale; active stores on it refetch while
    /// still showing the old data.
    pub fn revalidate(&self) {
        if let Some(key) = self.key() {
            self.inner.client.revalidate_keys(KeySelector::Key(key));
        }
    }

    /// Writes `data` to the cache for the current key, or deletes the entry when `None`.
    pub fn mutate(&self, data: Option<Value>) {
        if let Some(key) = self.key() {
            self.inner.client.mutate_cache(KeySelector::Key(key), data);
        }
    }
}

impl fmt::Debug for QueryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStore")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("key", &self.key())
            .field("value", &self.get())
            .finish()
    }
}

impl QueryInner {
    fn start(self: &Arc<Self>) {
        debug!(store = self.id, path = %self.path, "query store mounted");
        let settings = self
            .options
            .settings
            .merged_over(&self.client.settings)
            .resolve();
        let events = &self.client.events;
        let mut session = Vec::new();

        let weak = Arc::downgrade(self);
        session.push(events.on(EventKind::InvalidateKeys, move |event| {
            with_matching_key(&weak, event, |inner, _| inner.refetch());
        }));
        let weak = Arc::downgrade(self);
        session.push(events.on(EventKind::RevalidateKeys, move |event| {
            with_matching_key(&weak, event, |inner, _| inner.refetch());
        }));
        let weak = Arc::downgrade(self);
        session.push(events.on(EventKind::SetCache, move |event| {
            with_matching_key(&weak, event, |inner, event| {
                if let CacheEvent::SetCache { update, .. } = event {
                    inner.apply(update);
                }
            });
        }));

        if settings.revalidate_on_focus {
            let weak = Arc::downgrade(self);
            session.push(events.on(EventKind::Focus, move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.refetch();
                }
            }));
        }
        if settings.revalidate_on_reconnect {
            let weak = Arc::downgrade(self);
            session.push(events.on(EventKind::Reconnect, move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.refetch();
                }
            }));
        }

        let (key, unsubscribe_key) = resolve_key(&self.key_input);
        let weak = Arc::downgrade(self);
        let first = AtomicBool::new(true);
        let key_listener = key.subscribe(move |next: &Option<CompositeKey>| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Some(previous) = inner.target.current_key() {
                if next.as_ref().is_none_or(|next| next.key != previous.key) {
                    inner.client.error_retry_timers.remove(&previous.key);
                }
            }
            inner.target.set_key(next.clone());
            match next {
                Some(key) => {
                    let refetching = !first.swap(false, Ordering::SeqCst);
                    inner.run(key.clone(), refetching);
                }
                None => {
                    trace!(store = inner.id, "key unset, fetching disabled");
                    inner.target.value.set(QueryValue::idle());
                }
            }
        });
        session.push(key_listener);
        session.push(unsubscribe_key);

        if let Some(period) = settings.revalidate_interval {
            let weak = Arc::downgrade(self);
            let timer = spawn_interval(&self.client.runtime, period, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.refetch();
                }
            });
            self.client.interval_timers.insert(self.id, timer);
        }

        *mutex_lock(&self.session, SOURCE, "start") = Some(session);
    }

    fn stop(&self) {
        debug!(store = self.id, path = %self.path, "query store unmounted");
        self.target.value.set(QueryValue::idle());
        let session = mutex_lock(&self.session, SOURCE, "stop").take();
        for unsubscribe in session.into_iter().flatten() {
            unsubscribe.unsubscribe();
        }
        self.client.interval_timers.remove(&self.id);
        if let Some(key) = self.target.current_key() {
            self.client.error_retry_timers.remove(&key.key);
        }
        self.target.set_key(None);
    }

    /// Fetches the current key again, if there is one.
    fn refetch(self: &Arc<Self>) {
        if let Some(key) = self.target.current_key() {
            self.run(key, true);
        }
    }

    fn run(self: &Arc<Self>, key: CompositeKey, refetching: bool) {
        let request = self
            .options
            .request_for_key
            .as_ref()
            .map_or_else(|| self.options.request.clone(), |f| f(&key));
        let job = FetchJob {
            fetcher: self.client.fetcher(&self.path, request, Method::Get),
            key,
            settings: self.options.settings.clone(),
            on_error: self.options.on_error.clone(),
            refetching,
        };
        self.client.run_fetcher(job, Some(&self.target));
    }

    /// Applies a cache write made elsewhere, skipping identical values.
    fn apply(&self, update: &CacheUpdate) {
        let current = self.target.value.get();
        let next = match update {
            CacheUpdate::Replace(value) => value.clone(),
            CacheUpdate::Merge(data) => QueryValue::settled(data.clone(), None),
            CacheUpdate::Failed(error) => {
                QueryValue::settled(current.data.clone(), Some(error.clone()))
            }
        };
        if next != current {
            self.target.value.set(next);
        }
    }
}

impl Drop for QueryInner {
    fn drop(&mut self) {
        self.client.interval_timers.remove(&self.id);
    }
}

fn with_matching_key(
    weak: &Weak<QueryInner>,
    event: &CacheEvent,
    f: impl FnOnce(&Arc<QueryInner>, &CacheEvent),
) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let Some(key) = inner.target.current_key() else {
        return;
    };
    if event.selector().is_some_and(|selector| selector.matches(&key.key)) {
        f(&inner, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Todo {
        id: u32,
        title: String,
    }

    #[test]
    fn test_value_equality_ignores_promise() {
        let a = QueryValue::settled(Some(json!(1)), None);
        let mut b = a.clone();
        b.promise = None;
        assert_eq!(a, b);
        assert_ne!(a, QueryValue::idle());
    }

    #[test]
    fn test_data_as() {
        let value = QueryValue::settled(Some(json!({ "id": 1, "title": "write" })), None);
        let todo: Option<Todo> = value.data_as().unwrap();
        assert_eq!(
            todo,
            Some(Todo {
                id: 1,
                title: "write".into()
            })
        );

        let value = QueryValue::settled(Some(json!("nope")), None);
        assert!(matches!(value.data_as::<Todo>(), Err(FetchError::Decode(_))));
        assert_eq!(QueryValue::idle().data_as::<Todo>().unwrap(), None);
    }

    #[test]
    fn test_settled_predicates() {
        assert!(!QueryValue::idle().is_settled());
        let failed = QueryValue::settled(Some(json!(1)), Some(FetchError::http(500, "x")));
        assert!(failed.is_settled());
        assert!(failed.is_error());
        assert!(!failed.is_success());
    }

    #[test]
    fn test_target_ignores_other_keys() {
        let target = QueryTarget {
            value: Atom::new(QueryValue::idle()),
            key: Mutex::new(CompositeKey::single("a")),
        };
        assert!(!target.set_if_current("b", QueryValue::settled(Some(json!(1)), None)));
        assert_eq!(target.value.get(), QueryValue::idle());
        assert!(target.set_if_current("a", QueryValue::settled(Some(json!(1)), None)));
        assert_eq!(target.value.get().data, Some(json!(1)));
    }
}
