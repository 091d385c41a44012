//! Mutations: requests that change server state.
//!
//! A [`MutatorStore`] wraps one imperative action, [`mutate`](MutatorStore::mutate), with an
//! observable pending/error/data value.
//!
//! # Optimistic updates
//!
//! A manual mutator runs before the request is sent and returns [`FetchHooks`] for it. It gets
//! a [`MutationContext`] to edit the shared cache:
//!
//! - [`invalidate`](MutationContext::invalidate) and [`revalidate`](MutationContext::revalidate)
//!   are deferred until the request settles, so refetches do not race the write;
//! - [`get_cache_updater`](MutationContext::get_cache_updater) returns an updater that writes to
//!   the cache immediately, plus the value currently cached. Writing that value back from
//!   `on_error` rolls the optimistic update back.
//!
//! ```rust,ignore
//! let toggle = client.use_mutation(
//!     "/todos/:id",
//!     MutationOptions::new().mutator(|ctx| {
//!         let (updater, previous) = ctx.get_cache_updater("todos", CacheUpdaterOptions::default());
//!         let rollback = updater.clone();
//!         FetchHooks::new()
//!             .on_request(move |request| updater.update(request.body.clone()))
//!             .on_error(move |_| rollback.update(previous.clone()))
//!     }),
//! );
//! ```
//!
//! # Throttling
//!
//! With `throttle_calls` (the default) a store runs at most one mutation at a time: calls made
//! while one is in flight return `None` without sending anything. This is not a queue.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::atom::{Atom, Unsubscribe};
use crate::cache::KeySelector;
use crate::client::ClientInner;
use crate::error::FetchError;
use crate::fetcher::ErrorCallback;
use crate::lock::mutex_lock;
use crate::transport::{FetchHooks, FetchRequest, Method, dispatch};

const SOURCE: &str = "mutation";

/// Builds the hooks for one mutation call.
pub type ManualMutator = Arc<dyn Fn(&MutationContext) -> FetchHooks + Send + Sync>;

/// What a mutator store's listeners observe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationValue {
    pub data: Option<Value>,
    pub error: Option<FetchError>,
    pub is_pending: bool,
}

impl MutationValue {
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
}

/// Options for [`QueryClient::use_mutation`](crate::client::QueryClient::use_mutation).
#[derive(Clone)]
pub struct MutationOptions {
    /// Skip calls made while a mutation is in flight. Defaults to `true`.
    pub throttle_calls: bool,
    /// Method used when the request does not set one. Defaults to `POST`.
    pub method: Method,
    pub on_error: Option<ErrorCallback>,
    pub mutator: Option<ManualMutator>,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self {
            throttle_calls: true,
            method: Method::Post,
            on_error: None,
            mutator: None,
        }
    }
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn throttle_calls(mut self, throttle: bool) -> Self {
        self.throttle_calls = throttle;
        self
    }

    #[must_use]
    pub const fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&FetchError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn mutator(
        mut self,
        f: impl Fn(&MutationContext) -> FetchHooks + Send + Sync + 'static,
    ) -> Self {
        self.mutator = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("throttle_calls", &self.throttle_calls)
            .field("method", &self.method)
            .field("on_error", &self.on_error.is_some())
            .field("mutator", &self.mutator.is_some())
            .finish()
    }
}

#[derive(Debug)]
enum Deferred {
    Invalidate(KeySelector),
    Revalidate(KeySelector),
}

/// Cache helpers handed to a manual mutator.
#[derive(Clone)]
pub struct MutationContext {
    client: Arc<ClientInner>,
    deferred: Arc<Mutex<Vec<Deferred>>>,
}

impl MutationContext {
    fn new(client: Arc<ClientInner>) -> Self {
        Self {
            client,
            deferred: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Invalidates `selector` once the mutation settles.
    pub fn invalidate(&self, selector: impl Into<KeySelector>) {
        mutex_lock(&self.deferred, SOURCE, "invalidate").push(Deferred::Invalidate(selector.into()));
    }

    /// Revalidates `selector` once the mutation settles.
    pub fn revalidate(&self, selector: impl Into<KeySelector>) {
        mutex_lock(&self.deferred, SOURCE, "revalidate").push(Deferred::Revalidate(selector.into()));
    }

    /// Returns an updater for `key` and the data currently cached for it.
    pub fn get_cache_updater(
        &self,
        key: impl Into<String>,
        options: CacheUpdaterOptions,
    ) -> (CacheUpdater, Option<Value>) {
        let key = key.into();
        let current = self.client.cache.get(&key).and_then(|entry| entry.data);
        let updater = CacheUpdater {
            key,
            should_revalidate: options.should_revalidate,
            ctx: self.clone(),
        };
        (updater, current)
    }

    fn flush(&self) {
        let deferred = std::mem::take(&mut *mutex_lock(&self.deferred, SOURCE, "flush"));
        for action in deferred {
            match action {
                Deferred::Invalidate(selector) => self.client.invalidate_keys(selector),
                Deferred::Revalidate(selector) => self.client.revalidate_keys(selector),
            }
        }
    }
}

impl fmt::Debug for MutationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let deferred = mutex_lock(&self.deferred, SOURCE, "debug").len();
        f.debug_struct("MutationContext")
            .field("deferred", &deferred)
            .finish_non_exhaustive()
    }
}

/// Options for [`MutationContext::get_cache_updater`].
#[derive(Debug, Clone, Copy)]
pub struct CacheUpdaterOptions {
    /// Revalidate the key after the mutation settles. Defaults to `true`.
    pub should_revalidate: bool,
}

impl Default for CacheUpdaterOptions {
    fn default() -> Self {
        Self {
            should_revalidate: true,
        }
    }
}

/// Writes one cache key on behalf of a mutation.
#[derive(Debug, Clone)]
pub struct CacheUpdater {
    key: String,
    should_revalidate: bool,
    ctx: MutationContext,
}

impl CacheUpdater {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Writes `data` to the cache now (deletes the entry for `None`), and schedules a
    /// revalidation for when the mutation settles if the updater was created with
    /// `should_revalidate`.
    pub fn update(&self, data: Option<Value>) {
        self.ctx
            .client
            .mutate_cache(KeySelector::Key(self.key.clone()), data);
        if self.should_revalidate {
            self.ctx.revalidate(KeySelector::Key(self.key.clone()));
        }
    }
}

/// An observable mutation bound to one client.
#[derive(Clone)]
pub struct MutatorStore {
    inner: Arc<MutatorInner>,
}

struct MutatorInner {
    client: Arc<ClientInner>,
    path: String,
    options: MutationOptions,
    value: Atom<MutationValue>,
    in_flight: AtomicUsize,
}

impl MutatorStore {
    pub(crate) fn new(client: Arc<ClientInner>, path: String, options: MutationOptions) -> Self {
        let inner = Arc::new(MutatorInner {
            client,
            path,
            options,
            value: Atom::new(MutationValue::default()),
            in_flight: AtomicUsize::new(0),
        });

        let weak = Arc::downgrade(&inner);
        inner.value.on_stop(move || {
            if let Some(inner) = weak.upgrade() {
                inner.value.set(MutationValue::default());
            }
        });

        Self { inner }
    }

    pub fn get(&self) -> MutationValue {
        self.inner.value.get()
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn listener_count(&self) -> usize {
        self.inner.value.listener_count()
    }

    pub fn listen(&self, listener: impl Fn(&MutationValue) + Send + Sync + 'static) -> Unsubscribe {
        self.inner.value.listen(listener)
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationValue) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.inner.value.subscribe(listener)
    }

    /// Sends `request` to the store's path.
    ///
    /// The mutator (if any) runs and the request is prepared before this returns; the request
    /// is sent when the returned future is first polled. Resolves to the response data, or
    /// `None` when the call was throttled or failed; failures are reported through the store's
    /// `error` and the `on_error` callback.
    pub fn mutate(&self, request: FetchRequest) -> BoxFuture<'static, Option<Value>> {
        let inner = Arc::clone(&self.inner);
        let Some(in_flight) = InFlight::acquire(&inner) else {
            debug!(path = %inner.path, "mutation already in flight, skipping");
            return future::ready(None).boxed();
        };

        let ctx = MutationContext::new(Arc::clone(&inner.client));
        inner.safe_set(MutationValue {
            is_pending: true,
            ..MutationValue::default()
        });

        let request = match &inner.options.mutator {
            Some(mutator) => request.hooks(mutator(&ctx)),
            None => request,
        };
        let response = dispatch(
            Arc::clone(&inner.client.transport),
            &inner.client.base_url,
            &inner.path,
            request,
            inner.options.method,
        );

        async move {
            let outcome = match response.await {
                Ok(data) => {
                    debug!(path = %inner.path, "mutation succeeded");
                    inner.safe_set(MutationValue {
                        data: Some(data.clone()),
                        error: None,
                        is_pending: false,
                    });
                    Some(data)
                }
                Err(error) => {
                    warn!(path = %inner.path, error = %error, "mutation failed");
                    if let Some(on_error) = &inner.options.on_error {
                        on_error(&error);
                    }
                    inner.safe_set(MutationValue {
                        data: None,
                        error: Some(error),
                        is_pending: false,
                    });
                    None
                }
            };
            drop(in_flight);
            ctx.flush();
            outcome
        }
        .boxed()
    }
}

impl fmt::Debug for MutatorStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorStore")
            .field("path", &self.inner.path)
            .field("value", &self.get())
            .finish()
    }
}

impl MutatorInner {
    // Values written while nobody listens are dropped; the store resets to idle on stop.
    fn safe_set(&self, value: MutationValue) {
        if self.value.listener_count() > 0 {
            self.value.set(value);
        }
    }
}

/// Marks a mutation as running until dropped.
struct InFlight {
    store: Arc<MutatorInner>,
}

impl InFlight {
    fn acquire(store: &Arc<MutatorInner>) -> Option<Self> {
        if store.options.throttle_calls {
            store
                .in_flight
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .ok()?;
        } else {
            store.in_flight.fetch_add(1, Ordering::SeqCst);
        }
        Some(Self {
            store: Arc::clone(store),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.store.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = MutationOptions::default();
        assert!(options.throttle_calls);
        assert_eq!(options.method, Method::Post);
        assert!(CacheUpdaterOptions::default().should_revalidate);
    }

    #[test]
    fn test_value_predicates() {
        let value = MutationValue {
            data: Some(json!({ "id": 3 })),
            error: None,
            is_pending: false,
        };
        assert!(value.is_success());
        assert!(!value.is_error());
        let id: Option<serde_json::Map<String, Value>> = value.data_as().unwrap();
        assert_eq!(id.and_then(|m| m.get("id").cloned()), Some(json!(3)));
    }
}
