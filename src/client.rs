//! The query client.
//!
//! A [`QueryClient`] owns every piece of shared state: the cache store, the map of running
//! requests, the error-retry and interval timers, and the event bus. Nothing is global, so any
//! number of clients can coexist in one process and never see each other's data.
//!
//! # Example
//!
//! ```
//! use querykit::prelude::*;
//! use querykit::transport::mock::MockTransport;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let transport = MockTransport::new();
//! transport.respond_json("/todos", json!(["write docs"]));
//!
//! let client = QueryClient::builder("https://api.example.com")
//!     .transport(transport.clone())
//!     .build()?;
//!
//! let todos = client.use_query("todos", "/todos", QueryOptions::default());
//! let response = todos.fetch().await;
//! assert_eq!(response.data, Some(json!(["write docs"])));
//!
//! // Fresh within the dedupe window: served from the cache.
//! todos.fetch().await;
//! assert_eq!(transport.call_count(), 1);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::atom::Unsubscribe;
use crate::cache::{CacheEntry, CacheStore, KeySelector};
use crate::config::{ClientConfig, DEFAULT_MUTATE_LIFETIME, QuerySettings};
use crate::error::{ClientError, FetchError};
use crate::events::{CacheEvent, CacheUpdate, EventBus};
use crate::fetcher::{ErrorCallback, FetchJob, FetchOutcome, Fetcher, SharedFetch};
use crate::key::{CompositeKey, KeyInput, KeyValue};
use crate::lock::mutex_lock;
use crate::mutation::{MutationOptions, MutatorStore};
use crate::platform::{DefaultPlatform, Platform};
use crate::query::{QueryOptions, QueryStore};
use crate::timer::TimerHandle;
use crate::transport::{FetchRequest, FetchResponse, Method, Transport, dispatch};

const SOURCE: &str = "client";

/// Options for [`QueryClient::fetch`].
#[derive(Clone, Default)]
pub struct FetchOptions {
    pub request: FetchRequest,
    /// Routes the call through the cache under this key. Without it the request goes straight
    /// to the transport.
    pub query_key: Option<String>,
    pub settings: QuerySettings,
    pub on_error: Option<ErrorCallback>,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn request(mut self, request: FetchRequest) -> Self {
        self.request = request;
        self
    }

    #[must_use]
    pub fn query_key(mut self, key: impl Into<String>) -> Self {
        self.query_key = Some(key.into());
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

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("request", &self.request)
            .field("query_key", &self.query_key)
            .field("settings", &self.settings)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Client state shared by every store created from it.
pub(crate) struct ClientInner {
    pub(crate) settings: QuerySettings,
    pub(crate) base_url: String,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) runtime: Handle,
    pub(crate) cache: CacheStore,
    pub(crate) events: EventBus,
    pub(crate) running: DashMap<String, SharedFetch>,
    pub(crate) error_retry_timers: DashMap<String, TimerHandle>,
    pub(crate) interval_timers: DashMap<u64, TimerHandle>,
    platform_subscriptions: Mutex<Vec<Unsubscribe>>,
    next_store_id: AtomicU64,
}

impl ClientInner {
    pub(crate) fn next_store_id(&self) -> u64 {
        self.next_store_id.fetch_add(1, Ordering::Relaxed)
    }

    /// A fetcher sending `request` to `path`.
    pub(crate) fn fetcher(&self, path: &str, request: FetchRequest, method: Method) -> Fetcher {
        let transport = Arc::clone(&self.transport);
        let base_url = self.base_url.clone();
        let path = path.to_string();
        Arc::new(move || {
            dispatch(
                Arc::clone(&transport),
                &base_url,
                &path,
                request.clone(),
                method,
            )
        })
    }

    pub(crate) fn invalidate_keys(&self, selector: KeySelector) {
        let keys = self.cache.invalidate(&selector);
        debug!(keys = ?keys, "invalidating keys");
        self.events.emit(CacheEvent::InvalidateKeys(selector));
    }

    pub(crate) fn revalidate_keys(&self, selector: KeySelector) {
        let keys = self.cache.revalidate(&selector);
        debug!(keys = ?keys, "revalidating keys");
        self.events.emit(CacheEvent::RevalidateKeys(selector));
    }

    pub(crate) fn mutate_cache(&self, selector: KeySelector, data: Option<Value>) {
        let lifetime = self.settings.cache_lifetime.unwrap_or(DEFAULT_MUTATE_LIFETIME);
        let keys = self
            .cache
            .mutate(&selector, data.as_ref(), Instant::now(), lifetime);
        debug!(keys = ?keys, deleted = data.is_none(), "mutating cache");
        self.events.emit(CacheEvent::SetCache {
            selector,
            update: CacheUpdate::Merge(data),
        });
    }

    fn watch_platform(&self) {
        let events = self.events.clone();
        let platform = Arc::downgrade(&self.platform);
        let visibility = self.platform.visibility_change_subscribe(Arc::new(move || {
            if platform.upgrade().is_some_and(|platform| platform.is_app_visible()) {
                events.emit(CacheEvent::Focus);
            }
        }));

        let events = self.events.clone();
        let reconnect = self
            .platform
            .reconnect_change_subscribe(Arc::new(move || events.emit(CacheEvent::Reconnect)));

        *mutex_lock(&self.platform_subscriptions, SOURCE, "watch_platform") =
            vec![visibility, reconnect];
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let subscriptions = std::mem::take(&mut *mutex_lock(
            &self.platform_subscriptions,
            SOURCE,
            "drop",
        ));
        for unsubscribe in subscriptions {
            unsubscribe.unsubscribe();
        }
        debug!(
            error_retry_timers = self.error_retry_timers.len(),
            interval_timers = self.interval_timers.len(),
            "query client dropped"
        );
    }
}

/// Handle to a query client.
///
/// Cloning is cheap and yields another handle to the same cache.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    /// Starts building a client whose requests go to `base_url`.
    pub fn builder(base_url: impl Into<String>) -> QueryClientBuilder {
        QueryClientBuilder::new(base_url)
    }

    /// Builds a client from loaded configuration.
    ///
    /// # Errors
    ///
    /// See [`QueryClientBuilder::build`].
    pub fn from_config(
        config: ClientConfig,
        transport: impl Transport,
    ) -> Result<Self, ClientError> {
        Self::builder(config.base_url)
            .settings(config.settings)
            .transport(transport)
            .build()
    }

    /// Client-level settings.
    pub fn settings(&self) -> &QuerySettings {
        &self.inner.settings
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Creates a query store for `key` fetching `path`.
    pub fn use_query(
        &self,
        key: impl Into<KeyInput>,
        path: impl Into<String>,
        options: QueryOptions,
    ) -> QueryStore {
        QueryStore::new(Arc::clone(&self.inner), key.into(), path.into(), options)
    }

    /// Creates a mutator store sending requests to `path`.
    pub fn use_mutation(&self, path: impl Into<String>, options: MutationOptions) -> MutatorStore {
        MutatorStore::new(Arc::clone(&self.inner), path.into(), options)
    }

    /// Requests `path`.
    ///
    /// With a `query_key` the call goes through the cache: it joins a request already in
    /// flight for the key, or returns the cached entry if it is inside the dedupe window, and
    /// only otherwise sends a request (whose result is cached and broadcast to stores on the
    /// key). Without one it is a plain transport call.
    pub async fn fetch(&self, path: &str, options: FetchOptions) -> FetchResponse {
        let FetchOptions {
            request,
            query_key,
            settings,
            on_error,
        } = options;

        let Some(key) = query_key else {
            let transport = Arc::clone(&self.inner.transport);
            return dispatch(transport, &self.inner.base_url, path, request, Method::Get)
                .await
                .into();
        };

        let job = FetchJob {
            key: CompositeKey {
                key: key.clone(),
                parts: vec![KeyValue::Str(key.clone())],
            },
            fetcher: self.inner.fetcher(path, request, Method::Get),
            settings,
            on_error,
            refetching: false,
        };

        match self.inner.run_fetcher(job, None) {
            FetchOutcome::Started(fetch) | FetchOutcome::Joined(fetch) => fetch.await.into(),
            FetchOutcome::Fresh(entry) => FetchResponse {
                data: entry.data,
                error: entry.error,
            },
            FetchOutcome::Skipped => self
                .inner
                .cache
                .get(&key)
                .map(|entry| {
                    let (data, error) = entry.cached_value(Instant::now());
                    FetchResponse { data, error }
                })
                .unwrap_or_default(),
        }
    }

    /// Deletes the selected entries; active stores on those keys refetch.
    pub fn invalidate_keys(&self, selector: impl Into<KeySelector>) {
        self.inner.invalidate_keys(selector.into());
    }

    /// Marks the selected entries as stale; active stores on those keys refetch while still
    /// showing the old data.
    pub fn revalidate_keys(&self, selector: impl Into<KeySelector>) {
        self.inner.revalidate_keys(selector.into());
    }

    /// Writes `data` to the selected entries, or deletes them when `data` is `None`.
    ///
    /// Entries live for the client's cache lifetime, or 8 seconds when it sets none.
    pub fn mutate_cache(&self, selector: impl Into<KeySelector>, data: Option<Value>) {
        self.inner.mutate_cache(selector.into(), data);
    }

    /// A copy of the cache entry for `key`.
    pub fn cache_entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner.cache.get(key)
    }

    /// Whether a request for `key` is in flight.
    pub fn is_fetching(&self, key: &str) -> bool {
        self.inner.running.contains_key(key)
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("base_url", &self.inner.base_url)
            .field("settings", &self.inner.settings)
            .field("cached", &self.inner.cache.len())
            .field("running", &self.inner.running.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder {
    base_url: String,
    settings: QuerySettings,
    transport: Option<Arc<dyn Transport>>,
    platform: Arc<dyn Platform>,
    runtime: Option<Handle>,
}

impl QueryClientBuilder {
    fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            settings: QuerySettings::default(),
            transport: None,
            platform: Arc::new(DefaultPlatform),
            runtime: None,
        }
    }

    /// Client-level settings; stores and calls override them field by field.
    #[must_use]
    pub fn settings(mut self, settings: QuerySettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    #[must_use]
    pub fn platform(mut self, platform: impl Platform) -> Self {
        self.platform = Arc::new(platform);
        self
    }

    /// Runtime for request and timer tasks. Defaults to the runtime `build` is called on.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidBaseUrl`] if the base URL does not parse,
    /// [`ClientError::NoRuntime`] when no runtime was given and `build` is not called from
    /// within a tokio runtime, and [`ClientError::MissingTransport`] when no transport was given
    /// and the `http` feature is disabled.
    pub fn build(self) -> Result<QueryClient, ClientError> {
        Url::parse(&self.base_url)?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| ClientError::NoRuntime)?,
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };

        let inner = Arc::new(ClientInner {
            settings: self.settings,
            base_url: self.base_url,
            transport,
            platform: self.platform,
            runtime,
            cache: CacheStore::new(),
            events: EventBus::new(),
            running: DashMap::new(),
            error_retry_timers: DashMap::new(),
            interval_timers: DashMap::new(),
            platform_subscriptions: Mutex::new(Vec::new()),
            next_store_id: AtomicU64::new(0),
        });
        inner.watch_platform();

        debug!(base_url = %inner.base_url, "query client created");
        Ok(QueryClient { inner })
    }
}

impl fmt::Debug for QueryClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClientBuilder")
            .field("base_url", &self.base_url)
            .field("settings", &self.settings)
            .field("transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "http")]
#[allow(clippy::unnecessary_wraps)]
fn default_transport() -> Result<Arc<dyn Transport>, ClientError> {
    Ok(Arc::new(crate::transport::http::HttpTransport::new()))
}

#[cfg(not(feature = "http"))]
fn default_transport() -> Result<Arc<dyn Transport>, ClientError> {
    Err(ClientError::MissingTransport)
}
