//! Fetch orchestration.
//!
//! [`ClientInner::run_fetcher`] decides, for one key, whether to skip (app in background), join a
//! request already in flight, reuse a fresh cache entry, or start a new request. It is the only
//! place that performs network I/O and, together with the explicit cache operations on the
//! client, the only place that writes to the cache store.
//!
//! The decision runs synchronously on the caller's thread. Only the wait for the transport is
//! spawned onto the client's runtime; when it completes the result is written to the cache,
//! published to the requesting store and broadcast to every other store on the same key.
//!
//! At most one request per key is in flight: the running map holds the shared future from the
//! moment the request is registered until its result has been written back.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::Shared;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::cache::{CacheEntry, KeySelector};
use crate::client::ClientInner;
use crate::config::{QuerySettings, ResolvedSettings, RetryContext, UNBOUNDED};
use crate::error::FetchError;
use crate::events::{CacheEvent, CacheUpdate};
use crate::key::CompositeKey;
use crate::query::{QueryTarget, QueryValue};
use crate::timer::spawn_delay;
use crate::transport::FetchFuture;

/// An in-flight request that any number of callers can await.
pub type SharedFetch = Shared<FetchFuture>;

/// Produces the request future for one fetch.
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Called with every failed fetch of a query.
pub type ErrorCallback = Arc<dyn Fn(&FetchError) + Send + Sync>;

// Largest exponent of the default backoff.
const MAX_BACKOFF_EXPONENT: u32 = 8;

/// The default error retry policy.
///
/// Returns `round((r + 0.5) * 2^min(retry_attempt, 8)) * error_retry_interval` with `r` uniform
/// in `[0, 1)`: a randomized exponential backoff whose growth stops after eight failures.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn exponential_backoff(ctx: &RetryContext<'_>) -> Duration {
    let exponent = ctx.retry_attempt.min(MAX_BACKOFF_EXPONENT);
    let factor = ((rand::random::<f64>() + 0.5) * f64::from(1_u32 << exponent)).round();
    ctx.error_retry_interval
        .checked_mul(factor as u32)
        .unwrap_or(UNBOUNDED)
}

/// One request to run for a key.
#[derive(Clone)]
pub(crate) struct FetchJob {
    pub key: CompositeKey,
    pub fetcher: Fetcher,
    pub settings: QuerySettings,
    pub on_error: Option<ErrorCallback>,
    /// Whether the target already fetched this key once.
    pub refetching: bool,
}

/// What [`ClientInner::run_fetcher`] did.
pub(crate) enum FetchOutcome {
    /// The application is in the background; nothing happened.
    Skipped,
    /// The cache entry is inside the dedupe window.
    Fresh(CacheEntry),
    /// A request for the key was already in flight.
    Joined(SharedFetch),
    /// A new request was started.
    Started(SharedFetch),
}

impl ClientInner {
    /// Runs the fetch policy for `job.key`, writing state to `target` when given.
    pub(crate) fn run_fetcher(
        self: &Arc<Self>,
        job: FetchJob,
        target: Option<&Arc<QueryTarget>>,
    ) -> FetchOutcome {
        let key = job.key.key.clone();

        if !self.platform.is_app_visible() {
            debug!(key = %key, "app not visible, skipping fetch");
            return FetchOutcome::Skipped;
        }

        let settings = job.settings.merged_over(&self.settings).resolve();
        let now = Instant::now();

        let running = self.running.get(&key).map(|running| running.clone());
        if let Some(running) = running {
            return self.join(&key, running, target, job.refetching, now);
        }

        let cached = self.cache.get(&key);
        if let Some(entry) = cached
            .as_ref()
            .filter(|entry| entry.is_settled() && entry.is_fresh_within(settings.dedupe_time, now))
        {
            trace!(key = %key, "cache entry is fresh");
            if let Some(target) = target {
                let value = QueryValue::settled(entry.data.clone(), entry.error.clone());
                target.set_if_current(&key, value);
            }
            return FetchOutcome::Fresh(entry.clone());
        }
        let placeholder = cached.and_then(|entry| entry.cached_value(now).0);

        let fetcher = Arc::clone(&job.fetcher);
        let shared = async move { fetcher().await }.boxed().shared();
        match self.running.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let running = occupied.get().clone();
                drop(occupied);
                return self.join(&key, running, target, job.refetching, now);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(shared.clone());
            }
        }

        self.error_retry_timers.remove(&key);
        if let Some(target) = target {
            target.set_if_current(
                &key,
                QueryValue::pending(placeholder, job.refetching, shared.clone()),
            );
        }
        debug!(key = %key, refetching = job.refetching, "starting fetch");

        let started = shared.clone();
        let client = Arc::downgrade(self);
        let target = target.cloned();
        let request = shared.clone();
        self.runtime.spawn(async move {
            let result = request.await;
            if let Some(client) = client.upgrade() {
                let _release = RunningGuard {
                    client: &client,
                    key: &key,
                    fetch: &shared,
                };
                client.settle(&job, &settings, target.as_ref(), &shared, result);
            }
        });

        FetchOutcome::Started(started)
    }

    fn join(
        &self,
        key: &str,
        running: SharedFetch,
        target: Option<&Arc<QueryTarget>>,
        refetching: bool,
        now: Instant,
    ) -> FetchOutcome {
        debug!(key = %key, "joining in-flight fetch");
        if let Some(target) = target.filter(|target| !target.value.get().is_pending) {
            let placeholder = self.cache.get(key).and_then(|entry| entry.cached_value(now).0);
            target.set_if_current(key, QueryValue::pending(placeholder, refetching, running.clone()));
        }
        FetchOutcome::Joined(running)
    }

    /// Writes the result of a finished request.
    ///
    /// The running entry is released after the cache write and before anyone is notified, so
    /// listeners that fetch the same key again see the new entry instead of the finished request.
    fn settle(
        self: &Arc<Self>,
        job: &FetchJob,
        settings: &ResolvedSettings,
        target: Option<&Arc<QueryTarget>>,
        fetch: &SharedFetch,
        result: Result<Value, FetchError>,
    ) {
        let key = job.key.key.as_str();
        let now = Instant::now();
        let previous = self.cache.get(key);

        match result {
            Ok(data) => {
                debug!(key = %key, "fetch succeeded");
                self.cache
                    .set(key, CacheEntry::success(data.clone(), now, settings.cache_lifetime));
                self.release(key, fetch);
                self.publish(target, key, QueryValue::settled(Some(data), None));
            }
            Err(error) => {
                if let Some(on_error) = &job.on_error {
                    on_error(&error);
                }

                let retry_attempt = previous
                    .as_ref()
                    .and_then(|entry| entry.retry_attempt)
                    .unwrap_or(0)
                    .saturating_add(1);
                debug!(key = %key, retry_attempt, error = %error, "fetch failed");
                self.cache.set(
                    key,
                    CacheEntry::failure(error.clone(), now, settings.cache_lifetime, retry_attempt),
                );
                self.release(key, fetch);

                let ctx = RetryContext {
                    error: &error,
                    key,
                    retry_attempt,
                    error_retry_interval: settings.error_retry_interval,
                };
                if let Some(delay) = settings.on_error_retry.delay(&ctx) {
                    self.schedule_error_retry(key, retry_attempt, delay);
                }

                // Each store keeps the data it showed before the failure.
                if let Some(target) = target {
                    let data = target.value.get().data;
                    target.set_if_current(key, QueryValue::settled(data, Some(error.clone())));
                }
                self.broadcast(key, CacheUpdate::Failed(error));
            }
        }
    }

    fn release(&self, key: &str, fetch: &SharedFetch) {
        self.running
            .remove_if(key, |_, running| running.ptr_eq(fetch));
    }

    fn schedule_error_retry(self: &Arc<Self>, key: &str, retry_attempt: u32, delay: Duration) {
        debug!(
            key = %key,
            retry_attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling error retry"
        );

        let client = Arc::downgrade(self);
        let retry_key = key.to_string();
        let handle = spawn_delay(&self.runtime, delay, move || {
            let Some(client) = client.upgrade() else {
                return;
            };
            client.error_retry_timers.remove(&retry_key);
            // Drop data and error so the next read refetches, but keep counting failures.
            client
                .cache
                .set(retry_key.clone(), CacheEntry::retry_marker(retry_attempt));
            client
                .events
                .emit(CacheEvent::InvalidateKeys(KeySelector::Key(retry_key)));
        });
        self.error_retry_timers.insert(key.to_string(), handle);
    }

    /// Sets `target` to `value` and tells every other store on `key` about it.
    ///
    /// A target that moved to another key in the meantime is left alone.
    fn publish(&self, target: Option<&Arc<QueryTarget>>, key: &str, value: QueryValue) {
        if let Some(target) = target {
            target.set_if_current(key, value.clone());
        }
        self.broadcast(key, CacheUpdate::Replace(value));
    }

    fn broadcast(&self, key: &str, update: CacheUpdate) {
        self.events.emit(CacheEvent::SetCache {
            selector: KeySelector::Key(key.to_string()),
            update,
        });
    }
}

/// Releases the running entry even if writing the result panicked.
struct RunningGuard<'a> {
    client: &'a ClientInner,
    key: &'a str,
    fetch: &'a SharedFetch,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.client.release(self.key, self.fetch);
    }
}
