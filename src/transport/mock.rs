//! Scripted transport for testing.
//!
//! [`MockTransport`] answers requests from per-path responders and records every call, so
//! tests can assert exactly how many network requests the cache made.
//!
//! # Basic Usage
//!
//! ```
//! use querykit::transport::mock::MockTransport;
//! use serde_json::json;
//!
//! let mock = MockTransport::new();
//! mock.respond_json("/todos", json!([{ "id": 1, "title": "write tests" }]));
//!
//! // Hand `mock.clone()` to the client; keep `mock` to inspect calls.
//! assert_eq!(mock.call_count(), 0);
//! ```
//!
//! Responders can look at the request, which is how a test forces an error for one call:
//!
//! ```
//! use querykit::error::FetchError;
//! use querykit::transport::mock::MockTransport;
//! use serde_json::json;
//!
//! let mock = MockTransport::new();
//! mock.respond("/read", |request| {
//!     if request.headers.contains_key("x-fail") {
//!         Err(FetchError::http(500, "forced"))
//!     } else {
//!         Ok(json!("ok"))
//!     }
//! });
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tracing::trace;

use super::{FetchFuture, RequestContext, Transport};
use crate::error::FetchError;
use crate::lock::mutex_lock;

const SOURCE: &str = "transport.mock";

type Responder = Arc<dyn Fn(&RequestContext) -> Result<Value, FetchError> + Send + Sync>;

/// A transport that answers from scripted responses.
///
/// Clones share routes and the call log, so one handle can go to the client while the test
/// keeps another. Unknown paths answer with a 404 [`FetchError::Http`].
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    routes: Mutex<HashMap<String, Responder>>,
    calls: Mutex<Vec<RequestContext>>,
    latency: Mutex<Option<Duration>>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response by `latency`.
    ///
    /// With a paused tokio clock this keeps requests in flight until the test advances time.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(Some(latency));
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *mutex_lock(&self.inner.latency, SOURCE, "set_latency") = latency;
    }

    /// Answers requests to `path` with `responder`.
    pub fn respond(
        &self,
        path: impl Into<String>,
        responder: impl Fn(&RequestContext) -> Result<Value, FetchError> + Send + Sync + 'static,
    ) {
        mutex_lock(&self.inner.routes, SOURCE, "respond").insert(path.into(), Arc::new(responder));
    }

    /// Answers requests to `path` with `data`.
    pub fn respond_json(&self, path: impl Into<String>, data: Value) {
        self.respond(path, move |_| Ok(data.clone()));
    }

    /// Fails requests to `path` with `error`.
    pub fn respond_error(&self, path: impl Into<String>, error: FetchError) {
        self.respond(path, move |_| Err(error.clone()));
    }

    /// Answers successive requests to `path` with `responses` in order; the last one repeats.
    pub fn respond_sequence(
        &self,
        path: impl Into<String>,
        responses: impl IntoIterator<Item = Result<Value, FetchError>>,
    ) {
        let queue = Mutex::new(responses.into_iter().collect::<VecDeque<_>>());
        self.respond(path, move |_| {
            let mut queue = mutex_lock(&queue, SOURCE, "sequence");
            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            next.unwrap_or_else(|| Err(FetchError::Failed("response sequence is empty".into())))
        });
    }

    /// Every request received so far, oldest first.
    pub fn calls(&self) -> Vec<RequestContext> {
        mutex_lock(&self.inner.calls, SOURCE, "calls").clone()
    }

    pub fn call_count(&self) -> usize {
        mutex_lock(&self.inner.calls, SOURCE, "call_count").len()
    }

    /// Number of requests received for `path`.
    pub fn calls_to(&self, path: &str) -> usize {
        mutex_lock(&self.inner.calls, SOURCE, "calls_to")
            .iter()
            .filter(|call| call.path == path)
            .count()
    }

    pub fn clear_calls(&self) {
        mutex_lock(&self.inner.calls, SOURCE, "clear_calls").clear();
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

impl Transport for MockTransport {
    fn fetch(&self, request: RequestContext) -> FetchFuture {
        trace!(path = %request.path, method = %request.method, "mock request");
        let responder = mutex_lock(&self.inner.routes, SOURCE, "fetch")
            .get(&request.path)
            .cloned();
        let response = responder.map_or_else(
            || Err(FetchError::http(404, format!("no mock response for {}", request.path))),
            |responder| responder(&request),
        );
        let latency = *mutex_lock(&self.inner.latency, SOURCE, "fetch");
        mutex_lock(&self.inner.calls, SOURCE, "fetch").push(request);

        async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            response
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Method;
    use serde_json::json;

    fn request(path: &str) -> RequestContext {
        RequestContext {
            url: format!("http://mock{path}"),
            path: path.to_string(),
            method: Method::Get,
            query: Default::default(),
            headers: Default::default(),
            body: None,
        }
    }

    #[tokio::test]
    async fn test_respond_json_and_call_log() {
        let mock = MockTransport::new();
        mock.respond_json("/todos", json!([1, 2]));

        let data = mock.fetch(request("/todos")).await;
        assert_eq!(data, Ok(json!([1, 2])));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.calls_to("/todos"), 1);
        assert_eq!(mock.calls()[0].path, "/todos");
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let mock = MockTransport::new();
        let result = mock.fetch(request("/missing")).await;
        assert_eq!(result.map_err(|e| e.status()), Err(Some(404)));
    }

    #[tokio::test]
    async fn test_sequence_repeats_last() {
        let mock = MockTransport::new();
        mock.respond_sequence(
            "/flaky",
            [Err(FetchError::Network("reset".into())), Ok(json!("ok"))],
        );

        assert!(mock.fetch(request("/flaky")).await.is_err());
        assert_eq!(mock.fetch(request("/flaky")).await, Ok(json!("ok")));
        assert_eq!(mock.fetch(request("/flaky")).await, Ok(json!("ok")));
    }

    #[test]
    fn test_clones_share_state() {
        let mock = MockTransport::new();
        let other = mock.clone();
        other.respond_json("/a", json!(1));

        drop(mock.fetch(request("/a")));
        assert_eq!(other.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_response() {
        let mock = MockTransport::new().with_latency(Duration::from_millis(100));
        mock.respond_json("/slow", json!(true));

        let start = tokio::time::Instant::now();
        mock.fetch(request("/slow")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
