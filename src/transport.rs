//! Network transport.
//!
//! The cache never talks to the network itself. It hands a [`RequestContext`] to an injected
//! [`Transport`] and gets back either a JSON payload or a [`FetchError`]. Lifecycle hooks
//! ([`FetchHooks`]) and transport-level retries are applied around any transport by
//! [`dispatch`], so they behave the same for [`MockTransport`](mock::MockTransport) and the
//! reqwest-backed `HttpTransport`.
//!
//! # Example
//!
//! ```
//! use futures::FutureExt;
//! use querykit::transport::{RequestContext, Transport, FetchFuture};
//! use serde_json::json;
//!
//! struct Echo;
//!
//! impl Transport for Echo {
//!     fn fetch(&self, request: RequestContext) -> FetchFuture {
//!         async move { Ok(json!({ "path": request.path })) }.boxed()
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::FetchError;

#[cfg(feature = "http")]
pub mod http;
pub mod mock;

/// Future returned by a transport.
pub type FetchFuture = BoxFuture<'static, Result<Value, FetchError>>;

/// Sends requests.
pub trait Transport: Send + Sync + 'static {
    /// Performs `request`. Non-success responses must be reported as `Err`.
    fn fetch(&self, request: RequestContext) -> FetchFuture;
}

impl<F> Transport for F
where
    F: Fn(RequestContext) -> FetchFuture + Send + Sync + 'static,
{
    fn fetch(&self, request: RequestContext) -> FetchFuture {
        self(request)
    }
}

/// HTTP method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request as seen by the transport and by the `on_request` hook.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    /// Absolute URL: base URL joined with `path`.
    pub url: String,
    /// Request path after `:param` substitution.
    pub path: String,
    pub method: Method,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl RequestContext {
    fn build(base_url: &str, path: &str, request: &FetchRequest, default_method: Method) -> Self {
        let path = substitute_params(path, &request.params);
        Self {
            url: join_url(base_url, &path),
            path,
            method: request.method.unwrap_or(default_method),
            query: request.query.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        }
    }
}

type RequestHook = Arc<dyn Fn(&mut RequestContext) + Send + Sync>;
type ResponseHook = Arc<dyn Fn(&RequestContext, &Result<Value, FetchError>) + Send + Sync>;
type SuccessHook = Arc<dyn Fn(&Value) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&FetchError) + Send + Sync>;
type RetryHook = Arc<dyn Fn(u32, &FetchError) + Send + Sync>;

/// Request lifecycle callbacks.
///
/// `on_request` runs once, before the first attempt, and may rewrite the request. The other
/// hooks run for every attempt.
#[derive(Clone, Default)]
pub struct FetchHooks {
    pub on_request: Option<RequestHook>,
    pub on_response: Option<ResponseHook>,
    pub on_success: Option<SuccessHook>,
    pub on_error: Option<ErrorHook>,
    pub on_retry: Option<RetryHook>,
}

impl FetchHooks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_request(mut self, f: impl Fn(&mut RequestContext) + Send + Sync + 'static) -> Self {
        self.on_request = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_response(
        mut self,
        f: impl Fn(&RequestContext, &Result<Value, FetchError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_response = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_success(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&FetchError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_retry(mut self, f: impl Fn(u32, &FetchError) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    /// Chains `other` after `self`: for each hook, `self`'s runs first.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            on_request: chain(self.on_request, other.on_request, |a, b| {
                Arc::new(move |ctx: &mut RequestContext| {
                    a(ctx);
                    b(ctx);
                })
            }),
            on_response: chain(self.on_response, other.on_response, |a, b| {
                Arc::new(move |ctx: &RequestContext, result: &Result<Value, FetchError>| {
                    a(ctx, result);
                    b(ctx, result);
                })
            }),
            on_success: chain(self.on_success, other.on_success, |a, b| {
                Arc::new(move |data: &Value| {
                    a(data);
                    b(data);
                })
            }),
            on_error: chain(self.on_error, other.on_error, |a, b| {
                Arc::new(move |error: &FetchError| {
                    a(error);
                    b(error);
                })
            }),
            on_retry: chain(self.on_retry, other.on_retry, |a, b| {
                Arc::new(move |attempt: u32, error: &FetchError| {
                    a(attempt, error);
                    b(attempt, error);
                })
            }),
        }
    }

    fn response(&self, ctx: &RequestContext, result: &Result<Value, FetchError>) {
        if let Some(hook) = &self.on_response {
            hook(ctx, result);
        }
    }

    fn success(&self, data: &Value) {
        if let Some(hook) = &self.on_success {
            hook(data);
        }
    }

    fn error(&self, error: &FetchError) {
        if let Some(hook) = &self.on_error {
            hook(error);
        }
    }

    fn retry(&self, attempt: u32, error: &FetchError) {
        if let Some(hook) = &self.on_retry {
            hook(attempt, error);
        }
    }
}

fn chain<H>(first: Option<H>, second: Option<H>, join: impl FnOnce(H, H) -> H) -> Option<H> {
    match (first, second) {
        (Some(a), Some(b)) => Some(join(a, b)),
        (a, b) => a.or(b),
    }
}

impl fmt::Debug for FetchHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHooks")
            .field("on_request", &self.on_request.is_some())
            .field("on_response", &self.on_response.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Per-call request options.
///
/// ```
/// use querykit::transport::{FetchRequest, Method};
/// use serde_json::json;
///
/// let request = FetchRequest::new()
///     .method(Method::Post)
///     .param("id", "7")
///     .query("expand", "owner")
///     .body(json!({ "done": true }));
///
/// assert_eq!(request.method, Some(Method::Post));
/// ```
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// Overrides the default method (`GET` for queries, `POST` for mutations).
    pub method: Option<Method>,
    pub query: BTreeMap<String, String>,
    /// Values substituted for `:name` segments of the path.
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    /// Extra attempts made by the transport layer after a failure.
    pub retry: u32,
    pub hooks: FetchHooks,
}

impl FetchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn retry(mut self, attempts: u32) -> Self {
        self.retry = attempts;
        self
    }

    /// Adds `hooks` after the hooks already set.
    #[must_use]
    pub fn hooks(mut self, hooks: FetchHooks) -> Self {
        self.hooks = std::mem::take(&mut self.hooks).merge(hooks);
        self
    }
}

/// Non-failing view of a fetch outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResponse {
    pub data: Option<Value>,
    pub error: Option<FetchError>,
}

impl FetchResponse {
    /// Converts back into a `Result`. An empty response is `Ok(Value::Null)`.
    pub fn into_result(self) -> Result<Value, FetchError> {
        match (self.error, self.data) {
            (Some(error), _) => Err(error),
            (None, data) => Ok(data.unwrap_or(Value::Null)),
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.data.is_none() && self.error.is_none()
    }
}

impl From<Result<Value, FetchError>> for FetchResponse {
    fn from(result: Result<Value, FetchError>) -> Self {
        match result {
            Ok(data) => Self {
                data: Some(data),
                error: None,
            },
            Err(error) => Self {
                data: None,
                error: Some(error),
            },
        }
    }
}

/// Sends `request` for `path` through `transport`, applying hooks and retries.
///
/// `on_request` runs before this function returns; the network call starts when the returned
/// future is first polled.
pub(crate) fn dispatch(
    transport: Arc<dyn Transport>,
    base_url: &str,
    path: &str,
    request: FetchRequest,
    default_method: Method,
) -> FetchFuture {
    let mut ctx = RequestContext::build(base_url, path, &request, default_method);
    let FetchRequest { retry, hooks, .. } = request;
    if let Some(hook) = &hooks.on_request {
        hook(&mut ctx);
    }

    async move {
        let mut attempt = 0;
        loop {
            debug!(path = %ctx.path, method = %ctx.method, attempt, "sending request");
            let result = transport.fetch(ctx.clone()).await;
            hooks.response(&ctx, &result);

            match result {
                Ok(data) => {
                    hooks.success(&data);
                    return Ok(data);
                }
                Err(error) => {
                    hooks.error(&error);
                    if attempt < retry {
                        attempt += 1;
                        hooks.retry(attempt, &error);
                        continue;
                    }
                    warn!(path = %ctx.path, method = %ctx.method, error = %error, "request failed");
                    return Err(error);
                }
            }
        }
    }
    .boxed()
}

fn substitute_params(path: &str, params: &BTreeMap<String, String>) -> String {
    if params.is_empty() {
        return path.to_string();
    }
    path.split('/')
        .map(|segment| {
            segment
                .strip_prefix(':')
                .and_then(|name| params.get(name))
                .map_or(segment, String::as_str)
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn join_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}
