//! HTTP transport backed by `reqwest`.

use futures::FutureExt;
use serde_json::Value;

use super::{FetchFuture, Method, RequestContext, Transport};
use crate::error::FetchError;

/// Sends requests with a shared [`reqwest::Client`].
///
/// Bodies are sent as JSON. Responses are parsed as JSON; a body that is not JSON is returned as a
/// string, and an empty body as `null`. Non-2xx statuses become [`FetchError::Http`] carrying the
/// parsed body.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a preconfigured client (timeouts, default headers, proxies).
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, request: RequestContext) -> FetchFuture {
        let client = self.client.clone();

        async move {
            let mut builder = client
                .request(method(request.method), &request.url)
                .query(&request.query);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(network)?;
            let status = response.status();
            let text = response.text().await.map_err(network)?;
            let body = parse_body(text);

            if status.is_success() {
                Ok(body)
            } else {
                Err(FetchError::Http {
                    status: status.as_u16(),
                    message: status.canonical_reason().unwrap_or("Unknown").to_string(),
                    body: Some(body),
                })
            }
        }
        .boxed()
    }
}

fn method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

#[allow(clippy::needless_pass_by_value)]
fn network(err: reqwest::Error) -> FetchError {
    FetchError::Network(err.to_string())
}

fn parse_body(text: String) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}
