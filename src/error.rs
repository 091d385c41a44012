//! Error types.
//!
//! [`FetchError`] is what a transport produces and what the cache stores for a failed key.
//! [`ClientError`] only appears while building a [`QueryClient`](crate::client::QueryClient).

use serde_json::Value;
use thiserror::Error;

/// Error type for fetch operations.
///
/// Stored verbatim in [`CacheEntry::error`](crate::cache::CacheEntry::error) and surfaced
/// through the `error` field of query and mutation values, so it is `Clone` and comparable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status code.
        status: u16,
        /// Status reason or server-provided message.
        message: String,
        /// Parsed response body, if any.
        body: Option<Value>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Fetch failed: {0}")]
    Failed(String),
}

impl FetchError {
    /// Returns the HTTP status code for [`FetchError::Http`], otherwise `None`.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Shorthand for an HTTP error without a body.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
            body: None,
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Error returned when a client cannot be constructed.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),

    #[error("a query client must be built inside a tokio runtime")]
    NoRuntime,

    #[error("no transport configured")]
    MissingTransport,
}
