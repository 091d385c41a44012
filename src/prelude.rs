//! Prelude module for convenient imports.
//!
//! ```
//! use querykit::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - Owns the cache and creates stores
//! - [`QueryStore`] and [`QueryValue`] - Observable query state for one key
//! - [`MutatorStore`] and [`MutationContext`] - Writes that update or invalidate queries
//! - [`QuerySettings`] and [`ErrorRetry`] - Freshness, lifetime and retry policy
//! - [`KeyInput`], [`KeyPart`] and [`KeyValue`] - Building keys, reactive or literal
//! - [`FetchRequest`], [`FetchHooks`] and [`FetchResponse`] - Describing one request
//! - [`Transport`] and [`Platform`] - The seams to the network and the host environment

pub use crate::atom::{Atom, Unsubscribe};
pub use crate::cache::KeySelector;
pub use crate::client::{FetchOptions, QueryClient};
pub use crate::config::{ClientConfig, ErrorRetry, QuerySettings};
pub use crate::error::{ClientError, FetchError};
pub use crate::key::{KeyInput, KeyPart, KeyValue};
pub use crate::mutation::{CacheUpdaterOptions, MutationContext, MutationOptions, MutatorStore};
pub use crate::platform::{ManualPlatform, Platform};
pub use crate::query::{QueryOptions, QueryStore, QueryValue};
pub use crate::transport::{FetchHooks, FetchRequest, FetchResponse, Method, Transport};
