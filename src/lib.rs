//! # querykit - key-addressable query cache
//!
//! querykit is a client-side data-fetching cache in the style of SWR: requests are addressed by
//! a key, concurrent requests for a key are deduplicated, results are reused within a dedupe
//! window, failures are retried with backoff, and every observer of a key is kept in sync.
//!
//! ## Architecture
//!
//! Data flows through a handful of small pieces:
//!
//! 1. **Key resolver** ([`key`]): turns literals and reactive parts into a composite key,
//!    or `None` while a part is unset
//! 2. **Cache store** ([`cache`]): what we currently believe each key resolves to
//! 3. **Fetch orchestrator** ([`fetcher`]): skip, join, reuse or fetch, then write back
//! 4. **Event bus** ([`events`]): keeps every store on a key in sync
//! 5. **Stores** ([`query`], [`mutation`]): observable values driven by their listeners
//!
//! All shared state is owned by one [`QueryClient`](client::QueryClient).
//!
//! ## Example
//!
//! ```
//! use querykit::prelude::*;
//! use querykit::transport::mock::MockTransport;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let transport = MockTransport::new();
//! transport.respond_json("/users/7", json!({ "name": "Ada" }));
//!
//! let client = QueryClient::builder("https://api.example.com")
//!     .transport(transport)
//!     .settings(QuerySettings::new().revalidate_on_focus(true))
//!     .build()?;
//!
//! let user_id: Atom<Option<KeyValue>> = Atom::new(None);
//! let user = client.use_query(
//!     KeyInput::parts([KeyPart::from("user/"), KeyPart::from(&user_id)]),
//!     "/users/:id",
//!     QueryOptions::new().request_for_key(|key| {
//!         FetchRequest::new().param("id", key.parts[1].to_string())
//!     }),
//! );
//!
//! // No id yet: the key is unset and nothing is fetched.
//! assert!(user.fetch().await.is_empty());
//!
//! user_id.set(Some(7.into()));
//! let response = user.fetch().await;
//! assert_eq!(response.data, Some(json!({ "name": "Ada" })));
//! # Ok(())
//! # }
//! ```

pub mod atom;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod key;
pub mod mutation;
pub mod platform;
pub mod prelude;
pub mod query;
pub mod timer;
pub mod transport;

mod lock;
