//! Common types for the skein atproto repository client
//!
//! Shared by every crate in the workspace: the [`HttpClient`](http_client::HttpClient)
//! abstraction with its timeout wrapper, transport errors, the core atproto
//! string types and a generic session store.

#![warn(missing_docs)]
pub use smol_str;
pub use url;

pub mod error;
/// HTTP client abstraction used by skein crates.
pub mod http_client;
/// Generic session storage traits and utilities.
pub mod session;
/// Baseline fundamental AT Protocol data types.
pub mod types;

pub use error::TransportError;
pub use http_client::{DEFAULT_TIMEOUT, HttpClient, send_with_timeout};
pub use session::{MemorySessionStore, SessionStore, SessionStoreError};
