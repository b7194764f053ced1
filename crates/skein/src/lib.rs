//! # Skein
//!
//! Authenticated access to an AT Protocol account's repository from a server.
//!
//! A login runs through [`oauth::OAuthClient`]: PKCE, pushed authorization
//! requests and DPoP-bound tokens. The resulting [`oauth::Session`] is kept in
//! a [`oauth::authstore::ClientAuthStore`]; [`Agent`] loads it, refreshes it
//! when it is close to expiry, and makes record calls through
//! [`RecordClient`] against the PDS that [`identity::SkeinResolver`] finds for
//! the account's DID.
//!
//! ## Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! use skein::oauth::atproto::AtprotoClientMetadata;
//! use skein::oauth::authstore::MemoryAuthStore;
//! use skein::oauth::flow::ClientData;
//! use skein::oauth::types::{AuthorizeOptions, CallbackParams};
//! use skein::{Agent, RecordClient, identity::SkeinResolver};
//! # use miette::IntoDiagnostic;
//!
//! # async fn run(params: CallbackParams) -> miette::Result<()> {
//! let resolver = Arc::new(SkeinResolver::default());
//! let config = AtprotoClientMetadata::builder()
//!     .client_id("https://app.example/client-metadata.json".parse().into_diagnostic()?)
//!     .redirect_uris(vec!["https://app.example/callback".parse().into_diagnostic()?])
//!     .build();
//! let client = skein::oauth::OAuthClient::atproto(
//!     MemoryAuthStore::new(),
//!     resolver.clone(),
//!     ClientData::builder().config(config).build(),
//! )?;
//!
//! // Send the user here...
//! let redirect = client.start_auth("alice.example", AuthorizeOptions::default()).await?;
//! # let _ = redirect;
//! // ...and finish with the query parameters of the redirect back.
//! let session = client.callback(params).await?;
//!
//! let agent = Agent::for_session(&client, Arc::new(RecordClient::new(resolver)), &session);
//! let written = agent
//!     .create("app.example.topic", None, &serde_json::json!({"title": "hello"}))
//!     .await?;
//! println!("{} @ {}", written.uri, written.cid);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod error;
pub mod records;

pub use skein_common as common;
pub use skein_identity as identity;
pub use skein_oauth as oauth;

pub use skein_common::types::{AtUri, Did};

pub use agent::Agent;
pub use error::{Error, Result};
pub use records::{CallOptions, Cid, ListPage, Record, RecordClient, RecordRef};
