//! AT Protocol OAuth for Skein: discovery, PKCE, PAR, DPoP-bound tokens and
//! the session lifecycle that follows a login.
//!
//! [`client::OAuthClient`] is the entry point for a web layer. It drives an
//! [`flow::AuthProvider`] (the shipped one is [`flow::AtprotoProvider`]) and
//! keeps sessions in a [`authstore::ClientAuthStore`].

pub mod atproto;
pub mod authstore;
pub mod client;
pub mod dpop;
pub mod error;
pub mod flow;
pub mod jose;
pub mod keyset;
pub mod request;
pub mod resolver;
pub mod session;
pub mod types;
pub mod utils;

pub const FALLBACK_ALG: &str = "ES256";

pub use client::OAuthClient;
pub use dpop::DpopKey;
pub use error::FlowError;
pub use session::{Session, SessionError, SessionManager};
