//! One account's view of its repository: stored session plus record calls.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use skein_common::http_client::HttpClient;
use skein_common::types::{AtUri, Did};
use skein_identity::resolver::IdentityResolver;
use skein_oauth::authstore::ClientAuthStore;
use skein_oauth::client::OAuthClient;
use skein_oauth::session::{Session, SessionManager};
use smol_str::SmolStr;

use crate::error::{Error, Result};
use crate::records::{Cid, ListPage, Record, RecordClient, RecordRef};

/// Load the session (refreshing it when it is about to expire), make the
/// call, and if the PDS reports the token expired anyway, refresh once and
/// repeat the call.
macro_rules! with_session {
    ($agent:ident, |$session:ident| $call:expr) => {{
        let $session = $agent.session().await?;
        match $call.await {
            Err(Error::TokenExpired) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("access token rejected as expired, refreshing");
                let $session = $agent.sessions.refresh(&$session).await?;
                $call.await
            }
            other => other,
        }
    }};
}

/// Record operations on behalf of one `(did, session_id)`.
///
/// The agent holds no tokens itself; every call reads the session from the
/// store, so agents are cheap and several can share one [`SessionManager`].
pub struct Agent<S, R> {
    sessions: Arc<SessionManager<S>>,
    records: Arc<RecordClient<R>>,
    did: Did,
    session_id: SmolStr,
}

impl<S, R> Clone for Agent<S, R> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            records: self.records.clone(),
            did: self.did.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

impl<S, R> Agent<S, R>
where
    S: ClientAuthStore + 'static,
    R: IdentityResolver + HttpClient + Send + Sync,
{
    pub fn new(
        sessions: Arc<SessionManager<S>>,
        records: Arc<RecordClient<R>>,
        did: Did,
        session_id: impl Into<SmolStr>,
    ) -> Self {
        Self {
            sessions,
            records,
            did,
            session_id: session_id.into(),
        }
    }

    /// Agent for a session produced by [`OAuthClient::callback`].
    pub fn for_session(
        client: &OAuthClient<S>,
        records: Arc<RecordClient<R>>,
        session: &Session,
    ) -> Self {
        Self::new(
            client.sessions().clone(),
            records,
            session.account_did.clone(),
            session.session_id.clone(),
        )
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn records(&self) -> &RecordClient<R> {
        &self.records
    }

    /// The stored session, refreshed first if it expires within the
    /// manager's refresh window.
    pub async fn session(&self) -> Result<Session> {
        let window = self.sessions.options().refresh_window;
        Ok(self
            .sessions
            .get_fresh(&self.did, &self.session_id, window)
            .await?)
    }

    pub async fn create<T: Serialize + Sync>(
        &self,
        collection: &str,
        rkey: Option<&str>,
        value: &T,
    ) -> Result<RecordRef> {
        with_session!(self, |session| self
            .records
            .create(&session, collection, rkey, value))
    }

    pub async fn get<T: DeserializeOwned>(&self, uri: &AtUri) -> Result<Record<T>> {
        with_session!(self, |session| self.records.get(&session, uri))
    }

    pub async fn list<T: DeserializeOwned>(
        &self,
        collection: &str,
        limit: Option<u16>,
        cursor: Option<&str>,
    ) -> Result<ListPage<T>> {
        with_session!(self, |session| self
            .records
            .list(&session, collection, limit, cursor))
    }

    pub async fn update<T: Serialize + Sync>(&self, uri: &AtUri, value: &T) -> Result<Cid> {
        with_session!(self, |session| self.records.update(&session, uri, value))
    }

    pub async fn update_if<T: Serialize + Sync>(
        &self,
        uri: &AtUri,
        value: &T,
        expected: &Cid,
    ) -> Result<Cid> {
        with_session!(self, |session| self
            .records
            .update_if(&session, uri, value, expected))
    }

    pub async fn delete(&self, uri: &AtUri) -> Result<()> {
        with_session!(self, |session| self.records.delete(&session, uri))
    }

    /// Revoke the session and forget it. The agent is unusable afterwards.
    pub async fn logout(self) -> Result<()> {
        Ok(self.sessions.logout(&self.did, &self.session_id).await?)
    }
}
