//! Authenticated sessions and their lifecycle: creation, refresh, logout.

use std::sync::Arc;

use bon::Builder;
use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use skein_common::session::SessionStoreError;
use skein_common::types::Did;
use smol_str::SmolStr;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use crate::{
    authstore::{ClientAuthStore, SessionKey},
    dpop::{DpopDataSource, DpopKey, ProofError, verify_token_binding},
    error::FlowError,
    flow::AuthProvider,
    types::{OAuthAuthorizationServerMetadata, TokenSet},
};

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error("no session {session_id} for {did}")]
    #[diagnostic(
        code(skein_oauth::session::not_found),
        help("the user needs to log in again")
    )]
    NotFound { did: Did, session_id: SmolStr },

    #[error("session refresh failed")]
    #[diagnostic(
        code(skein_oauth::session::refresh_failed),
        help("the session was removed; the user needs to log in again")
    )]
    RefreshFailed(#[source] Box<FlowError>),

    #[error("authorization server unreachable during refresh")]
    #[diagnostic(
        code(skein_oauth::session::unavailable),
        help("the session was kept; retry later")
    )]
    Unavailable(#[source] Box<FlowError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Proof(#[from] ProofError),

    #[error("token audience is not a URL: {0}")]
    #[diagnostic(code(skein_oauth::session::invalid_host))]
    InvalidHost(#[from] url::ParseError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] SessionStoreError),
}

impl SessionError {
    /// The stored session is gone or unusable.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            SessionError::NotFound { .. } | SessionError::RefreshFailed(_) | SessionError::Proof(_)
        )
    }
}

/// Authorization server endpoints a session talks to after login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthServerEndpoints {
    pub issuer: SmolStr,
    pub token_endpoint: SmolStr,
    pub revocation_endpoint: Option<SmolStr>,
}

impl From<&OAuthAuthorizationServerMetadata> for AuthServerEndpoints {
    fn from(md: &OAuthAuthorizationServerMetadata) -> Self {
        Self {
            issuer: md.issuer.clone(),
            token_endpoint: md.token_endpoint.clone(),
            revocation_endpoint: md.revocation_endpoint.clone(),
        }
    }
}

/// One logged-in account, bound to one DPoP key for its whole life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub account_did: Did,
    pub session_id: SmolStr,
    pub endpoints: AuthServerEndpoints,
    /// The account's PDS
    pub host_url: Url,
    pub scopes: Vec<SmolStr>,
    pub dpop_key: DpopKey,
    pub authserver_nonce: Option<SmolStr>,
    pub host_nonce: Option<SmolStr>,
    pub token_set: TokenSet,
}

impl Session {
    /// Build a session from a fresh code exchange.
    ///
    /// Fails if the access token is bound to a different key than `dpop_key`.
    pub fn create(
        session_id: impl Into<SmolStr>,
        token_set: TokenSet,
        dpop_key: DpopKey,
        endpoints: AuthServerEndpoints,
    ) -> Result<Self, SessionError> {
        verify_token_binding(&dpop_key, &token_set.access_token)?;
        let host_url = Url::parse(&token_set.aud)?;
        Ok(Self {
            account_did: token_set.sub.clone(),
            session_id: session_id.into(),
            endpoints,
            host_url,
            scopes: scopes_of(&token_set),
            dpop_key,
            authserver_nonce: None,
            host_nonce: None,
            token_set,
        })
    }

    pub fn with_authserver_nonce(mut self, nonce: Option<SmolStr>) -> Self {
        self.authserver_nonce = nonce;
        self
    }

    pub fn key(&self) -> SessionKey {
        (self.account_did.clone(), self.session_id.clone())
    }

    pub fn access_token(&self) -> &str {
        &self.token_set.access_token
    }

    fn apply(&mut self, token_set: TokenSet) {
        if token_set.scope.is_some() {
            self.scopes = scopes_of(&token_set);
        }
        self.token_set = token_set;
    }
}

fn scopes_of(token_set: &TokenSet) -> Vec<SmolStr> {
    token_set
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(SmolStr::new)
        .collect()
}

impl DpopDataSource for Session {
    fn key(&self) -> &DpopKey {
        &self.dpop_key
    }
    fn authserver_nonce(&self) -> Option<SmolStr> {
        self.authserver_nonce.clone()
    }
    fn set_authserver_nonce(&mut self, nonce: SmolStr) {
        self.authserver_nonce = Some(nonce);
    }
    fn host_nonce(&self) -> Option<SmolStr> {
        self.host_nonce.clone()
    }
    fn set_host_nonce(&mut self, nonce: SmolStr) {
        self.host_nonce = Some(nonce);
    }
}

/// `expires_at <= now + within`. No declared expiry means not expiring.
pub fn is_expiring(session: &Session, within: TimeDelta) -> bool {
    session.token_set.is_expiring(Utc::now(), within)
}

#[derive(Debug, Clone, Builder)]
pub struct SessionManagerOptions {
    /// Refresh this long before the access token expires
    #[builder(default = TimeDelta::seconds(60))]
    pub refresh_window: TimeDelta,
}

impl Default for SessionManagerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Loads, refreshes and ends sessions. Refreshes of one session never overlap.
pub struct SessionManager<S> {
    store: Arc<S>,
    provider: Arc<dyn AuthProvider>,
    locks: DashMap<SessionKey, Arc<Mutex<()>>>,
    options: SessionManagerOptions,
}

impl<S: ClientAuthStore> SessionManager<S> {
    pub fn new(store: Arc<S>, provider: Arc<dyn AuthProvider>) -> Self {
        Self::with_options(store, provider, SessionManagerOptions::default())
    }

    pub fn with_options(
        store: Arc<S>,
        provider: Arc<dyn AuthProvider>,
        options: SessionManagerOptions,
    ) -> Self {
        Self {
            store,
            provider,
            locks: DashMap::new(),
            options,
        }
    }

    pub fn options(&self) -> &SessionManagerOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn lock_for(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(key.clone()).or_default())
    }

    pub async fn save(&self, session: Session) -> Result<(), SessionError> {
        Ok(self.store.upsert_session(session).await?)
    }

    pub async fn load(&self, did: &Did, session_id: &str) -> Result<Session, SessionError> {
        self.store
            .get_session(did, session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound {
                did: did.clone(),
                session_id: SmolStr::new(session_id),
            })
    }

    /// Exchange the refresh token for new tokens, keeping the session's key.
    ///
    /// If another caller refreshed the session while this one waited, the
    /// stored result is returned as is. Rejections delete the session, and a
    /// session that is no longer stored is never refreshed.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(did = %session.account_did)))]
    pub async fn refresh(&self, session: &Session) -> Result<Session, SessionError> {
        let key = session.key();
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        let Some(stored) = self.store.get_session(&key.0, &key.1).await? else {
            return Err(SessionError::NotFound {
                did: key.0,
                session_id: key.1,
            });
        };
        if stored.token_set.access_token != session.token_set.access_token {
            #[cfg(feature = "tracing")]
            tracing::debug!("session already refreshed by another caller");
            return Ok(stored);
        }
        self.refresh_locked(stored).await
    }

    async fn refresh_locked(&self, mut session: Session) -> Result<Session, SessionError> {
        let key = session.key();
        match self.provider.refresh(&mut session).await {
            Ok(token_set) => {
                if let Err(e) = verify_token_binding(&session.dpop_key, &token_set.access_token) {
                    self.discard(&key).await;
                    return Err(e.into());
                }
                session.apply(token_set);
                self.store.upsert_session(session.clone()).await?;
                #[cfg(feature = "tracing")]
                tracing::debug!(expires_at = ?session.token_set.expires_at, "session refreshed");
                Ok(session)
            }
            Err(e) if e.is_transient() => Err(SessionError::Unavailable(Box::new(e))),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "refresh rejected, removing session");
                self.discard(&key).await;
                Err(SessionError::RefreshFailed(Box::new(e)))
            }
        }
    }

    /// Load a session, refreshing it first if it expires within `within`.
    pub async fn get_fresh(
        &self,
        did: &Did,
        session_id: &str,
        within: TimeDelta,
    ) -> Result<Session, SessionError> {
        let session = self.load(did, session_id).await?;
        if is_expiring(&session, within) {
            self.refresh(&session).await
        } else {
            Ok(session)
        }
    }

    /// Revoke the tokens (best effort) and forget the session.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(did = %did)))]
    pub async fn logout(&self, did: &Did, session_id: &str) -> Result<(), SessionError> {
        let key = (did.clone(), SmolStr::new(session_id));
        let lock = self.lock_for(&key);
        let _guard = lock.lock().await;

        if let Some(mut session) = self.store.get_session(did, session_id).await? {
            if let Err(_e) = self.provider.revoke(&mut session).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_e, "token revocation failed");
            }
        }
        self.store.delete_session(did, session_id).await?;
        self.locks.remove(&key);
        Ok(())
    }

    async fn discard(&self, key: &SessionKey) {
        if let Err(_e) = self.store.delete_session(&key.0, &key.1).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "failed to delete session");
        }
        self.locks.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authstore::MemoryAuthStore;
    use crate::error::Result as FlowResult;
    use crate::flow::{AuthorizationRequest, Discovery, PendingAuthorization};
    use crate::request::RequestError;
    use crate::types::{AuthorizeOptions, OAuthTokenType};
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use http::StatusCode;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct ScriptedProvider {
        refreshes: std::sync::Mutex<VecDeque<FlowResult<TokenSet>>>,
        refresh_calls: AtomicUsize,
        revoke_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn push(&self, result: FlowResult<TokenSet>) {
            self.refreshes.lock().unwrap().push_back(result);
        }
    }

    #[async_trait::async_trait]
    impl AuthProvider for ScriptedProvider {
        async fn discover(&self, _input: &str) -> FlowResult<Discovery> {
            unreachable!()
        }
        async fn authorize(
            &self,
            _discovery: &Discovery,
            _options: AuthorizeOptions,
        ) -> FlowResult<PendingAuthorization> {
            unreachable!()
        }
        async fn exchange(
            &self,
            _request: &mut AuthorizationRequest,
            _code: &str,
        ) -> FlowResult<TokenSet> {
            unreachable!()
        }
        async fn refresh(&self, session: &mut Session) -> FlowResult<TokenSet> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            session.set_authserver_nonce("as-nonce-2".into());
            tokio::task::yield_now().await;
            self.refreshes.lock().unwrap().pop_front().unwrap()
        }
        async fn revoke(&self, _session: &mut Session) -> FlowResult<()> {
            self.revoke_calls.fetch_add(1, Ordering::SeqCst);
            Err(FlowError::Request(RequestError::http_status(
                StatusCode::INTERNAL_SERVER_ERROR,
            )))
        }
    }

    fn token_set(access: &str, expires_in: TimeDelta) -> TokenSet {
        TokenSet {
            iss: "https://issuer.example".into(),
            sub: Did::new_static("did:plc:alice").unwrap(),
            aud: "https://pds.example/".into(),
            scope: Some("atproto transition:generic".into()),
            refresh_token: Some("refresh".into()),
            access_token: access.into(),
            token_type: OAuthTokenType::DPoP,
            expires_at: Some(Utc::now() + expires_in),
        }
    }

    fn session(expires_in: TimeDelta) -> Session {
        Session::create(
            "sid",
            token_set("old-access", expires_in),
            DpopKey::generate(),
            AuthServerEndpoints {
                issuer: "https://issuer.example".into(),
                token_endpoint: "https://issuer.example/token".into(),
                revocation_endpoint: None,
            },
        )
        .unwrap()
    }

    async fn manager(
        provider: Arc<ScriptedProvider>,
        stored: &Session,
    ) -> SessionManager<MemoryAuthStore> {
        let store = Arc::new(MemoryAuthStore::default());
        store.upsert_session(stored.clone()).await.unwrap();
        SessionManager::new(store, provider)
    }

    fn bound_jwt(jkt: &str) -> String {
        let payload = serde_json::json!({"sub": "did:plc:alice", "cnf": {"jkt": jkt}});
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256"}"#),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap())
        )
    }

    #[test]
    fn expired_an_hour_ago_is_expiring() {
        assert!(is_expiring(&session(TimeDelta::hours(-1)), TimeDelta::zero()));
        assert!(!is_expiring(&session(TimeDelta::hours(1)), TimeDelta::seconds(60)));
        let mut s = session(TimeDelta::hours(1));
        s.token_set.expires_at = None;
        assert!(!is_expiring(&s, TimeDelta::days(365)));
    }

    #[test]
    fn create_checks_binding() {
        let key = DpopKey::generate();
        let other = DpopKey::generate();
        let endpoints = AuthServerEndpoints {
            issuer: "https://issuer.example".into(),
            token_endpoint: "https://issuer.example/token".into(),
            revocation_endpoint: None,
        };
        let ok = Session::create(
            "sid",
            token_set(&bound_jwt(key.thumbprint()), TimeDelta::hours(1)),
            key.clone(),
            endpoints.clone(),
        )
        .unwrap();
        assert_eq!(ok.host_url.as_str(), "https://pds.example/");
        assert_eq!(ok.scopes, vec!["atproto", "transition:generic"]);

        let err = Session::create(
            "sid",
            token_set(&bound_jwt(other.thumbprint()), TimeDelta::hours(1)),
            key,
            endpoints,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Proof(ProofError::ThumbprintMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn refresh_keeps_key() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push(Ok(token_set("new-access", TimeDelta::hours(1))));
        let stale = session(TimeDelta::hours(-1));
        let manager = manager(provider.clone(), &stale).await;

        let fresh = manager.refresh(&stale).await.unwrap();
        assert_eq!(fresh.dpop_key.thumbprint(), stale.dpop_key.thumbprint());
        assert_eq!(fresh.access_token(), "new-access");
        assert_eq!(fresh.authserver_nonce.as_deref(), Some("as-nonce-2"));
        assert!(!is_expiring(&fresh, TimeDelta::zero()));

        let stored = manager.load(&stale.account_did, "sid").await.unwrap();
        assert_eq!(stored.access_token(), "new-access");
        assert_eq!(stored.dpop_key, stale.dpop_key);
    }

    #[tokio::test]
    async fn concurrent_refreshes_hit_the_server_once() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push(Ok(token_set("new-access", TimeDelta::hours(1))));
        let stale = session(TimeDelta::hours(-1));
        let manager = manager(provider.clone(), &stale).await;

        let (a, b) = tokio::join!(manager.refresh(&stale), manager.refresh(&stale));
        assert_eq!(a.unwrap().access_token(), "new-access");
        assert_eq!(b.unwrap().access_token(), "new-access");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_removes_session() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push(Err(FlowError::Request(RequestError::http_status_with_body(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "invalid_grant"}),
        ))));
        let stale = session(TimeDelta::hours(-1));
        let manager = manager(provider, &stale).await;

        let err = manager.refresh(&stale).await.unwrap_err();
        assert!(matches!(err, SessionError::RefreshFailed(_)));
        assert!(err.requires_login());
        assert!(matches!(
            manager.load(&stale.account_did, "sid").await,
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_server_keeps_session() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push(Err(FlowError::Request(RequestError::http_status(
            StatusCode::SERVICE_UNAVAILABLE,
        ))));
        let stale = session(TimeDelta::hours(-1));
        let manager = manager(provider, &stale).await;

        let err = manager.refresh(&stale).await.unwrap_err();
        assert!(matches!(err, SessionError::Unavailable(_)));
        assert!(!err.requires_login());
        assert!(manager.load(&stale.account_did, "sid").await.is_ok());
    }

    #[tokio::test]
    async fn refreshed_token_for_another_key_is_rejected() {
        let provider = Arc::new(ScriptedProvider::default());
        let foreign = DpopKey::generate();
        provider.push(Ok(token_set(&bound_jwt(foreign.thumbprint()), TimeDelta::hours(1))));
        let stale = session(TimeDelta::hours(-1));
        let manager = manager(provider, &stale).await;

        let err = manager.refresh(&stale).await.unwrap_err();
        assert!(matches!(err, SessionError::Proof(_)));
        assert!(manager.load(&stale.account_did, "sid").await.is_err());
    }

    #[tokio::test]
    async fn get_fresh_only_refreshes_when_needed() {
        let provider = Arc::new(ScriptedProvider::default());
        let live = session(TimeDelta::hours(1));
        let manager = manager(provider.clone(), &live).await;

        let got = manager
            .get_fresh(&live.account_did, "sid", TimeDelta::seconds(60))
            .await
            .unwrap();
        assert_eq!(got.access_token(), "old-access");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);

        provider.push(Ok(token_set("new-access", TimeDelta::hours(2))));
        let got = manager
            .get_fresh(&live.account_did, "sid", TimeDelta::hours(3))
            .await
            .unwrap();
        assert_eq!(got.access_token(), "new-access");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn logout_deletes_even_if_revocation_fails() {
        let provider = Arc::new(ScriptedProvider::default());
        let live = session(TimeDelta::hours(1));
        let manager = manager(provider.clone(), &live).await;

        manager.logout(&live.account_did, "sid").await.unwrap();
        assert_eq!(provider.revoke_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.load(&live.account_did, "sid").await,
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn refresh_after_logout_does_not_restore_session() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push(Ok(token_set("new-access", TimeDelta::hours(1))));
        let copy = session(TimeDelta::hours(-1));
        let manager = manager(provider.clone(), &copy).await;

        manager.logout(&copy.account_did, "sid").await.unwrap();
        let err = manager.refresh(&copy).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
        assert!(err.requires_login());
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
        assert!(manager.load(&copy.account_did, "sid").await.is_err());
    }

    #[tokio::test]
    async fn rejected_refresh_is_not_retried_by_a_concurrent_caller() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.push(Err(FlowError::Request(RequestError::http_status_with_body(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "invalid_grant"}),
        ))));
        provider.push(Ok(token_set("new-access", TimeDelta::hours(1))));
        let stale = session(TimeDelta::hours(-1));
        let manager = manager(provider.clone(), &stale).await;

        let (a, b) = tokio::join!(manager.refresh(&stale), manager.refresh(&stale));
        assert!(matches!(a, Err(SessionError::RefreshFailed(_))));
        assert!(matches!(b, Err(SessionError::NotFound { .. })));
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(manager.load(&stale.account_did, "sid").await.is_err());
    }
}
