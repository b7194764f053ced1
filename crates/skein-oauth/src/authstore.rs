use std::sync::Arc;

use skein_common::{
    session::{MemorySessionStore, SessionStore, SessionStoreError},
    types::Did,
};
use smol_str::SmolStr;

use crate::{flow::AuthorizationRequest, session::Session};

/// Storage key for OAuth sessions: `(account DID, session id)`.
pub type SessionKey = (Did, SmolStr);

/// Where sessions and pending authorization requests live between requests.
#[async_trait::async_trait]
pub trait ClientAuthStore: Send + Sync {
    async fn get_session(
        &self,
        did: &Did,
        session_id: &str,
    ) -> Result<Option<Session>, SessionStoreError>;

    async fn upsert_session(&self, session: Session) -> Result<(), SessionStoreError>;

    async fn delete_session(&self, did: &Did, session_id: &str) -> Result<(), SessionStoreError>;

    async fn get_auth_req_info(
        &self,
        state: &str,
    ) -> Result<Option<AuthorizationRequest>, SessionStoreError>;

    async fn save_auth_req_info(
        &self,
        auth_req_info: &AuthorizationRequest,
    ) -> Result<(), SessionStoreError>;

    async fn delete_auth_req_info(&self, state: &str) -> Result<(), SessionStoreError>;
}

/// In-process store for tests and single-instance deployments.
#[derive(Clone, Default)]
pub struct MemoryAuthStore {
    sessions: MemorySessionStore<SessionKey, Session>,
    requests: MemorySessionStore<SmolStr, AuthorizationRequest>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    pub async fn pending_count(&self) -> usize {
        self.requests.len().await
    }
}

#[async_trait::async_trait]
impl ClientAuthStore for MemoryAuthStore {
    async fn get_session(
        &self,
        did: &Did,
        session_id: &str,
    ) -> Result<Option<Session>, SessionStoreError> {
        Ok(self
            .sessions
            .get(&(did.clone(), SmolStr::new(session_id)))
            .await)
    }

    async fn upsert_session(&self, session: Session) -> Result<(), SessionStoreError> {
        self.sessions.set(session.key(), session).await
    }

    async fn delete_session(&self, did: &Did, session_id: &str) -> Result<(), SessionStoreError> {
        self.sessions
            .del(&(did.clone(), SmolStr::new(session_id)))
            .await
    }

    async fn get_auth_req_info(
        &self,
        state: &str,
    ) -> Result<Option<AuthorizationRequest>, SessionStoreError> {
        Ok(self.requests.get(&SmolStr::new(state)).await)
    }

    async fn save_auth_req_info(
        &self,
        auth_req_info: &AuthorizationRequest,
    ) -> Result<(), SessionStoreError> {
        self.requests
            .set(auth_req_info.state.clone(), auth_req_info.clone())
            .await
    }

    async fn delete_auth_req_info(&self, state: &str) -> Result<(), SessionStoreError> {
        self.requests.del(&SmolStr::new(state)).await
    }
}

#[async_trait::async_trait]
impl<T: ClientAuthStore> SessionStore<SessionKey, Session> for Arc<T> {
    /// Get the current session if present.
    async fn get(&self, key: &SessionKey) -> Option<Session> {
        let (did, session_id) = key;
        self.as_ref()
            .get_session(did, session_id)
            .await
            .ok()
            .flatten()
    }
    /// Persist the given session.
    async fn set(&self, _key: SessionKey, session: Session) -> Result<(), SessionStoreError> {
        self.as_ref().upsert_session(session).await
    }
    /// Delete the given session.
    async fn del(&self, key: &SessionKey) -> Result<(), SessionStoreError> {
        let (did, session_id) = key;
        self.as_ref().delete_session(did, session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dpop::DpopKey;
    use crate::session::AuthServerEndpoints;
    use crate::types::{OAuthAuthorizationServerMetadata, OAuthTokenType, TokenSet};

    fn session() -> Session {
        Session::create(
            "sid",
            TokenSet {
                iss: "https://issuer.example".into(),
                sub: Did::new_static("did:web:alice.example").unwrap(),
                aud: "https://alice.example/".into(),
                scope: None,
                refresh_token: None,
                access_token: "opaque".into(),
                token_type: OAuthTokenType::DPoP,
                expires_at: None,
            },
            DpopKey::generate(),
            AuthServerEndpoints {
                issuer: "https://issuer.example".into(),
                token_endpoint: "https://issuer.example/token".into(),
                revocation_endpoint: None,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sessions_round_trip_through_generic_store() {
        let store = Arc::new(MemoryAuthStore::new());
        let session = session();
        let key = session.key();

        SessionStore::set(&store, key.clone(), session.clone())
            .await
            .unwrap();
        let loaded = SessionStore::get(&store, &key).await.unwrap();
        assert_eq!(loaded.dpop_key, session.dpop_key);
        assert_eq!(store.session_count().await, 1);

        SessionStore::del(&store, &key).await.unwrap();
        assert!(store.get_session(&key.0, "sid").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_requests_by_state() {
        let store = MemoryAuthStore::new();
        let server = OAuthAuthorizationServerMetadata {
            issuer: "https://issuer.example".into(),
            authorization_endpoint: "https://issuer.example/authorize".into(),
            token_endpoint: "https://issuer.example/token".into(),
            ..Default::default()
        };
        let request = AuthorizationRequest::new(
            &server,
            "https://client.example/cb".into(),
            vec![],
            None,
            None,
        )
        .unwrap();
        store.save_auth_req_info(&request).await.unwrap();
        assert_eq!(store.pending_count().await, 1);

        let loaded = store.get_auth_req_info(&request.state).await.unwrap().unwrap();
        assert_eq!(loaded.verifier, request.verifier);
        store.delete_auth_req_info(&request.state).await.unwrap();
        assert!(store.get_auth_req_info(&request.state).await.unwrap().is_none());
    }
}
