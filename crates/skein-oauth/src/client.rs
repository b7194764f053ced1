use std::sync::Arc;

use chrono::Utc;
use jose_jwk::JwkSet;
use skein_common::types::Did;
use smol_str::SmolStr;
use url::Url;

use crate::{
    authstore::ClientAuthStore,
    error::{FlowError, Result},
    flow::{AtprotoProvider, AuthProvider, ClientData, FlowState},
    keyset::Keyset,
    resolver::{OAuthResolver, issuer_equivalent},
    session::{Session, SessionError, SessionManager, SessionManagerOptions},
    types::{AuthorizeOptions, CallbackParams},
    utils::{constant_time_eq, generate_nonce},
};

/// Entry point for the web layer: start a login, finish it, and get sessions back.
pub struct OAuthClient<S> {
    provider: Arc<dyn AuthProvider>,
    store: Arc<S>,
    sessions: Arc<SessionManager<S>>,
    keyset: Option<Keyset>,
}

impl<S> OAuthClient<S>
where
    S: ClientAuthStore + 'static,
{
    pub fn new(store: S, provider: Arc<dyn AuthProvider>, keyset: Option<Keyset>) -> Self {
        let store = Arc::new(store);
        let sessions = Arc::new(SessionManager::new(store.clone(), provider.clone()));
        Self {
            provider,
            store,
            sessions,
            keyset,
        }
    }

    /// Client for the atproto OAuth profile, discovering servers through `resolver`.
    pub fn atproto<T>(store: S, resolver: T, client_data: ClientData) -> Result<Self>
    where
        T: OAuthResolver + Send + Sync + 'static,
    {
        let keyset = client_data.keyset.clone();
        let provider = AtprotoProvider::new(Arc::new(resolver), client_data)?;
        Ok(Self::new(store, Arc::new(provider), keyset))
    }

    pub fn with_session_options(self, options: SessionManagerOptions) -> Self {
        let sessions = Arc::new(SessionManager::with_options(
            self.store.clone(),
            self.provider.clone(),
            options,
        ));
        Self { sessions, ..self }
    }

    pub fn sessions(&self) -> &Arc<SessionManager<S>> {
        &self.sessions
    }

    /// Public keys for the client metadata document's `jwks_uri`.
    pub fn jwks(&self) -> JwkSet {
        self.keyset
            .as_ref()
            .map(|keyset| keyset.public_jwks())
            .unwrap_or_default()
    }

    /// Begin a login for a handle, DID or service URL. Returns where to redirect the user.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(input = %input.as_ref())))]
    pub async fn start_auth(
        &self,
        input: impl AsRef<str>,
        options: AuthorizeOptions,
    ) -> Result<Url> {
        let discovery = self.provider.discover(input.as_ref()).await?;
        let mut pending = self.provider.authorize(&discovery, options).await?;
        pending.request.advance(FlowState::CallbackPending)?;
        self.store.save_auth_req_info(&pending.request).await?;
        Ok(pending.url)
    }

    /// Finish a login from the redirect's query parameters.
    ///
    /// The pending request is consumed whatever the outcome.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub async fn callback(&self, params: CallbackParams) -> Result<Session> {
        let Some(state) = params.state.clone() else {
            return Err(FlowError::MissingState);
        };
        let Some(mut request) = self.store.get_auth_req_info(&state).await? else {
            return Err(FlowError::UnknownState(state));
        };
        self.store.delete_auth_req_info(&state).await?;

        let result = self.finish(&mut request, &state, params).await;
        if result.is_err() {
            request.fail();
        }
        result
    }

    async fn finish(
        &self,
        request: &mut crate::flow::AuthorizationRequest,
        state: &str,
        params: CallbackParams,
    ) -> Result<Session> {
        if !constant_time_eq(request.state.as_bytes(), state.as_bytes()) {
            return Err(FlowError::StateMismatch);
        }
        if request.flow_state != FlowState::CallbackPending {
            return Err(FlowError::InvalidTransition {
                from: request.flow_state,
                to: FlowState::TokenExchanged,
            });
        }
        if request.is_expired(Utc::now()) {
            return Err(FlowError::RequestExpired);
        }
        if let Some(error) = params.error {
            return Err(FlowError::Denied {
                error,
                description: params.error_description,
            });
        }
        match params.iss {
            Some(iss) if !issuer_equivalent(&iss, request.issuer()) => {
                return Err(FlowError::IssuerMismatch {
                    expected: request.endpoints.issuer.clone(),
                    actual: Some(iss),
                });
            }
            None if request.require_iss => {
                return Err(FlowError::IssuerMismatch {
                    expected: request.endpoints.issuer.clone(),
                    actual: None,
                });
            }
            _ => {}
        }
        let Some(code) = params.code else {
            return Err(FlowError::MissingCode);
        };

        let token_set = self.provider.exchange(request, &code).await?;
        request.advance(FlowState::TokenExchanged)?;

        let session = Session::create(
            generate_nonce(),
            token_set,
            request.dpop_key.clone(),
            request.endpoints.clone(),
        )?
        .with_authserver_nonce(request.authserver_nonce.clone());
        self.sessions.save(session.clone()).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(did = %session.account_did, "login complete");

        Ok(session)
    }

    /// Stored session, refreshed if it is about to expire.
    pub async fn restore(
        &self,
        did: &Did,
        session_id: &str,
    ) -> core::result::Result<Session, SessionError> {
        self.sessions
            .get_fresh(did, session_id, self.sessions.options().refresh_window)
            .await
    }

    /// Revoke the session's tokens and delete it.
    pub async fn revoke(
        &self,
        did: &Did,
        session_id: impl Into<SmolStr>,
    ) -> core::result::Result<(), SessionError> {
        self.sessions.logout(did, &session_id.into()).await
    }
}
