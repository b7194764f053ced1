//! Authorization-code flow: discovery, PKCE, PAR, and the provider strategy.
//!
//! An attempt moves through [`FlowState`]. [`AuthorizationRequest`] carries the
//! per-attempt secrets (state, PKCE verifier, DPoP key) from `authorize` to the
//! callback, where the code is exchanged for a [`TokenSet`].

use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, ToSmolStr};
use url::Url;

use crate::{
    FALLBACK_ALG,
    atproto::{AtprotoClientMetadata, AuthMethod, atproto_client_metadata},
    dpop::{DpopDataSource, DpopKey},
    error::{FlowError, Result},
    keyset::Keyset,
    request::{self, OAuthMetadata},
    resolver::{OAuthResolver, ResolvedIdentity},
    session::{AuthServerEndpoints, Session},
    types::{
        AuthorizationCodeChallengeMethod, AuthorizationResponseType, AuthorizeOptions,
        OAuthAuthorizationServerMetadata, OAuthClientMetadata,
        PushedAuthorizationRequestParameters, TokenSet,
    },
    utils::{generate_nonce, generate_pkce},
};

/// How long a pending authorization request stays valid.
pub const AUTHORIZATION_REQUEST_TTL: TimeDelta = TimeDelta::minutes(10);

/// Where an authorization attempt stands.
///
/// `TokenExchanged` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    #[default]
    Init,
    EndpointResolved,
    RequestDispatched,
    CallbackPending,
    TokenExchanged,
    Failed,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::TokenExchanged | FlowState::Failed)
    }

    pub fn can_transition(self, to: FlowState) -> bool {
        use FlowState::*;
        match (self, to) {
            (from, Failed) => !from.is_terminal(),
            (Init, EndpointResolved)
            | (EndpointResolved, RequestDispatched)
            | (RequestDispatched, CallbackPending)
            | (CallbackPending, TokenExchanged) => true,
            _ => false,
        }
    }
}

/// Whether authorization parameters are pushed to the server first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParMode {
    /// Push when the server has a PAR endpoint
    #[default]
    Auto,
    /// Always push; fail if the server cannot take it
    Required,
    /// Never push; fail if the server insists on it
    Never,
}

/// A pending authorization attempt. Single use.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub state: SmolStr,
    pub verifier: SmolStr,
    pub challenge: SmolStr,
    pub login_hint: Option<SmolStr>,
    pub prompt: Option<SmolStr>,
    pub dpop_key: DpopKey,
    pub authserver_nonce: Option<SmolStr>,
    pub endpoints: AuthServerEndpoints,
    pub authorization_endpoint: SmolStr,
    /// Server announced it sends `iss` on the redirect
    pub require_iss: bool,
    pub redirect_uri: SmolStr,
    pub scopes: Vec<SmolStr>,
    pub request_uri: Option<SmolStr>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub flow_state: FlowState,
}

impl AuthorizationRequest {
    /// Fresh state, PKCE pair and DPoP key for an attempt against `server`.
    pub fn new(
        server: &OAuthAuthorizationServerMetadata,
        redirect_uri: SmolStr,
        scopes: Vec<SmolStr>,
        login_hint: Option<SmolStr>,
        prompt: Option<SmolStr>,
    ) -> Result<Self> {
        let dpop_key = DpopKey::generate_for(
            server
                .dpop_signing_alg_values_supported
                .as_deref()
                .unwrap_or(&[SmolStr::new_static(FALLBACK_ALG)]),
        )?;
        let (challenge, verifier) = generate_pkce();
        let created_at = Utc::now();
        let mut request = Self {
            state: generate_nonce(),
            verifier,
            challenge,
            login_hint,
            prompt,
            dpop_key,
            authserver_nonce: None,
            endpoints: AuthServerEndpoints::from(server),
            authorization_endpoint: server.authorization_endpoint.clone(),
            require_iss: server.authorization_response_iss_parameter_supported == Some(true),
            redirect_uri,
            scopes,
            request_uri: None,
            created_at,
            expires_at: created_at + AUTHORIZATION_REQUEST_TTL,
            flow_state: FlowState::Init,
        };
        request.advance(FlowState::EndpointResolved)?;
        Ok(request)
    }

    pub fn advance(&mut self, to: FlowState) -> Result<()> {
        if !self.flow_state.can_transition(to) {
            return Err(FlowError::InvalidTransition {
                from: self.flow_state,
                to,
            });
        }
        self.flow_state = to;
        Ok(())
    }

    pub fn fail(&mut self) {
        if !self.flow_state.is_terminal() {
            self.flow_state = FlowState::Failed;
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn issuer(&self) -> &str {
        &self.endpoints.issuer
    }

    pub fn parameters(&self) -> PushedAuthorizationRequestParameters {
        PushedAuthorizationRequestParameters {
            response_type: AuthorizationResponseType::Code,
            redirect_uri: self.redirect_uri.clone(),
            state: self.state.clone(),
            scope: (!self.scopes.is_empty()).then(|| self.scopes.join(" ").into()),
            code_challenge: self.challenge.clone(),
            code_challenge_method: AuthorizationCodeChallengeMethod::S256,
            login_hint: self.login_hint.clone(),
            prompt: self.prompt.clone(),
        }
    }
}

impl DpopDataSource for AuthorizationRequest {
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
        None
    }
    fn set_host_nonce(&mut self, _nonce: SmolStr) {}
}

impl std::fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationRequest")
            .field("issuer", &self.endpoints.issuer)
            .field("login_hint", &self.login_hint)
            .field("dpop_key", &self.dpop_key)
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .field("flow_state", &self.flow_state)
            .finish_non_exhaustive()
    }
}

/// Authorization server found for a login input.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub server_metadata: OAuthAuthorizationServerMetadata,
    pub identity: Option<ResolvedIdentity>,
    pub login_hint: Option<SmolStr>,
}

/// Where to send the user, and what to remember until they come back.
#[derive(Debug)]
pub struct PendingAuthorization {
    pub url: Url,
    pub request: AuthorizationRequest,
}

/// One way of running the authorization-code flow.
///
/// Held as `Arc<dyn AuthProvider>` so the provider is picked at runtime.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Login input (handle, DID or service URL) to authorization server.
    async fn discover(&self, input: &str) -> Result<Discovery>;

    /// Prepare the request and build the redirect URL.
    async fn authorize(
        &self,
        discovery: &Discovery,
        options: AuthorizeOptions,
    ) -> Result<PendingAuthorization>;

    /// Trade the callback code for tokens.
    async fn exchange(&self, request: &mut AuthorizationRequest, code: &str) -> Result<TokenSet>;

    /// New tokens for `session`, signed with its own DPoP key.
    async fn refresh(&self, session: &mut Session) -> Result<TokenSet>;

    /// Revoke the session's tokens. Servers without a revocation endpoint are a no-op.
    async fn revoke(&self, session: &mut Session) -> Result<()>;
}

/// Client registration plus the knobs of the atproto provider.
#[derive(Debug, Clone, Builder)]
pub struct ClientData {
    pub config: AtprotoClientMetadata,
    pub keyset: Option<Keyset>,
    #[builder(default)]
    pub par_mode: ParMode,
}

/// The atproto OAuth profile: PAR, PKCE S256, DPoP-bound tokens.
pub struct AtprotoProvider<T> {
    resolver: Arc<T>,
    client_metadata: OAuthClientMetadata,
    keyset: Option<Keyset>,
    auth_method: AuthMethod,
    par_mode: ParMode,
}

impl<T> AtprotoProvider<T> {
    pub fn new(resolver: Arc<T>, client_data: ClientData) -> Result<Self> {
        let auth_method = client_data.config.token_endpoint_auth_method;
        let client_metadata = atproto_client_metadata(client_data.config, &client_data.keyset)?;
        Ok(Self {
            resolver,
            client_metadata,
            keyset: client_data.keyset,
            auth_method,
            par_mode: client_data.par_mode,
        })
    }

    pub fn client_metadata(&self) -> &OAuthClientMetadata {
        &self.client_metadata
    }

    fn metadata(&self, server_metadata: OAuthAuthorizationServerMetadata) -> OAuthMetadata {
        OAuthMetadata {
            server_metadata,
            client_metadata: self.client_metadata.clone(),
            keyset: self.keyset.clone(),
        }
    }

    fn use_par(&self, server: &OAuthAuthorizationServerMetadata) -> Result<bool> {
        let available = server.pushed_authorization_request_endpoint.is_some();
        let required = server.require_pushed_authorization_requests == Some(true);
        match self.par_mode {
            ParMode::Required if !available => Err(FlowError::ParRequired),
            ParMode::Never if required => Err(FlowError::ParRequired),
            ParMode::Auto if required && !available => Err(FlowError::ParRequired),
            ParMode::Never => Ok(false),
            ParMode::Required | ParMode::Auto => Ok(available),
        }
    }
}

impl<T> AtprotoProvider<T>
where
    T: OAuthResolver + Send + Sync + 'static,
{
    async fn current_metadata(&self, issuer: &str) -> Result<OAuthMetadata> {
        let server = self
            .resolver
            .get_authorization_server_metadata(&Url::parse(issuer)?)
            .await?;
        Ok(self.metadata(server))
    }
}

#[derive(Serialize)]
struct ParRedirect<'a> {
    client_id: &'a str,
    request_uri: &'a str,
}

#[async_trait]
impl<T> AuthProvider for AtprotoProvider<T>
where
    T: OAuthResolver + Send + Sync + 'static,
{
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(input = %input)))]
    async fn discover(&self, input: &str) -> Result<Discovery> {
        let (server_metadata, identity) = self.resolver.resolve_oauth(input).await?;
        let login_hint = identity.as_ref().map(|_| SmolStr::new(input.trim()));
        Ok(Discovery {
            server_metadata,
            identity,
            login_hint,
        })
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %discovery.server_metadata.issuer)))]
    async fn authorize(
        &self,
        discovery: &Discovery,
        options: AuthorizeOptions,
    ) -> Result<PendingAuthorization> {
        let server = &discovery.server_metadata;
        let use_par = self.use_par(server)?;
        let redirect_uri = match options.redirect_uri {
            Some(uri) => uri.to_smolstr(),
            None => self
                .metadata(server.clone())
                .default_redirect_uri()
                .map_err(FlowError::Request)?,
        };
        let scopes = options.scopes.unwrap_or_else(|| {
            self.client_metadata
                .scope
                .as_deref()
                .unwrap_or_default()
                .split_whitespace()
                .map(SmolStr::new)
                .collect()
        });
        let mut request = AuthorizationRequest::new(
            server,
            redirect_uri,
            scopes,
            discovery.login_hint.clone(),
            options.prompt.map(Into::into),
        )?;
        let metadata = self.metadata(server.clone());
        let mut url = Url::parse(&server.authorization_endpoint)?;

        if use_par {
            let parameters = request.parameters();
            let private_key_auth = self.auth_method == AuthMethod::PrivateKeyJwt;
            let response =
                request::par(self.resolver.as_ref(), &mut request, parameters, &metadata)
                    .await
                    .map_err(|e| FlowError::from_request(e, private_key_auth))?;
            let query = serde_html_form::to_string(ParRedirect {
                client_id: metadata.client_metadata.client_id.as_str(),
                request_uri: &response.request_uri,
            })
            .map_err(|e| FlowError::Request(e.into()))?;
            url.set_query(Some(&query));
            request.request_uri = Some(response.request_uri);
        } else {
            let query = request::authorization_query(request.parameters(), &metadata)
                .map_err(FlowError::Request)?;
            url.set_query(Some(&query));
        }
        request.advance(FlowState::RequestDispatched)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(par = use_par, "authorization request dispatched");

        Ok(PendingAuthorization { url, request })
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %request.endpoints.issuer)))]
    async fn exchange(&self, request: &mut AuthorizationRequest, code: &str) -> Result<TokenSet> {
        let metadata = self.current_metadata(&request.endpoints.issuer).await?;
        let verifier = request.verifier.clone();
        let redirect_uri = request.redirect_uri.clone();
        request::exchange_code(
            self.resolver.as_ref(),
            request,
            code,
            &verifier,
            &redirect_uri,
            &metadata,
        )
        .await
        .map_err(|e| FlowError::from_request(e, self.auth_method == AuthMethod::PrivateKeyJwt))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(did = %session.account_did)))]
    async fn refresh(&self, session: &mut Session) -> Result<TokenSet> {
        let metadata = self.current_metadata(&session.endpoints.issuer).await?;
        let token_set = session.token_set.clone();
        request::refresh(self.resolver.as_ref(), session, &token_set, &metadata)
            .await
            .map_err(FlowError::Request)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(did = %session.account_did)))]
    async fn revoke(&self, session: &mut Session) -> Result<()> {
        let metadata = self.current_metadata(&session.endpoints.issuer).await?;
        if metadata.server_metadata.revocation_endpoint.is_none() {
            return Ok(());
        }
        let token = session.token_set.access_token.clone();
        request::revoke(self.resolver.as_ref(), session, &token, &metadata)
            .await
            .map_err(FlowError::Request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::pkce_challenge;

    fn server() -> OAuthAuthorizationServerMetadata {
        OAuthAuthorizationServerMetadata {
            issuer: "https://issuer.example".into(),
            authorization_endpoint: "https://issuer.example/authorize".into(),
            token_endpoint: "https://issuer.example/token".into(),
            revocation_endpoint: Some("https://issuer.example/revoke".into()),
            dpop_signing_alg_values_supported: Some(vec!["ES256".into()]),
            ..Default::default()
        }
    }

    #[test]
    fn transitions() {
        use FlowState::*;
        assert!(Init.can_transition(EndpointResolved));
        assert!(CallbackPending.can_transition(TokenExchanged));
        assert!(RequestDispatched.can_transition(Failed));
        assert!(!Init.can_transition(CallbackPending));
        assert!(!TokenExchanged.can_transition(Failed));
        assert!(!Failed.can_transition(Init));
        assert!(!CallbackPending.can_transition(RequestDispatched));
    }

    #[test]
    fn new_request_is_resolved_and_fresh() {
        let a = AuthorizationRequest::new(
            &server(),
            "https://client.example/cb".into(),
            vec!["atproto".into()],
            None,
            None,
        )
        .unwrap();
        let b = AuthorizationRequest::new(
            &server(),
            "https://client.example/cb".into(),
            vec!["atproto".into()],
            None,
            None,
        )
        .unwrap();
        assert_eq!(a.flow_state, FlowState::EndpointResolved);
        assert_eq!(a.challenge, pkce_challenge(&a.verifier));
        assert_eq!(a.verifier.len(), 58);
        assert_ne!(a.state, b.state);
        assert_ne!(a.dpop_key.thumbprint(), b.dpop_key.thumbprint());
        assert_eq!(a.expires_at - a.created_at, AUTHORIZATION_REQUEST_TTL);
        assert_eq!(a.endpoints.token_endpoint, "https://issuer.example/token");
    }

    #[test]
    fn illegal_transition_is_an_error() {
        let mut request = AuthorizationRequest::new(
            &server(),
            "https://client.example/cb".into(),
            vec![],
            None,
            None,
        )
        .unwrap();
        let err = request.advance(FlowState::TokenExchanged).unwrap_err();
        assert!(matches!(
            err,
            FlowError::InvalidTransition {
                from: FlowState::EndpointResolved,
                to: FlowState::TokenExchanged
            }
        ));
        request.fail();
        assert_eq!(request.flow_state, FlowState::Failed);
        assert!(request.advance(FlowState::RequestDispatched).is_err());
    }

    #[test]
    fn unsupported_dpop_algorithm() {
        let mut md = server();
        md.dpop_signing_alg_values_supported = Some(vec!["RS256".into()]);
        let err =
            AuthorizationRequest::new(&md, "https://client.example/cb".into(), vec![], None, None)
                .unwrap_err();
        assert!(matches!(err, FlowError::Proof(_)));
    }

    #[test]
    fn debug_hides_verifier() {
        let request = AuthorizationRequest::new(
            &server(),
            "https://client.example/cb".into(),
            vec![],
            None,
            None,
        )
        .unwrap();
        let out = format!("{request:?}");
        assert!(!out.contains(request.verifier.as_str()));
        assert!(!out.contains(request.state.as_str()));
    }

    #[test]
    fn survives_storage() {
        let request = AuthorizationRequest::new(
            &server(),
            "https://client.example/cb".into(),
            vec!["atproto".into()],
            Some("alice.example.com".into()),
            None,
        )
        .unwrap();
        let json = serde_json::to_string(&request).unwrap();
        let back: AuthorizationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dpop_key.thumbprint(), request.dpop_key.thumbprint());
        assert_eq!(back.verifier, request.verifier);
        assert_eq!(back.flow_state, FlowState::EndpointResolved);
    }
}
