use chrono::{TimeDelta, Utc};
use http::{Method, Request, StatusCode};
use serde::Serialize;
use serde_json::Value;
use skein_common::types::{AtStrError, Did};
use smol_str::{SmolStr, ToSmolStr};

use crate::{
    FALLBACK_ALG,
    atproto::AuthMethod,
    dpop::{DpopDataSource, DpopError, NonceScope, wrap_request_with_dpop},
    jose::jwt::{RegisteredClaims, RegisteredClaimsAud},
    keyset::Keyset,
    resolver::OAuthResolver,
    types::{
        OAuthAuthorizationServerMetadata, OAuthClientMetadata, OAuthErrorResponse,
        OAuthParResponse, OAuthTokenResponse, PushedAuthorizationRequestParameters,
        RefreshRequestParameters, RevocationRequestParameters, TokenGrantType,
        TokenRequestParameters, TokenSet,
    },
    utils::{compare_algos, generate_nonce},
};

// https://datatracker.ietf.org/doc/html/rfc7523#section-2.2
pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// OAuth request error for token operations and auth flows
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("{kind}")]
pub struct RequestError {
    #[diagnostic_source]
    kind: RequestErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<SmolStr>,
    context: Option<SmolStr>,
    url: Option<SmolStr>,
}

/// Error categories for OAuth request operations
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RequestErrorKind {
    /// No endpoint available
    #[error("no {0} endpoint available")]
    #[diagnostic(
        code(skein_oauth::request::no_endpoint),
        help("server does not advertise this endpoint")
    )]
    NoEndpoint(SmolStr),

    /// Token response verification failed
    #[error("token response verification failed")]
    #[diagnostic(code(skein_oauth::request::token_verification))]
    TokenVerification,

    /// Unsupported authentication method
    #[error("unsupported authentication method")]
    #[diagnostic(
        code(skein_oauth::request::unsupported_auth_method),
        help(
            "server must support `private_key_jwt` or `none`; configure client metadata accordingly"
        )
    )]
    UnsupportedAuthMethod,

    /// No refresh token available
    #[error("no refresh token available")]
    #[diagnostic(code(skein_oauth::request::no_refresh_token))]
    NoRefreshToken,

    /// Invalid DID
    #[error("failed to parse DID")]
    #[diagnostic(code(skein_oauth::request::invalid_did))]
    InvalidDid,

    /// DPoP client error
    #[error("dpop error")]
    #[diagnostic(code(skein_oauth::request::dpop))]
    Dpop,

    /// Resolver error
    #[error("resolver error")]
    #[diagnostic(code(skein_oauth::request::resolver))]
    Resolver,

    /// HTTP build error
    #[error("http build error")]
    #[diagnostic(code(skein_oauth::request::http_build))]
    HttpBuild,

    /// HTTP status error
    #[error("http status: {0}")]
    #[diagnostic(
        code(skein_oauth::request::http_status),
        help("see server response for details")
    )]
    HttpStatus(StatusCode),

    /// HTTP status with error body
    #[error("http status: {status}, body: {body:?}")]
    #[diagnostic(
        code(skein_oauth::request::http_status_body),
        help("server returned error JSON; inspect fields like `error`, `error_description`")
    )]
    HttpStatusWithBody { status: StatusCode, body: Value },

    /// Keyset error
    #[error("keyset error")]
    #[diagnostic(code(skein_oauth::request::keyset))]
    Keyset,

    /// Form serialization error
    #[error("form serialization error")]
    #[diagnostic(code(skein_oauth::request::serde_form))]
    SerdeHtmlForm,

    /// JSON error
    #[error("json error")]
    #[diagnostic(code(skein_oauth::request::serde_json))]
    SerdeJson,
}

impl RequestError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: RequestErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
            url: None,
        }
    }

    /// Get the error kind
    pub fn kind(&self) -> &RequestErrorKind {
        &self.kind
    }

    /// Get the source error if present
    pub fn source_err(&self) -> Option<&BoxError> {
        self.source.as_ref()
    }

    /// Get the context string if present
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Get the URL if present
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Add help text to this error
    pub fn with_help(mut self, help: impl Into<SmolStr>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context to this error
    pub fn with_context(mut self, context: impl Into<SmolStr>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Add URL to this error
    pub fn with_url(mut self, url: impl Into<SmolStr>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// The OAuth `error` object from a 4xx response, if that is what this is.
    pub fn oauth_error(&self) -> Option<OAuthErrorResponse> {
        match &self.kind {
            RequestErrorKind::HttpStatusWithBody { body, .. } => {
                serde_json::from_value(body.clone()).ok()
            }
            _ => None,
        }
    }

    /// The underlying DPoP failure, if any.
    pub fn dpop_error(&self) -> Option<&DpopError> {
        match self.kind {
            RequestErrorKind::Dpop => self.source.as_ref()?.downcast_ref::<DpopError>(),
            _ => None,
        }
    }

    /// Worth retrying as-is: timeouts, connection failures and 5xx.
    pub fn is_transient(&self) -> bool {
        match &self.kind {
            RequestErrorKind::HttpStatus(s)
            | RequestErrorKind::HttpStatusWithBody { status: s, .. } => s.is_server_error(),
            RequestErrorKind::Dpop => matches!(
                self.dpop_error(),
                Some(DpopError::Transport(t)) if t.is_transient()
            ),
            RequestErrorKind::Resolver => self
                .source
                .as_ref()
                .and_then(|s| s.downcast_ref::<crate::resolver::ResolverError>())
                .is_some_and(|e| e.is_transient()),
            _ => false,
        }
    }

    // Constructors for each kind

    /// Create a no endpoint error
    pub fn no_endpoint(endpoint: impl Into<SmolStr>) -> Self {
        Self::new(RequestErrorKind::NoEndpoint(endpoint.into()), None)
    }

    /// Create a token verification error
    pub fn token_verification() -> Self {
        Self::new(RequestErrorKind::TokenVerification, None)
    }

    /// Create an unsupported authentication method error
    pub fn unsupported_auth_method() -> Self {
        Self::new(RequestErrorKind::UnsupportedAuthMethod, None)
    }

    /// Create a no refresh token error
    pub fn no_refresh_token() -> Self {
        Self::new(RequestErrorKind::NoRefreshToken, None)
    }

    /// Create an HTTP status error
    pub fn http_status(status: StatusCode) -> Self {
        Self::new(RequestErrorKind::HttpStatus(status), None)
    }

    /// Create an HTTP status with body error
    pub fn http_status_with_body(status: StatusCode, body: Value) -> Self {
        Self::new(RequestErrorKind::HttpStatusWithBody { status, body }, None)
    }
}

// From impls for common error types

impl From<AtStrError> for RequestError {
    fn from(e: AtStrError) -> Self {
        let msg = smol_str::format_smolstr!("{}", e);
        Self::new(RequestErrorKind::InvalidDid, Some(Box::new(e)))
            .with_context(msg)
            .with_help("the token response `sub` must be a DID")
    }
}

impl From<DpopError> for RequestError {
    fn from(e: DpopError) -> Self {
        let msg = smol_str::format_smolstr!("{}", e);
        Self::new(RequestErrorKind::Dpop, Some(Box::new(e)))
            .with_context(msg)
            .with_help("check DPoP key configuration and nonce handling")
    }
}

impl From<crate::resolver::ResolverError> for RequestError {
    fn from(e: crate::resolver::ResolverError) -> Self {
        let msg = smol_str::format_smolstr!("{}", e);
        Self::new(RequestErrorKind::Resolver, Some(Box::new(e)))
            .with_context(msg)
            .with_help("check identity resolution and OAuth metadata endpoints")
    }
}

impl From<http::Error> for RequestError {
    fn from(e: http::Error) -> Self {
        let msg = smol_str::format_smolstr!("{}", e);
        Self::new(RequestErrorKind::HttpBuild, Some(Box::new(e)))
            .with_context(msg)
            .with_help("verify request URIs and headers are valid")
    }
}

impl From<crate::keyset::Error> for RequestError {
    fn from(e: crate::keyset::Error) -> Self {
        let msg = smol_str::format_smolstr!("{}", e);
        Self::new(RequestErrorKind::Keyset, Some(Box::new(e)))
            .with_context(msg)
            .with_help("verify keyset configuration and signing algorithm support")
    }
}

impl From<serde_html_form::ser::Error> for RequestError {
    fn from(e: serde_html_form::ser::Error) -> Self {
        let msg = smol_str::format_smolstr!("{}", e);
        Self::new(RequestErrorKind::SerdeHtmlForm, Some(Box::new(e)))
            .with_context(msg)
            .with_help("check OAuth request parameters are serializable")
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(e: serde_json::Error) -> Self {
        let msg = smol_str::format_smolstr!("{}", e);
        Self::new(RequestErrorKind::SerdeJson, Some(Box::new(e)))
            .with_context(msg)
            .with_help("verify OAuth response body is valid JSON")
    }
}

pub type Result<T> = core::result::Result<T, RequestError>;

pub enum OAuthRequest {
    Token(TokenRequestParameters),
    Refresh(RefreshRequestParameters),
    Revocation(RevocationRequestParameters),
    PushedAuthorizationRequest(PushedAuthorizationRequestParameters),
}

impl OAuthRequest {
    pub fn name(&self) -> SmolStr {
        SmolStr::new_static(match self {
            Self::Token(_) => "token",
            Self::Refresh(_) => "refresh",
            Self::Revocation(_) => "revocation",
            Self::PushedAuthorizationRequest(_) => "pushed_authorization_request",
        })
    }

    pub fn expected_status(&self) -> StatusCode {
        match self {
            Self::Token(_) | Self::Refresh(_) => StatusCode::OK,
            Self::PushedAuthorizationRequest(_) => StatusCode::CREATED,
            // Unlike https://datatracker.ietf.org/doc/html/rfc7009#section-2.2, oauth-provider seems to return `204`.
            Self::Revocation(_) => StatusCode::NO_CONTENT,
        }
    }

    fn accepts(&self, status: StatusCode) -> bool {
        match self {
            Self::Revocation(_) => status.is_success(),
            _ => status == self.expected_status(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RequestPayload<T>
where
    T: Serialize,
{
    client_id: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_assertion_type: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_assertion: Option<SmolStr>,
    #[serde(flatten)]
    parameters: T,
}

/// Everything needed to talk to one authorization server as one client.
#[derive(Debug, Clone)]
pub struct OAuthMetadata {
    pub server_metadata: OAuthAuthorizationServerMetadata,
    pub client_metadata: OAuthClientMetadata,
    pub keyset: Option<Keyset>,
}

impl OAuthMetadata {
    /// First registered redirect URI.
    pub fn default_redirect_uri(&self) -> Result<SmolStr> {
        self.client_metadata
            .redirect_uris
            .first()
            .map(|u| u.to_smolstr())
            .ok_or_else(|| RequestError::no_endpoint("redirect_uri"))
    }
}

/// Push the authorization parameters, returning the `request_uri` to redirect with.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %metadata.server_metadata.issuer)))]
pub async fn par<T, D>(
    client: &T,
    data_source: &mut D,
    parameters: PushedAuthorizationRequestParameters,
    metadata: &OAuthMetadata,
) -> Result<OAuthParResponse>
where
    T: OAuthResolver + Send + Sync,
    D: DpopDataSource + Send,
{
    oauth_request(
        client,
        data_source,
        OAuthRequest::PushedAuthorizationRequest(parameters),
        metadata,
    )
    .await
}

/// Query string for a plain (non-pushed) authorization redirect.
pub fn authorization_query(
    parameters: PushedAuthorizationRequestParameters,
    metadata: &OAuthMetadata,
) -> Result<String> {
    Ok(serde_html_form::to_string(RequestPayload {
        client_id: metadata.client_metadata.client_id.to_smolstr(),
        client_assertion_type: None,
        client_assertion: None,
        parameters,
    })?)
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(did = %token_set.sub)))]
pub async fn refresh<T, D>(
    client: &T,
    data_source: &mut D,
    token_set: &TokenSet,
    metadata: &OAuthMetadata,
) -> Result<TokenSet>
where
    T: OAuthResolver + Send + Sync,
    D: DpopDataSource + Send,
{
    let Some(refresh_token) = token_set.refresh_token.clone() else {
        return Err(RequestError::no_refresh_token());
    };

    // /!\ IMPORTANT /!\
    //
    // The "sub" MUST be a DID, whose issuer authority is indeed the server we
    // are trying to obtain credentials from. Note that we are doing this
    // *before* we actually try to refresh the token:
    // 1) To avoid unnecessary refresh
    // 2) So that the refresh is the last async operation, ensuring as few
    //    async operations happen before the result gets a chance to be stored.
    let aud = client
        .verify_issuer(&metadata.server_metadata, &token_set.sub)
        .await?;

    let response: OAuthTokenResponse = oauth_request(
        client,
        data_source,
        OAuthRequest::Refresh(RefreshRequestParameters {
            grant_type: TokenGrantType::RefreshToken,
            refresh_token,
            scope: None,
        }),
        metadata,
    )
    .await?;

    if response.sub.as_ref().is_some_and(|sub| sub != token_set.sub.as_str()) {
        return Err(RequestError::token_verification()
            .with_context("refreshed token belongs to a different account"));
    }

    let mut refreshed = token_set_from_response(
        response,
        metadata.server_metadata.issuer.clone(),
        token_set.sub.clone(),
        aud.to_smolstr(),
    );
    // servers that do not rotate refresh tokens leave the old one valid
    if refreshed.refresh_token.is_none() {
        refreshed.refresh_token = token_set.refresh_token.clone();
    }
    Ok(refreshed)
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %metadata.server_metadata.issuer)))]
pub async fn exchange_code<T, D>(
    client: &T,
    data_source: &mut D,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
    metadata: &OAuthMetadata,
) -> Result<TokenSet>
where
    T: OAuthResolver + Send + Sync,
    D: DpopDataSource + Send,
{
    let token_response: OAuthTokenResponse = oauth_request(
        client,
        data_source,
        OAuthRequest::Token(TokenRequestParameters {
            grant_type: TokenGrantType::AuthorizationCode,
            code: code.into(),
            redirect_uri: redirect_uri.into(),
            code_verifier: verifier.into(),
        }),
        metadata,
    )
    .await?;
    let Some(sub) = token_response.sub.clone() else {
        return Err(RequestError::token_verification()
            .with_context("token response is missing `sub`"));
    };
    let sub = Did::new(sub)?;
    // /!\ IMPORTANT /!\
    //
    // The token_response MUST always be valid before the "sub" it contains
    // can be trusted (see Atproto's OAuth spec for details).
    let aud = client
        .verify_issuer(&metadata.server_metadata, &sub)
        .await?;

    Ok(token_set_from_response(
        token_response,
        metadata.server_metadata.issuer.clone(),
        sub,
        aud.to_smolstr(),
    ))
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
pub async fn revoke<T, D>(
    client: &T,
    data_source: &mut D,
    token: &str,
    metadata: &OAuthMetadata,
) -> Result<()>
where
    T: OAuthResolver + Send + Sync,
    D: DpopDataSource + Send,
{
    oauth_request::<(), T, D>(
        client,
        data_source,
        OAuthRequest::Revocation(RevocationRequestParameters {
            token: token.into(),
        }),
        metadata,
    )
    .await
}

fn token_set_from_response(
    response: OAuthTokenResponse,
    iss: SmolStr,
    sub: Did,
    aud: SmolStr,
) -> TokenSet {
    let expires_at = response
        .expires_in
        .and_then(|expires_in| Utc::now().checked_add_signed(TimeDelta::seconds(expires_in)));
    TokenSet {
        iss,
        sub,
        aud,
        scope: response.scope,
        access_token: response.access_token,
        refresh_token: response.refresh_token,
        token_type: response.token_type,
        expires_at,
    }
}

pub async fn oauth_request<O, T, D>(
    client: &T,
    data_source: &mut D,
    request: OAuthRequest,
    metadata: &OAuthMetadata,
) -> Result<O>
where
    T: OAuthResolver + Send + Sync,
    O: serde::de::DeserializeOwned,
    D: DpopDataSource + Send,
{
    let Some(url) = endpoint_for_req(&metadata.server_metadata, &request) else {
        return Err(RequestError::no_endpoint(request.name()));
    };
    let client_assertions = build_auth(
        metadata.keyset.as_ref(),
        &metadata.server_metadata,
        &metadata.client_metadata,
    )?;
    let body = match &request {
        OAuthRequest::Token(params) => build_oauth_req_body(client_assertions, params)?,
        OAuthRequest::Refresh(params) => build_oauth_req_body(client_assertions, params)?,
        OAuthRequest::Revocation(params) => build_oauth_req_body(client_assertions, params)?,
        OAuthRequest::PushedAuthorizationRequest(params) => {
            build_oauth_req_body(client_assertions, params)?
        }
    };
    let req = Request::builder()
        .uri(url.as_str())
        .method(Method::POST)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body.into_bytes())?;
    let res = wrap_request_with_dpop(
        client,
        data_source,
        NonceScope::AuthServer,
        req,
        client.options().timeout,
    )
    .await
    .map_err(|e| RequestError::from(e).with_url(url.clone()))?;

    if request.accepts(res.status()) {
        let body = res.body();
        if body.is_empty() {
            // since an empty body cannot be deserialized, use “null” temporarily to allow deserialization to `()`.
            Ok(serde_json::from_slice(b"null")?)
        } else {
            Ok(serde_json::from_slice(body)?)
        }
    } else if res.status().is_client_error() {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            status = %res.status(),
            request = %request.name(),
            "authorization server rejected request"
        );
        Err(RequestError::http_status_with_body(
            res.status(),
            serde_json::from_slice(res.body()).unwrap_or(Value::Null),
        )
        .with_url(url.clone()))
    } else {
        Err(RequestError::http_status(res.status()).with_url(url.clone()))
    }
}

#[inline]
fn endpoint_for_req<'r>(
    server_metadata: &'r OAuthAuthorizationServerMetadata,
    request: &OAuthRequest,
) -> Option<&'r SmolStr> {
    match request {
        OAuthRequest::Token(_) | OAuthRequest::Refresh(_) => Some(&server_metadata.token_endpoint),
        OAuthRequest::Revocation(_) => server_metadata.revocation_endpoint.as_ref(),
        OAuthRequest::PushedAuthorizationRequest(_) => server_metadata
            .pushed_authorization_request_endpoint
            .as_ref(),
    }
}

#[inline]
fn build_oauth_req_body<S>(client_assertions: ClientAuth, parameters: S) -> Result<String>
where
    S: Serialize,
{
    Ok(serde_html_form::to_string(RequestPayload {
        client_id: client_assertions.client_id,
        client_assertion_type: client_assertions.assertion_type,
        client_assertion: client_assertions.assertion,
        parameters,
    })?)
}

#[derive(Debug, Clone, Default)]
pub struct ClientAuth {
    client_id: SmolStr,
    assertion_type: Option<SmolStr>, // either none or `CLIENT_ASSERTION_TYPE_JWT_BEARER`
    assertion: Option<SmolStr>,
}

impl ClientAuth {
    pub fn new_id(client_id: SmolStr) -> Self {
        Self {
            client_id,
            assertion_type: None,
            assertion: None,
        }
    }
}

fn build_auth(
    keyset: Option<&Keyset>,
    server_metadata: &OAuthAuthorizationServerMetadata,
    client_metadata: &OAuthClientMetadata,
) -> Result<ClientAuth> {
    let client_id = client_metadata.client_id.to_smolstr();
    let method = match client_metadata.token_endpoint_auth_method.as_deref() {
        Some("private_key_jwt") => AuthMethod::PrivateKeyJwt,
        Some("none") | None => AuthMethod::None,
        Some(_) => return Err(RequestError::unsupported_auth_method()),
    };
    if !server_metadata.supports_auth_method(method.as_str()) {
        return Err(RequestError::unsupported_auth_method().with_context(
            smol_str::format_smolstr!("server does not accept `{}`", method.as_str()),
        ));
    }
    match method {
        AuthMethod::None => Ok(ClientAuth::new_id(client_id)),
        AuthMethod::PrivateKeyJwt => {
            let Some(keyset) = keyset else {
                return Err(RequestError::unsupported_auth_method()
                    .with_context("`private_key_jwt` configured without a keyset"));
            };
            let mut algs = server_metadata
                .token_endpoint_auth_signing_alg_values_supported
                .clone()
                .unwrap_or(vec![FALLBACK_ALG.into()]);
            algs.sort_by(compare_algos);
            let iat = Utc::now().timestamp();
            Ok(ClientAuth {
                client_id: client_id.clone(),
                assertion_type: Some(SmolStr::new_static(CLIENT_ASSERTION_TYPE_JWT_BEARER)),
                assertion: Some(
                    keyset.create_jwt(
                        &algs,
                        // https://datatracker.ietf.org/doc/html/rfc7523#section-3
                        RegisteredClaims {
                            iss: Some(client_id.clone()),
                            sub: Some(client_id),
                            aud: Some(RegisteredClaimsAud::Single(
                                server_metadata.issuer.clone(),
                            )),
                            exp: Some(iat + 60),
                            // "iat" is required and **MUST** be less than one minute
                            // https://datatracker.ietf.org/doc/html/rfc9101
                            iat: Some(iat),
                            // atproto oauth-provider requires "jti" to be present
                            jti: Some(generate_nonce()),
                            ..Default::default()
                        }
                        .into(),
                    )?,
                ),
            })
        }
    }
}
