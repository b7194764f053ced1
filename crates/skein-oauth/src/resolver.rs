use std::future::Future;
use std::time::Duration;

use crate::types::{OAuthAuthorizationServerMetadata, OAuthProtectedResourceMetadata};
use http::{Request, StatusCode};
use skein_common::error::TransportError;
use skein_common::http_client::{HttpClient, send_with_timeout};
use skein_common::types::{Did, Handle};
use skein_identity::SkeinResolver;
use skein_identity::resolver::{IdentityResolver, ResolutionError};
use url::Url;

/// Compare two issuer strings strictly but without spuriously failing on trivial differences.
///
/// Rules:
/// - Schemes must match exactly.
/// - Hostnames and effective ports must match (treat missing port the same as default port).
/// - Path must match, except that an empty path and `/` are equivalent.
/// - Query/fragment are not considered; if present on either side, the comparison fails.
pub(crate) fn issuer_equivalent(a: &str, b: &str) -> bool {
    fn normalize(url: &Url) -> Option<(&str, &str, u16, &str)> {
        if url.query().is_some() || url.fragment().is_some() {
            return None;
        }
        let path = match url.path() {
            "" => "/",
            other => other,
        };
        Some((url.scheme(), url.host_str()?, url.port_or_known_default()?, path))
    }

    match (Url::parse(a), Url::parse(b)) {
        (Ok(ua), Ok(ub)) => match (normalize(&ua), normalize(&ub)) {
            (Some(na), Some(nb)) => na == nb,
            _ => false,
        },
        _ => a == b,
    }
}

#[derive(thiserror::Error, Debug, miette::Diagnostic)]
pub enum ResolverError {
    #[error("resource not found")]
    #[diagnostic(
        code(skein_oauth::resolver::not_found),
        help("check the base URL or identifier")
    )]
    NotFound,
    #[error("invalid at identifier: {0}")]
    #[diagnostic(
        code(skein_oauth::resolver::at_identifier),
        help("ensure a valid handle, DID or https:// service URL was provided")
    )]
    AtIdentifier(String),
    #[error("protected resource metadata is invalid: {0}")]
    #[diagnostic(
        code(skein_oauth::resolver::protected_resource_metadata),
        help("PDS must advertise an authorization server in its protected resource metadata")
    )]
    ProtectedResourceMetadata(String),
    #[error("authorization server metadata is invalid: {0}")]
    #[diagnostic(
        code(skein_oauth::resolver::authorization_server_metadata),
        help("issuer must match and include the PDS resource")
    )]
    AuthorizationServerMetadata(String),
    #[error("error resolving identity: {0}")]
    #[diagnostic(code(skein_oauth::resolver::identity))]
    Identity(#[from] ResolutionError),
    #[error(transparent)]
    #[diagnostic(code(skein_oauth::resolver::transport))]
    Transport(#[from] TransportError),
    #[error("http status: {0:?}")]
    #[diagnostic(
        code(skein_oauth::resolver::http_status),
        help("check well-known paths and server configuration")
    )]
    HttpStatus(StatusCode),
    #[error(transparent)]
    #[diagnostic(code(skein_oauth::resolver::serde_json))]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    #[diagnostic(code(skein_oauth::resolver::url))]
    Uri(#[from] url::ParseError),
}

impl ResolverError {
    pub fn is_transient(&self) -> bool {
        match self {
            ResolverError::Transport(e) => e.is_transient(),
            ResolverError::Identity(e) => e.is_transient(),
            ResolverError::HttpStatus(s) => s.is_server_error(),
            _ => false,
        }
    }
}

/// Who the login input turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub did: Did,
    pub pds: Url,
}

async fn verify_issuer_impl<T: OAuthResolver + Sync + ?Sized>(
    resolver: &T,
    server_metadata: &OAuthAuthorizationServerMetadata,
    sub: &Did,
) -> Result<Url, ResolverError> {
    let (metadata, identity) = resolver.resolve_from_identity(sub.as_str()).await?;
    if !issuer_equivalent(&metadata.issuer, &server_metadata.issuer) {
        return Err(ResolverError::AuthorizationServerMetadata(format!(
            "issuer mismatch: {} is served by {}, not {}",
            sub, metadata.issuer, server_metadata.issuer
        )));
    }
    Ok(identity.pds)
}

async fn resolve_oauth_impl<T: OAuthResolver + Sync + ?Sized>(
    resolver: &T,
    input: &str,
) -> Result<(OAuthAuthorizationServerMetadata, Option<ResolvedIdentity>), ResolverError> {
    // Allow using an entryway, or PDS url, directly as login input (e.g.
    // when the user forgot their handle, or when the handle does not
    // resolve to a DID)
    Ok(if input.starts_with("https://") {
        let url = Url::parse(input).map_err(|_| ResolverError::NotFound)?;
        (resolver.resolve_from_service(&url).await?, None)
    } else {
        let (metadata, identity) = resolver.resolve_from_identity(input).await?;
        (metadata, Some(identity))
    })
}

async fn resolve_from_service_impl<T: OAuthResolver + Sync + ?Sized>(
    resolver: &T,
    input: &Url,
) -> Result<OAuthAuthorizationServerMetadata, ResolverError> {
    // Assume first that input is a PDS URL (as required by ATPROTO)
    if let Ok(metadata) = resolver.get_resource_server_metadata(input).await {
        return Ok(metadata);
    }
    // Fallback to trying to fetch as an issuer (Entryway)
    resolver.get_authorization_server_metadata(input).await
}

async fn resolve_from_identity_impl<T: OAuthResolver + Sync + ?Sized>(
    resolver: &T,
    input: &str,
) -> Result<(OAuthAuthorizationServerMetadata, ResolvedIdentity), ResolverError> {
    let input = input.trim();
    let did = if input.starts_with("did:") {
        Did::new(input).map_err(|e| ResolverError::AtIdentifier(e.to_string()))?
    } else {
        let handle =
            Handle::new(input).map_err(|e| ResolverError::AtIdentifier(e.to_string()))?;
        resolver.resolve_handle(&handle).await?
    };
    let pds = resolver.pds_for_did(&did).await?;
    let metadata = resolver.get_resource_server_metadata(&pds).await?;
    Ok((metadata, ResolvedIdentity { did, pds }))
}

async fn get_resource_server_metadata_impl<T: OAuthResolver + Sync + ?Sized>(
    resolver: &T,
    pds: &Url,
) -> Result<OAuthAuthorizationServerMetadata, ResolverError> {
    let rs_metadata =
        resolve_protected_resource_info(resolver, pds, resolver.options().timeout).await?;
    // ATPROTO requires one, and only one, authorization server entry
    // > That document MUST contain a single item in the authorization_servers array.
    // https://github.com/bluesky-social/proposals/tree/main/0004-oauth#server-metadata
    let issuer = match rs_metadata.authorization_servers.as_deref() {
        Some([issuer]) => issuer,
        Some([_, _, ..]) => {
            return Err(ResolverError::ProtectedResourceMetadata(format!(
                "unable to determine authorization server for PDS: {pds}"
            )));
        }
        _ => {
            return Err(ResolverError::ProtectedResourceMetadata(format!(
                "no authorization server found for PDS: {pds}"
            )));
        }
    };
    let as_metadata = resolver.get_authorization_server_metadata(issuer).await?;
    // https://datatracker.ietf.org/doc/html/draft-ietf-oauth-resource-metadata-08#name-authorization-server-metada
    if let Some(protected_resources) = &as_metadata.protected_resources {
        let resource_url = rs_metadata
            .resource
            .strip_suffix('/')
            .unwrap_or(rs_metadata.resource.as_str());
        if !protected_resources
            .iter()
            .any(|r| r.strip_suffix('/').unwrap_or(r) == resource_url)
        {
            return Err(ResolverError::AuthorizationServerMetadata(format!(
                "pds {pds}, resource {0} not protected by issuer: {issuer}, protected resources: {1:?}",
                rs_metadata.resource, protected_resources
            )));
        }
    }
    Ok(as_metadata)
}

/// Authorization server discovery layered on identity resolution.
pub trait OAuthResolver: IdentityResolver + HttpClient {
    /// Check that `sub` really is served by the issuer in `server_metadata`.
    ///
    /// Returns the PDS of `sub`.
    fn verify_issuer(
        &self,
        server_metadata: &OAuthAuthorizationServerMetadata,
        sub: &Did,
    ) -> impl Future<Output = Result<Url, ResolverError>> + Send
    where
        Self: Sync,
    {
        verify_issuer_impl(self, server_metadata, sub)
    }

    /// Login input (handle, DID, or `https://` service URL) to authorization server.
    fn resolve_oauth(
        &self,
        input: &str,
    ) -> impl Future<
        Output = Result<(OAuthAuthorizationServerMetadata, Option<ResolvedIdentity>), ResolverError>,
    > + Send
    where
        Self: Sync,
    {
        resolve_oauth_impl(self, input)
    }

    fn resolve_from_service(
        &self,
        input: &Url,
    ) -> impl Future<Output = Result<OAuthAuthorizationServerMetadata, ResolverError>> + Send
    where
        Self: Sync,
    {
        resolve_from_service_impl(self, input)
    }

    fn resolve_from_identity(
        &self,
        input: &str,
    ) -> impl Future<Output = Result<(OAuthAuthorizationServerMetadata, ResolvedIdentity), ResolverError>>
    + Send
    where
        Self: Sync,
    {
        resolve_from_identity_impl(self, input)
    }

    fn get_authorization_server_metadata(
        &self,
        issuer: &Url,
    ) -> impl Future<Output = Result<OAuthAuthorizationServerMetadata, ResolverError>> + Send
    where
        Self: Sync,
    {
        resolve_authorization_server(self, issuer, self.options().timeout)
    }

    fn get_resource_server_metadata(
        &self,
        pds: &Url,
    ) -> impl Future<Output = Result<OAuthAuthorizationServerMetadata, ResolverError>> + Send
    where
        Self: Sync,
    {
        get_resource_server_metadata_impl(self, pds)
    }
}

async fn get_json<T, M>(client: &T, url: &Url, timeout: Duration) -> Result<M, ResolverError>
where
    T: HttpClient + ?Sized,
    M: serde::de::DeserializeOwned,
{
    let req = Request::builder()
        .uri(url.as_str())
        .header(http::header::ACCEPT, "application/json")
        .body(Vec::new())
        .map_err(TransportError::from)?;
    let res = send_with_timeout(client, req, timeout).await?;
    if res.status() == StatusCode::OK {
        Ok(serde_json::from_slice(res.body())?)
    } else {
        Err(ResolverError::HttpStatus(res.status()))
    }
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(server = %server)))]
pub async fn resolve_authorization_server<T: HttpClient + ?Sized>(
    client: &T,
    server: &Url,
    timeout: Duration,
) -> Result<OAuthAuthorizationServerMetadata, ResolverError> {
    let url = server.join("/.well-known/oauth-authorization-server")?;
    let mut metadata: OAuthAuthorizationServerMetadata = get_json(client, &url, timeout).await?;
    // https://datatracker.ietf.org/doc/html/rfc8414#section-3.3
    // Accept semantically equivalent issuer (normalize to the requested URL form)
    if issuer_equivalent(&metadata.issuer, server.as_str()) {
        metadata.issuer = server.as_str().into();
        Ok(metadata)
    } else {
        Err(ResolverError::AuthorizationServerMetadata(format!(
            "invalid issuer: {}",
            metadata.issuer
        )))
    }
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(server = %server)))]
pub async fn resolve_protected_resource_info<T: HttpClient + ?Sized>(
    client: &T,
    server: &Url,
    timeout: Duration,
) -> Result<OAuthProtectedResourceMetadata, ResolverError> {
    let url = server.join("/.well-known/oauth-protected-resource")?;
    let mut metadata: OAuthProtectedResourceMetadata = get_json(client, &url, timeout).await?;
    // Accept semantically equivalent resource URL (normalize to the requested URL form)
    if issuer_equivalent(&metadata.resource, server.as_str()) {
        metadata.resource = server.as_str().into();
        Ok(metadata)
    } else {
        Err(ResolverError::ProtectedResourceMetadata(format!(
            "invalid resource: {}",
            metadata.resource
        )))
    }
}

impl<C: HttpClient + Sync + Send> OAuthResolver for SkeinResolver<C> {}

impl<T: OAuthResolver + Sync + Send> OAuthResolver for std::sync::Arc<T> {}
