use crate::keyset::Keyset;
use crate::types::OAuthClientMetadata;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;
use url::{Host, Url};

/// The scope every atproto client must request.
pub const ATPROTO_SCOPE: &str = "atproto";

#[derive(Error, Debug, miette::Diagnostic)]
pub enum Error {
    #[error("`grant_types` must include `authorization_code`")]
    #[diagnostic(code(skein_oauth::atproto::invalid_grant_types))]
    InvalidGrantTypes,
    #[error("`scope` must include `atproto`")]
    #[diagnostic(code(skein_oauth::atproto::invalid_scope))]
    InvalidScope,
    #[error("`redirect_uris` must not be empty")]
    #[diagnostic(code(skein_oauth::atproto::empty_redirect_uris))]
    EmptyRedirectUris,
    #[error("`private_key_jwt` auth method requires `jwks` keys")]
    #[diagnostic(
        code(skein_oauth::atproto::empty_jwks),
        help("configure a Keyset, or switch to AuthMethod::None")
    )]
    EmptyJwks,
    #[error(
        "`private_key_jwt` auth method requires `token_endpoint_auth_signing_alg`, otherwise must not be provided"
    )]
    #[diagnostic(code(skein_oauth::atproto::auth_signing_alg))]
    AuthSigningAlg,
    #[error(transparent)]
    #[diagnostic(code(skein_oauth::atproto::serde_html_form))]
    SerdeHtmlForm(#[from] serde_html_form::ser::Error),
    #[error(transparent)]
    #[diagnostic(code(skein_oauth::atproto::localhost))]
    LocalhostClient(#[from] LocalhostClientError),
}

#[derive(Error, Debug, miette::Diagnostic)]
pub enum LocalhostClientError {
    #[error("invalid redirect_uri: {0}")]
    Invalid(#[from] url::ParseError),
    #[error("loopback client_id must use `http:` redirect_uri")]
    NotHttpScheme,
    #[error("loopback client_id must not use `localhost` as redirect_uri hostname")]
    Localhost,
    #[error("loopback client_id must not use loopback addresses as redirect_uri")]
    NotLoopbackHost,
}

pub type Result<T> = core::result::Result<T, Error>;

/// How the client authenticates at the token endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Public client: only `client_id` is sent
    #[default]
    None,
    // https://openid.net/specs/openid-connect-core-1_0.html#ClientAuthentication
    PrivateKeyJwt,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::PrivateKeyJwt => "private_key_jwt",
        }
    }
}

impl From<AuthMethod> for SmolStr {
    fn from(value: AuthMethod) -> Self {
        SmolStr::new_static(value.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

impl From<GrantType> for SmolStr {
    fn from(value: GrantType) -> Self {
        match value {
            GrantType::AuthorizationCode => SmolStr::new_static("authorization_code"),
            GrantType::RefreshToken => SmolStr::new_static("refresh_token"),
        }
    }
}

/// Space-separated, sorted, deduplicated scope string.
pub fn serialize_scopes(scopes: &[SmolStr]) -> SmolStr {
    let mut scopes: Vec<&str> = scopes.iter().map(SmolStr::as_str).collect();
    scopes.sort_unstable();
    scopes.dedup();
    scopes.join(" ").into()
}

pub fn localhost_client_metadata(
    redirect_uris: Option<Vec<Url>>,
    scopes: Option<&[SmolStr]>,
) -> Result<OAuthClientMetadata> {
    if let Some(redirect_uris) = &redirect_uris {
        for redirect_uri in redirect_uris {
            if redirect_uri.scheme() != "http" {
                return Err(LocalhostClientError::NotHttpScheme.into());
            }
            match redirect_uri.host() {
                Some(Host::Domain("localhost")) => {
                    return Err(LocalhostClientError::Localhost.into());
                }
                Some(Host::Ipv4(ip)) if ip.is_loopback() => {}
                Some(Host::Ipv6(ip)) if ip.is_loopback() => {}
                _ => return Err(LocalhostClientError::NotLoopbackHost.into()),
            }
        }
    }
    // the client_id encodes its own configuration
    #[derive(serde::Serialize)]
    struct Parameters<'a> {
        #[serde(skip_serializing_if = "Option::is_none")]
        redirect_uri: Option<&'a [Url]>,
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<SmolStr>,
    }
    let query = serde_html_form::to_string(Parameters {
        redirect_uri: redirect_uris.as_deref(),
        scope: scopes.map(serialize_scopes),
    })?;
    let mut client_id = String::from("http://localhost");
    if !query.is_empty() {
        client_id.push('?');
        client_id.push_str(&query);
    }
    let redirect_uris = match redirect_uris {
        Some(uris) => uris,
        None => vec![
            Url::parse("http://127.0.0.1/").map_err(LocalhostClientError::from)?,
            Url::parse("http://[::1]/").map_err(LocalhostClientError::from)?,
        ],
    };
    Ok(OAuthClientMetadata {
        client_id: Url::parse(&client_id).map_err(LocalhostClientError::from)?,
        client_uri: None,
        redirect_uris,
        scope: None,
        grant_types: None, // server defaults to `authorization_code` and `refresh_token`
        response_types: None,
        token_endpoint_auth_method: Some(AuthMethod::None.into()),
        dpop_bound_access_tokens: None,
        jwks_uri: None,
        jwks: None,
        token_endpoint_auth_signing_alg: None,
    })
}

/// Client registration as configured by the application.
#[derive(Clone, Debug, PartialEq, Eq, bon::Builder)]
pub struct AtprotoClientMetadata {
    pub client_id: Url,
    pub client_uri: Option<Url>,
    pub redirect_uris: Vec<Url>,
    #[builder(default)]
    pub token_endpoint_auth_method: AuthMethod,
    #[builder(default = vec![GrantType::AuthorizationCode, GrantType::RefreshToken])]
    pub grant_types: Vec<GrantType>,
    #[builder(default = vec![SmolStr::new_static(ATPROTO_SCOPE)])]
    pub scopes: Vec<SmolStr>,
    pub jwks_uri: Option<Url>,
    pub token_endpoint_auth_signing_alg: Option<SmolStr>,
}

pub fn atproto_client_metadata(
    metadata: AtprotoClientMetadata,
    keyset: &Option<Keyset>,
) -> Result<OAuthClientMetadata> {
    if metadata.redirect_uris.is_empty() {
        return Err(Error::EmptyRedirectUris);
    }
    if !metadata.grant_types.contains(&GrantType::AuthorizationCode) {
        return Err(Error::InvalidGrantTypes);
    }
    if !metadata.scopes.iter().any(|s| s == ATPROTO_SCOPE) {
        return Err(Error::InvalidScope);
    }
    let (jwks_uri, mut jwks) = (metadata.jwks_uri, None);
    match metadata.token_endpoint_auth_method {
        AuthMethod::None => {
            if metadata.token_endpoint_auth_signing_alg.is_some() {
                return Err(Error::AuthSigningAlg);
            }
        }
        AuthMethod::PrivateKeyJwt => {
            let Some(keyset) = keyset else {
                return Err(Error::EmptyJwks);
            };
            if metadata.token_endpoint_auth_signing_alg.is_none() {
                return Err(Error::AuthSigningAlg);
            }
            if jwks_uri.is_none() {
                jwks = Some(keyset.public_jwks());
            }
        }
    }
    Ok(OAuthClientMetadata {
        client_id: metadata.client_id,
        client_uri: metadata.client_uri,
        redirect_uris: metadata.redirect_uris,
        token_endpoint_auth_method: Some(metadata.token_endpoint_auth_method.into()),
        grant_types: Some(metadata.grant_types.into_iter().map(Into::into).collect()),
        response_types: Some(vec![SmolStr::new_static("code")]),
        scope: Some(serialize_scopes(&metadata.scopes)),
        dpop_bound_access_tokens: Some(true),
        jwks_uri,
        jwks,
        token_endpoint_auth_signing_alg: metadata.token_endpoint_auth_signing_alg,
    })
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_localhost_client_metadata_default() {
        let md = localhost_client_metadata(None, None).expect("failed to convert metadata");
        assert_eq!(md.client_id.as_str(), "http://localhost/");
        assert_eq!(
            md.redirect_uris,
            vec![
                Url::from_str("http://127.0.0.1/").unwrap(),
                Url::from_str("http://[::1]/").unwrap(),
            ]
        );
        assert_eq!(md.token_endpoint_auth_method.as_deref(), Some("none"));
        assert!(md.jwks.is_none());
    }

    #[test]
    fn test_localhost_client_metadata_custom() {
        let md = localhost_client_metadata(
            Some(vec![Url::from_str("http://127.0.0.1/callback").unwrap()]),
            Some(&["transition:generic".into(), "atproto".into()]),
        )
        .expect("failed to convert metadata");
        assert_eq!(
            md.client_id.as_str(),
            "http://localhost/?redirect_uri=http%3A%2F%2F127.0.0.1%2Fcallback&scope=atproto+transition%3Ageneric"
        );
    }

    #[test]
    fn test_localhost_client_metadata_invalid() {
        let err = localhost_client_metadata(
            Some(vec![Url::from_str("https://127.0.0.1/").unwrap()]),
            None,
        )
        .expect_err("expected to fail");
        assert!(matches!(
            err,
            Error::LocalhostClient(LocalhostClientError::NotHttpScheme)
        ));

        let err = localhost_client_metadata(
            Some(vec![Url::from_str("http://localhost:8000/").unwrap()]),
            None,
        )
        .expect_err("expected to fail");
        assert!(matches!(
            err,
            Error::LocalhostClient(LocalhostClientError::Localhost)
        ));

        let err = localhost_client_metadata(
            Some(vec![Url::from_str("http://192.168.0.0/").unwrap()]),
            None,
        )
        .expect_err("expected to fail");
        assert!(matches!(
            err,
            Error::LocalhostClient(LocalhostClientError::NotLoopbackHost)
        ));
    }

    fn base() -> AtprotoClientMetadata {
        AtprotoClientMetadata::builder()
            .client_id(Url::from_str("https://example.com/client_metadata.json").unwrap())
            .client_uri(Url::from_str("https://example.com").unwrap())
            .redirect_uris(vec![Url::from_str("https://example.com/callback").unwrap()])
            .build()
    }

    #[test]
    fn test_client_metadata_validation() {
        let mut md = base();
        md.redirect_uris.clear();
        assert!(matches!(
            atproto_client_metadata(md, &None),
            Err(Error::EmptyRedirectUris)
        ));

        let mut md = base();
        md.grant_types = vec![GrantType::RefreshToken];
        assert!(matches!(
            atproto_client_metadata(md, &None),
            Err(Error::InvalidGrantTypes)
        ));

        let mut md = base();
        md.scopes = vec!["transition:generic".into()];
        assert!(matches!(
            atproto_client_metadata(md, &None),
            Err(Error::InvalidScope)
        ));

        let mut md = base();
        md.token_endpoint_auth_signing_alg = Some("ES256".into());
        assert!(matches!(
            atproto_client_metadata(md, &None),
            Err(Error::AuthSigningAlg)
        ));
    }

    #[test]
    fn test_private_key_jwt_metadata() {
        let mut md = base();
        md.token_endpoint_auth_method = AuthMethod::PrivateKeyJwt;
        md.token_endpoint_auth_signing_alg = Some("ES256".into());
        assert!(matches!(
            atproto_client_metadata(md.clone(), &None),
            Err(Error::EmptyJwks)
        ));

        let keyset = Keyset::generate("kid00");
        let out = atproto_client_metadata(md, &Some(keyset.clone())).unwrap();
        assert_eq!(out.scope.as_deref(), Some("atproto"));
        assert_eq!(out.token_endpoint_auth_method.as_deref(), Some("private_key_jwt"));
        assert_eq!(out.dpop_bound_access_tokens, Some(true));
        assert_eq!(out.jwks, Some(keyset.public_jwks()));
        assert_eq!(
            out.grant_types,
            Some(vec!["authorization_code".into(), "refresh_token".into()])
        );
    }
}
