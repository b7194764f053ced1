use jose_jwk::JwkSet;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

/// The client metadata document served at `client_id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OAuthClientMetadata {
    pub client_id: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_uri: Option<Url>,
    pub redirect_uris: Vec<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_types: Option<Vec<SmolStr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_types: Option<Vec<SmolStr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<SmolStr>,
    // https://datatracker.ietf.org/doc/html/rfc9449#section-5.2
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpop_bound_access_tokens: Option<bool>,
    // https://datatracker.ietf.org/doc/html/rfc7591#section-2
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<JwkSet>,
    // https://openid.net/specs/openid-connect-registration-1_0.html#ClientMetadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_signing_alg: Option<SmolStr>,
}
