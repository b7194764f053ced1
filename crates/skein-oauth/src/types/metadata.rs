use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct OAuthAuthorizationServerMetadata {
    // https://datatracker.ietf.org/doc/html/rfc8414#section-2
    pub issuer: SmolStr,
    pub authorization_endpoint: SmolStr,
    pub token_endpoint: SmolStr,
    pub jwks_uri: Option<SmolStr>,
    #[serde(default)]
    pub scopes_supported: Vec<SmolStr>,
    #[serde(default)]
    pub response_types_supported: Vec<SmolStr>,
    pub grant_types_supported: Option<Vec<SmolStr>>,
    pub token_endpoint_auth_methods_supported: Option<Vec<SmolStr>>,
    pub token_endpoint_auth_signing_alg_values_supported: Option<Vec<SmolStr>>,
    pub revocation_endpoint: Option<SmolStr>,
    pub introspection_endpoint: Option<SmolStr>,
    pub code_challenge_methods_supported: Option<Vec<SmolStr>>,

    // https://datatracker.ietf.org/doc/html/rfc9126#section-5
    pub pushed_authorization_request_endpoint: Option<SmolStr>,
    pub require_pushed_authorization_requests: Option<bool>,

    // https://datatracker.ietf.org/doc/html/rfc9207#section-3
    pub authorization_response_iss_parameter_supported: Option<bool>,

    // https://datatracker.ietf.org/doc/html/rfc9449#section-5.1
    pub dpop_signing_alg_values_supported: Option<Vec<SmolStr>>,

    pub client_id_metadata_document_supported: Option<bool>,

    // https://datatracker.ietf.org/doc/html/draft-ietf-oauth-resource-metadata-08#name-authorization-server-metada
    pub protected_resources: Option<Vec<SmolStr>>,
}

impl OAuthAuthorizationServerMetadata {
    /// Whether the server accepts `method` at the token endpoint.
    ///
    /// Servers that do not advertise a list are assumed to accept anything.
    pub fn supports_auth_method(&self, method: &str) -> bool {
        self.token_endpoint_auth_methods_supported
            .as_ref()
            .is_none_or(|methods| methods.iter().any(|m| m == method))
    }
}

// https://datatracker.ietf.org/doc/html/draft-ietf-oauth-resource-metadata-08#section-2
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct OAuthProtectedResourceMetadata {
    pub resource: SmolStr,
    pub authorization_servers: Option<Vec<Url>>,
    pub jwks_uri: Option<SmolStr>,
    #[serde(default)]
    pub scopes_supported: Vec<SmolStr>,
    pub bearer_methods_supported: Option<Vec<SmolStr>>,
    pub resource_documentation: Option<SmolStr>,
}
